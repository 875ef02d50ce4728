//! Administrative database operations used during a restore.

use derive_more::{Display, Error, From};
use postgres::error::SqlState;
use postgres::{Client, Config, NoTls};

use crate::config::DbEnv;

/// Database used for the admin connection if the configured one is the
/// database being restored, which can't be renamed while connected to it.
const MAINTENANCE_DB: &str = "postgres";

#[derive(Debug, Display, Error, From)]
pub enum DbError {
    #[display("database error: {_0}")]
    Postgres(postgres::Error),
    #[from(ignore)]
    #[display("database refused: {_0}")]
    Rejected(#[error(ignore)] String),
}

/// Statements run on the admin connection.
pub trait DatabaseAdmin {
    fn database_exists(&mut self, name: &str) -> Result<bool, DbError>;

    /// Rename `from` to `to`, terminating other sessions on `from` first.
    fn rename_database(&mut self, from: &str, to: &str) -> Result<(), DbError>;

    fn create_database(&mut self, name: &str, owner: &str) -> Result<(), DbError>;

    /// Drop `name` if it exists.
    fn drop_database(&mut self, name: &str) -> Result<(), DbError>;

    fn close(self: Box<Self>) -> Result<(), DbError>;
}

/// Opens database connections for a restore.
pub trait AdminConnector {
    /// Check whether the target database exists by connecting to it with the
    /// primary credentials.
    fn probe(&self, db: &DbEnv) -> Result<bool, DbError>;

    /// Open the admin connection.
    fn connect(&self, db: &DbEnv) -> Result<Box<dyn DatabaseAdmin>, DbError>;
}

/// Quote an identifier for use in SQL text.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// [AdminConnector] for a PostgreSQL server.
#[derive(Debug, Default, Clone)]
pub struct PgConnector;

impl AdminConnector for PgConnector {
    fn probe(&self, db: &DbEnv) -> Result<bool, DbError> {
        let connected = Config::new()
            .host(&db.host)
            .port(db.port)
            .user(&db.user)
            .password(&db.password)
            .dbname(&db.name)
            .connect(NoTls);
        match connected {
            Ok(client) => {
                client.close()?;
                Ok(true)
            }
            Err(e) if e.code() == Some(&SqlState::INVALID_CATALOG_NAME) => {
                log::info!(target: "restore::db", "Database {} doesn't exist yet", db.name);
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn connect(&self, db: &DbEnv) -> Result<Box<dyn DatabaseAdmin>, DbError> {
        let dbname = if db.admin_name == db.name {
            log::debug!(
                target: "restore::db",
                "Admin database is the restore target, connecting to {MAINTENANCE_DB} instead"
            );
            MAINTENANCE_DB
        } else {
            db.admin_name.as_str()
        };
        log::debug!(target: "restore::db", "Connecting as {} to {dbname} on {}:{}", db.admin_user, db.host, db.port);
        let client = Config::new()
            .host(&db.host)
            .port(db.port)
            .user(&db.admin_user)
            .password(&db.admin_password)
            .dbname(dbname)
            .connect(NoTls)?;
        Ok(Box::new(PgAdmin { client }))
    }
}

struct PgAdmin {
    client: Client,
}

impl DatabaseAdmin for PgAdmin {
    fn database_exists(&mut self, name: &str) -> Result<bool, DbError> {
        let row = self
            .client
            .query_opt("SELECT 1 FROM pg_database WHERE datname = $1", &[&name])?;
        Ok(row.is_some())
    }

    fn rename_database(&mut self, from: &str, to: &str) -> Result<(), DbError> {
        self.client.execute(
            "SELECT pg_terminate_backend(pid) FROM pg_stat_activity WHERE datname = $1 AND pid <> pg_backend_pid()",
            &[&from],
        )?;
        let statement = format!("ALTER DATABASE {} RENAME TO {}", quote_ident(from), quote_ident(to));
        self.client.batch_execute(&statement)?;
        Ok(())
    }

    fn create_database(&mut self, name: &str, owner: &str) -> Result<(), DbError> {
        let statement = format!("CREATE DATABASE {} OWNER {}", quote_ident(name), quote_ident(owner));
        self.client.batch_execute(&statement)?;
        Ok(())
    }

    fn drop_database(&mut self, name: &str) -> Result<(), DbError> {
        self.client
            .batch_execute(&format!("DROP DATABASE IF EXISTS {}", quote_ident(name)))?;
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<(), DbError> {
        self.client.close()?;
        Ok(())
    }
}
