//! Implements the database dump using [Postgres].

use super::{Backend, SnapshotContext, SnapshotError};
use crate::archive::{ArchiveWriter, DUMP_FILE};
use crate::config::DbEnv;
use crate::process::CommandSpec;
use crate::util::fs::remove_file_if_exists;

/// The [Postgres] backend stores a plain SQL dump of the site database as
/// `database.sql`.
pub struct Postgres;

/// Connection options shared by `pg_dump` and `psql`.
///
/// The password is handed over in the environment, never on the command line.
pub(crate) fn connect(spec: CommandSpec, host: &str, port: u16, user: &str, password: &str) -> CommandSpec {
    spec.arg(format!("--host={host}"))
        .arg(format!("--port={port}"))
        .arg(format!("--username={user}"))
        .arg("--no-password")
        .env("PGPASSWORD", password)
}

/// `pg_dump` invocation writing the plain dump of `db` to stdout.
pub(crate) fn dump_command(db: &DbEnv) -> CommandSpec {
    connect(CommandSpec::new("pg_dump"), &db.host, db.port, &db.user, &db.password)
        .arg("--format=plain")
        .arg(format!("--dbname={}", db.name))
}

impl Backend for Postgres {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn snapshot(&self, ctx: &SnapshotContext<'_>, archive: &mut ArchiveWriter) -> Result<(), SnapshotError> {
        log::info!(target: "backend::postgres", "Create database dump of: {}", ctx.db.name);
        log::trace!(target: "backend::postgres", "Using user '{}' on {}:{}", ctx.db.user, ctx.db.host, ctx.db.port);

        let dump = ctx.staging.join(DUMP_FILE);
        ctx.runner.run(&dump_command(ctx.db).stdout_to(&dump))?;

        archive.append_file(&dump, DUMP_FILE)?;
        remove_file_if_exists(&dump).map_err(SnapshotError::io("removing database dump"))?;
        log::info!(target: "backend::postgres", "Finished database dump.");
        Ok(())
    }
}
