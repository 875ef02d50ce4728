#![allow(dead_code)]

use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::Path;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};

use site_backup_lib::config::{DbEnv, RepositorySettings, Settings};
use site_backup_lib::notify::{Notification, Notifier, NotifyError, StatusUpdate};
use site_backup_lib::process::{CommandError, CommandOutput, CommandRunner, CommandSpec, Stdout};
use site_backup_lib::restore::db::{AdminConnector, DatabaseAdmin, DbError};
use tempfile::TempDir;

pub const DUMP: &str = "\
CREATE TABLE public.page (id integer NOT NULL);
ALTER TABLE public.page OWNER TO site;
COPY public.page (id) FROM stdin;
";

/// Settings for a site living in a temporary directory with one auxiliary
/// repository `theme`.
pub fn site(temp: &TempDir) -> Settings {
    let root = temp.path().join("site");
    let mut settings = Settings::with_roots(temp.path().join("backups"), &root);
    settings.repositories.push(RepositorySettings {
        name: "theme".into(),
        path: "themes/default".into(),
    });
    settings.min_interval_hours = 0.0;
    fs::create_dir_all(root.join("themes/default")).unwrap();
    fs::create_dir_all(settings.media_root.join("uploads")).unwrap();
    fs::write(settings.media_root.join("uploads/logo.png"), "png").unwrap();
    fs::create_dir_all(&settings.static_root).unwrap();
    fs::write(settings.static_root.join("app.css"), "body {}").unwrap();
    settings
}

pub fn env_lookup(vars: &'static [(&'static str, &'static str)]) -> impl Fn(&str) -> Option<String> + Send + Sync {
    move |key| {
        vars.iter()
            .find(|(name, _)| *name == key)
            .map(|(_, value)| value.to_string())
    }
}

pub const DB_VARS: &[(&str, &str)] = &[("DB_NAME", "site"), ("DB_USER", "site"), ("DB_PASSWORD", "secret")];

pub fn db_env() -> DbEnv {
    DbEnv::from_lookup(env_lookup(DB_VARS)).unwrap()
}

/// [CommandRunner] emulating the external tools.
#[derive(Default)]
pub struct FakeTools {
    pub calls: Mutex<Vec<CommandSpec>>,
    /// Programs (or `program subcommand`) which fail.
    pub failing: Mutex<HashSet<String>>,
    /// `pg_dump` blocks until a message arrives.
    gate: Mutex<Option<Receiver<()>>>,
    pub psql_stderr: Mutex<String>,
}

impl FakeTools {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail(&self, program: &str) {
        self.failing.lock().unwrap().insert(program.to_string());
    }

    /// Hold back `pg_dump` until the returned sender sends or is dropped.
    pub fn gate_dump(&self) -> Sender<()> {
        let (release, gate) = mpsc::channel();
        *self.gate.lock().unwrap() = Some(gate);
        release
    }

    pub fn programs(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|spec| format!("{} {}", spec.program, spec.args.first().cloned().unwrap_or_default()))
            .collect()
    }

    fn stdout(&self, spec: &CommandSpec) -> String {
        match (spec.program.as_str(), spec.args.first().map(String::as_str)) {
            ("pg_dump", _) => DUMP.into(),
            ("pip", Some("freeze")) => "Django==5.0\npsycopg==3.1\n".into(),
            ("git", Some("rev-parse")) if spec.args.iter().any(|arg| arg == "--abbrev-ref") => "master\n".into(),
            ("git", Some("rev-parse")) => "0123456789abcdef\n".into(),
            ("git", Some("archive")) => "tar content".into(),
            _ => String::new(),
        }
    }
}

impl CommandRunner for FakeTools {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
        self.calls.lock().unwrap().push(spec.clone());

        if spec.program == "pg_dump" {
            let gate = self.gate.lock().unwrap().take();
            if let Some(gate) = gate {
                let _ = gate.recv();
            }
        }

        let key = format!("{} {}", spec.program, spec.args.first().cloned().unwrap_or_default());
        let failing = self.failing.lock().unwrap();
        if failing.contains(&spec.program) || failing.contains(&key) {
            return Err(CommandError::Failed {
                command: spec.to_string(),
                output: CommandOutput {
                    code: Some(1),
                    stdout: String::new(),
                    stderr: format!("{} exploded", spec.program),
                },
            });
        }
        drop(failing);

        let stdout = self.stdout(spec);
        let stderr = if spec.program == "psql" {
            self.psql_stderr.lock().unwrap().clone()
        } else {
            String::new()
        };
        match &spec.stdout {
            Stdout::Capture => Ok(CommandOutput {
                code: Some(0),
                stdout,
                stderr,
            }),
            Stdout::File(path) => {
                fs::write(path, stdout).unwrap();
                Ok(CommandOutput {
                    code: Some(0),
                    stdout: String::new(),
                    stderr,
                })
            }
        }
    }
}

/// Database server state shared by [FakeConnector] and its connections.
#[derive(Default)]
pub struct FakeCluster {
    pub databases: Mutex<BTreeSet<String>>,
    pub journal: Mutex<Vec<String>>,
    pub fail_create: Mutex<bool>,
    pub open_connections: Mutex<usize>,
}

impl FakeCluster {
    pub fn with_databases(names: &[&str]) -> Arc<Self> {
        let cluster = Self::default();
        cluster
            .databases
            .lock()
            .unwrap()
            .extend(names.iter().map(|name| name.to_string()));
        Arc::new(cluster)
    }

    pub fn databases(&self) -> Vec<String> {
        self.databases.lock().unwrap().iter().cloned().collect()
    }

    pub fn journal(&self) -> Vec<String> {
        self.journal.lock().unwrap().clone()
    }
}

pub struct FakeConnector(pub Arc<FakeCluster>);

impl AdminConnector for FakeConnector {
    fn probe(&self, db: &DbEnv) -> Result<bool, DbError> {
        Ok(self.0.databases.lock().unwrap().contains(&db.name))
    }

    fn connect(&self, _: &DbEnv) -> Result<Box<dyn DatabaseAdmin>, DbError> {
        *self.0.open_connections.lock().unwrap() += 1;
        Ok(Box::new(FakeAdmin(Arc::clone(&self.0))))
    }
}

struct FakeAdmin(Arc<FakeCluster>);

impl FakeAdmin {
    fn record(&self, entry: String) {
        self.0.journal.lock().unwrap().push(entry);
    }
}

impl DatabaseAdmin for FakeAdmin {
    fn database_exists(&mut self, name: &str) -> Result<bool, DbError> {
        Ok(self.0.databases.lock().unwrap().contains(name))
    }

    fn rename_database(&mut self, from: &str, to: &str) -> Result<(), DbError> {
        self.record(format!("rename {from} {to}"));
        let mut databases = self.0.databases.lock().unwrap();
        if !databases.remove(from) || !databases.insert(to.to_string()) {
            return Err(DbError::Rejected(format!("can't rename {from} to {to}")));
        }
        Ok(())
    }

    fn create_database(&mut self, name: &str, owner: &str) -> Result<(), DbError> {
        self.record(format!("create {name} {owner}"));
        if *self.0.fail_create.lock().unwrap() {
            return Err(DbError::Rejected(format!("permission denied to create {name}")));
        }
        if !self.0.databases.lock().unwrap().insert(name.to_string()) {
            return Err(DbError::Rejected(format!("database {name} already exists")));
        }
        Ok(())
    }

    fn drop_database(&mut self, name: &str) -> Result<(), DbError> {
        self.record(format!("drop {name}"));
        self.0.databases.lock().unwrap().remove(name);
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<(), DbError> {
        *self.0.open_connections.lock().unwrap() -= 1;
        Ok(())
    }
}

/// [Notifier] remembering everything it was asked to send.
#[derive(Default)]
pub struct RecordingNotifier {
    pub notifications: Mutex<Vec<(String, Notification)>>,
    pub updates: Mutex<Vec<(String, StatusUpdate)>>,
    /// Record, then report every delivery as failed.
    pub unreachable: Mutex<bool>,
}

impl RecordingNotifier {
    pub fn unreachable() -> Self {
        Self {
            unreachable: Mutex::new(true),
            ..Self::default()
        }
    }

    fn delivered(&self) -> Result<(), NotifyError> {
        if !*self.unreachable.lock().unwrap() {
            return Ok(());
        }
        Err(NotifyError::Command(CommandError::Failed {
            command: "notify".into(),
            output: CommandOutput {
                code: Some(1),
                stdout: String::new(),
                stderr: "connection refused".into(),
            },
        }))
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, target: &str, notification: &Notification) -> Result<(), NotifyError> {
        self.notifications
            .lock()
            .unwrap()
            .push((target.to_string(), notification.clone()));
        self.delivered()
    }

    fn push_status(&self, user: &str, update: &StatusUpdate) -> Result<(), NotifyError> {
        self.updates.lock().unwrap().push((user.to_string(), update.clone()));
        self.delivered()
    }
}

/// Relative paths of all files below `path`, sorted.
pub fn read_tree(path: &Path) -> Vec<String> {
    walkdir::WalkDir::new(path)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| {
            entry
                .path()
                .strip_prefix(path)
                .unwrap()
                .to_string_lossy()
                .replace('\\', "/")
        })
        .collect()
}
