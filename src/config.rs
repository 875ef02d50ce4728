//! Settings of the backup subsystem and database credentials.
//!
//! [Settings] are read from a TOML file. Database credentials are never
//! stored there, they are taken from the process environment as [DbEnv].

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use derive_more::{Display, Error, From};

use crate::model::BackupType;
use crate::repositories::MAIN_REPOSITORY;
use crate::util::retention::RetentionConfig;

/// Upper bound of [Settings::min_interval_hours]: one year.
pub const MAX_MIN_INTERVAL_HOURS: f64 = 24.0 * 366.0;

/// Name of the restore marker, relative to the repository root.
pub const RESTORE_MARKER: &str = ".restore_in_progress";

/// Auxiliary git checkout that is part of a full backup.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RepositorySettings {
    /// Key in `repositories.json`. Must not be `main`.
    pub name: String,
    /// Working tree, relative to [Settings::repository_root].
    pub path: PathBuf,
}

/// External commands used for the dependency manifest.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DependencySettings {
    /// Prints one installed package spec per line.
    #[serde(default = "default_freeze")]
    pub freeze: Vec<String>,
    /// Installs from a manifest; the manifest path is appended.
    #[serde(default = "default_install")]
    pub install: Vec<String>,
}

impl Default for DependencySettings {
    fn default() -> Self {
        Self {
            freeze: default_freeze(),
            install: default_install(),
        }
    }
}

fn default_freeze() -> Vec<String> {
    vec!["pip".into(), "freeze".into()]
}

fn default_install() -> Vec<String> {
    vec!["pip".into(), "install".into(), "-r".into()]
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
/// Configuration of the backup and restore pipeline.
pub struct Settings {
    /// Directory receiving backup archives and restore working directories.
    pub backup_dir: PathBuf,
    /// Uploaded media.
    pub media_root: PathBuf,
    /// Collected static assets. Regenerated on restore, not archived.
    pub static_root: PathBuf,
    /// Main git checkout; also the anchor of the restore marker.
    pub repository_root: PathBuf,

    /// Backup lease file. Defaults to `<backup_dir>/backup.lock`.
    #[serde(default)]
    pub lock_file: Option<PathBuf>,
    /// Hours after which a backup lease is reported stale.
    #[serde(default = "default_lock_ttl_hours")]
    pub lock_ttl_hours: u64,

    /// Maximum number of backups started per calendar day.
    #[serde(default = "default_daily_limit")]
    pub daily_limit: u32,
    /// Minimum time between two backups, in (fractional) hours.
    #[serde(default = "default_min_interval_hours")]
    pub min_interval_hours: f64,

    /// Receiver of "backup complete" notifications.
    #[serde(default = "default_notification_group")]
    pub notification_group: String,
    /// Command delivering notifications; target and message are appended.
    ///
    /// Notifications are only logged if unset.
    #[serde(default)]
    pub notification_command: Option<Vec<String>>,

    /// Arm the automatic backup job on start of the daemon.
    #[serde(default)]
    pub automatic_backups: bool,
    #[serde(default = "default_automatic_type")]
    pub automatic_backup_type: BackupType,
    /// Seconds between two scheduler polls.
    #[serde(default = "default_poll_secs")]
    pub scheduler_poll_secs: u64,

    /// Number of backup worker threads.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Backups waiting for a worker before new ones are rejected.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Timeout of every external command.
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,

    /// Regenerates [Settings::static_root] after a restore. Skipped if empty.
    #[serde(default)]
    pub collect_static: Vec<String>,

    /// Record store of the CLI. Defaults to `<backup_dir>/records.json`.
    #[serde(default)]
    pub records_file: Option<PathBuf>,

    /// Auxiliary repositories next to the main checkout.
    #[serde(default)]
    pub repositories: Vec<RepositorySettings>,
    #[serde(default)]
    pub dependencies: DependencySettings,

    /// Retention of completed backups. Everything is kept if unset.
    #[serde(default)]
    pub retention: Option<RetentionConfig>,
}

fn default_lock_ttl_hours() -> u64 {
    6
}
fn default_daily_limit() -> u32 {
    5
}
fn default_min_interval_hours() -> f64 {
    1.0
}
fn default_notification_group() -> String {
    "admins".into()
}
fn default_automatic_type() -> BackupType {
    BackupType::Full
}
fn default_poll_secs() -> u64 {
    5
}
fn default_workers() -> usize {
    1
}
fn default_queue_capacity() -> usize {
    4
}
fn default_command_timeout_secs() -> u64 {
    60 * 60
}

impl Default for Settings {
    fn default() -> Self {
        Self::with_roots("/var/backups/site", "/srv/site")
    }
}

impl Settings {
    /// Settings with the conventional layout below `repository_root`.
    pub fn with_roots(backup_dir: impl Into<PathBuf>, repository_root: impl Into<PathBuf>) -> Self {
        let repository_root = repository_root.into();
        Self {
            backup_dir: backup_dir.into(),
            media_root: repository_root.join("media"),
            static_root: repository_root.join("static"),
            repository_root,
            lock_file: None,
            lock_ttl_hours: default_lock_ttl_hours(),
            daily_limit: default_daily_limit(),
            min_interval_hours: default_min_interval_hours(),
            notification_group: default_notification_group(),
            notification_command: None,
            automatic_backups: false,
            automatic_backup_type: default_automatic_type(),
            scheduler_poll_secs: default_poll_secs(),
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            command_timeout_secs: default_command_timeout_secs(),
            repositories: Vec::new(),
            dependencies: DependencySettings::default(),
            collect_static: vec![
                "python".into(),
                "manage.py".into(),
                "collectstatic".into(),
                "--noinput".into(),
            ],
            records_file: None,
            retention: None,
        }
    }

    pub fn lock_file(&self) -> PathBuf {
        self.lock_file
            .clone()
            .unwrap_or_else(|| self.backup_dir.join("backup.lock"))
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_hours * 60 * 60)
    }

    pub fn restore_marker(&self) -> PathBuf {
        self.repository_root.join(RESTORE_MARKER)
    }

    pub fn records_file(&self) -> PathBuf {
        self.records_file
            .clone()
            .unwrap_or_else(|| self.backup_dir.join("records.json"))
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn scheduler_poll(&self) -> Duration {
        Duration::from_secs(self.scheduler_poll_secs.max(1))
    }

    /// Working tree of a repository key of `repositories.json`.
    pub fn repository_path(&self, key: &str) -> Option<PathBuf> {
        if key == MAIN_REPOSITORY {
            return Some(self.repository_root.clone());
        }
        self.repositories
            .iter()
            .find(|repo| repo.name == key)
            .map(|repo| self.repository_root.join(&repo.path))
    }

    /// All repository keys with their working trees, `main` first.
    pub fn repository_paths(&self) -> Vec<(String, PathBuf)> {
        std::iter::once((MAIN_REPOSITORY.to_string(), self.repository_root.clone()))
            .chain(
                self.repositories
                    .iter()
                    .map(|repo| (repo.name.clone(), self.repository_root.join(&repo.path))),
            )
            .collect()
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.repositories.iter().any(|repo| repo.name == MAIN_REPOSITORY) {
            return Err(SettingsError::Invalid("repository name `main` is reserved".into()));
        }
        if !(0.0..=MAX_MIN_INTERVAL_HOURS).contains(&self.min_interval_hours) {
            return Err(SettingsError::Invalid(format!(
                "min_interval_hours must be between 0 and {MAX_MIN_INTERVAL_HOURS}"
            )));
        }
        for (name, root) in [("media_root", &self.media_root), ("static_root", &self.static_root)] {
            if self.backup_dir == *root {
                return Err(SettingsError::Invalid(format!("backup_dir must not be the {name}")));
            }
        }
        if self.workers == 0 || self.queue_capacity == 0 {
            return Err(SettingsError::Invalid("workers and queue_capacity must be positive".into()));
        }
        Ok(())
    }

    /// Read settings from `path`, writing defaults there if it doesn't exist yet.
    pub fn load_or_init(path: &Path) -> Result<Self, SettingsError> {
        let settings: Settings = match fs::read_to_string(path) {
            Ok(config_str) => toml::from_str(&config_str)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::debug!(
                    target: "config",
                    "Writing default config to {} because it doesn't exist yet",
                    path.display()
                );
                let default_config = Settings::default();
                let config_str = toml::to_string_pretty(&default_config)?;
                if let Err(e) = fs::write(path, config_str) {
                    log::warn!(target: "config", "Writing default config to {} failed {e}", path.display());
                }
                default_config
            }
            Err(e) => return Err(SettingsError::Read(e)),
        };

        settings.validate()?;
        Ok(settings)
    }
}

#[derive(Debug, Display, Error, From)]
pub enum SettingsError {
    #[display("Reading the config file failed: {_0}")]
    Read(io::Error),
    #[display("Parsing the config file failed: {_0}")]
    Parse(toml::de::Error),
    #[display("Serializing the default config failed: {_0}")]
    Serialize(toml::ser::Error),
    #[from(ignore)]
    #[display("Invalid configuration: {_0}")]
    Invalid(#[error(ignore)] String),
}

/// Database connection parameters taken from the environment.
#[derive(Clone, PartialEq, Eq)]
pub struct DbEnv {
    pub name: String,
    pub user: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    pub admin_name: String,
    pub admin_user: String,
    pub admin_password: String,
}

impl std::fmt::Debug for DbEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbEnv")
            .field("name", &self.name)
            .field("user", &self.user)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("admin_name", &self.admin_name)
            .field("admin_user", &self.admin_user)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Display, Error)]
pub enum DbEnvError {
    /// Required variables are unset or empty.
    #[display("missing required environment variables: {}", _0.join(", "))]
    Missing(#[error(ignore)] Vec<&'static str>),
    #[display("DB_PORT is not a valid port: {_0}")]
    InvalidPort(#[error(ignore)] String),
}

impl DbEnv {
    /// Read from the process environment.
    pub fn from_env() -> Result<Self, DbEnvError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read using `lookup` to resolve variable names. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, DbEnvError> {
        let get = |key: &str| lookup(key).filter(|value| !value.is_empty());

        let mut missing = Vec::new();
        let mut required = |key: &'static str| {
            get(key).unwrap_or_else(|| {
                missing.push(key);
                String::new()
            })
        };
        let name = required("DB_NAME");
        let user = required("DB_USER");
        let password = required("DB_PASSWORD");
        if !missing.is_empty() {
            return Err(DbEnvError::Missing(missing));
        }

        let host = get("DB_HOST").unwrap_or_else(|| "localhost".into());
        let port = match get("DB_PORT") {
            None => 5432,
            Some(port) => port.parse().map_err(|_| DbEnvError::InvalidPort(port))?,
        };

        Ok(Self {
            admin_name: get("ADMIN_DB_NAME").unwrap_or_else(|| name.clone()),
            admin_user: get("ADMIN_USER").unwrap_or_else(|| user.clone()),
            admin_password: get("ADMIN_PASSWORD").unwrap_or_else(|| password.clone()),
            name,
            user,
            password,
            host,
            port,
        })
    }
}
