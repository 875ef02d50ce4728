//! Records owned by the backup subsystem.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Local};
use clap::ValueEnum;
use derive_more::{Display, Error};

/// Identifier of a [Backup] record.
pub type BackupId = u64;

/// Default of [BackupConfig::automatic_backup_hour_interval]: one week.
pub const DEFAULT_AUTOMATIC_BACKUP_HOUR_INTERVAL: u32 = 168;

/// Content of a backup.
#[derive(
    Copy, Clone, Debug, Display, Default, PartialEq, Eq, Hash, ValueEnum, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    /// Database, media, dependency manifest and source trees.
    #[default]
    #[display("Full")]
    Full,
    /// Database and media only.
    #[display("Partial")]
    Partial,
}

impl BackupType {
    pub fn is_full(self) -> bool {
        self == Self::Full
    }
}

/// Backup type is unknown.
#[derive(Debug, Display, Error)]
#[display("Backup type is unknown: {_0}")]
pub struct UnknownBackupType(#[error(ignore)] String);

impl FromStr for BackupType {
    type Err = UnknownBackupType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "full" => Ok(Self::Full),
            "partial" => Ok(Self::Partial),
            _ => Err(UnknownBackupType(s.to_string())),
        }
    }
}

#[derive(Copy, Clone, Debug, Display, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupStatus {
    #[display("running")]
    Running,
    #[display("completed")]
    Completed,
    #[display("failed")]
    Failed,
}

impl BackupStatus {
    /// Completed and failed backups never change status again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// A terminal [Backup] was about to change its status.
#[derive(Debug, Display, Error, PartialEq, Eq)]
#[display("backup {id} is already {from}, can't become {to}")]
pub struct TransitionError {
    pub id: BackupId,
    pub from: BackupStatus,
    pub to: BackupStatus,
}

/// A single backup run and its resulting archive.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Backup {
    pub id: BackupId,
    pub name: String,
    pub backup_type: BackupType,
    pub status: BackupStatus,
    pub created_at: DateTime<Local>,
    /// User who triggered the backup; [None] for automatic backups.
    pub created_by: Option<String>,
    /// Archive path, set once the backup completed.
    pub backup_file: Option<PathBuf>,
    /// Soft deletion flag.
    #[serde(default)]
    pub deleted: bool,
}

impl Backup {
    /// A new `running` backup. The id is assigned by the store.
    pub fn new_running(
        name: Option<String>,
        backup_type: BackupType,
        created_by: Option<String>,
        created_at: DateTime<Local>,
    ) -> Self {
        let name = name
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| default_name(created_at, backup_type));
        Self {
            id: 0,
            name,
            backup_type,
            status: BackupStatus::Running,
            created_at,
            created_by,
            backup_file: None,
            deleted: false,
        }
    }

    /// Mark as completed with the produced archive.
    pub fn complete(&mut self, backup_file: &Path) -> Result<(), TransitionError> {
        self.transition(BackupStatus::Completed)?;
        self.backup_file = Some(backup_file.to_path_buf());
        Ok(())
    }

    pub fn fail(&mut self) -> Result<(), TransitionError> {
        self.transition(BackupStatus::Failed)
    }

    fn transition(&mut self, to: BackupStatus) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError {
                id: self.id,
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    /// Counts towards the rate limits.
    pub fn is_rate_limited(&self) -> bool {
        !self.deleted && matches!(self.status, BackupStatus::Running | BackupStatus::Completed)
    }
}

/// `"<created at> <type>"`, used when no name is given.
pub fn default_name(created_at: DateTime<Local>, backup_type: BackupType) -> String {
    format!("{} {backup_type}", created_at.format("%Y-%m-%d %H:%M:%S"))
}

/// Singleton configuration of automatic backups.
#[derive(Copy, Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BackupConfig {
    pub automatic_backup_hour_interval: u32,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            automatic_backup_hour_interval: DEFAULT_AUTOMATIC_BACKUP_HOUR_INTERVAL,
        }
    }
}
