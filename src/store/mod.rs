//! Persistence of [Backup] and [BackupConfig] records.
//!
//! The record store is owned by the surrounding application; the backup
//! subsystem only depends on the [BackupStore] and [ConfigStore] traits.
//! Two implementations are provided:
//!
//! - [MemoryStore]: process local, used by tests and embedders.
//! - [JsonFileStore]: a JSON document on disk, used by the CLI so that
//!   records survive across invocations.

mod json;
mod memory;

use std::io;
use std::path::PathBuf;

use chrono::{DateTime, Local, NaiveDate};
use derive_more::{Display, Error, From};

pub use json::JsonFileStore;
pub use memory::MemoryStore;

use crate::lease::LeaseError;
use crate::model::{Backup, BackupConfig, BackupId, TransitionError};

#[derive(Debug, Display, Error, From)]
pub enum StoreError {
    #[from(ignore)]
    #[display("backup {_0} not found")]
    NotFound(#[error(ignore)] BackupId),
    /// The operation would violate a uniqueness or immutability rule.
    #[from(ignore)]
    #[display("integrity conflict: {_0}")]
    IntegrityConflict(#[error(ignore)] String),
    #[display("invalid state change: {_0}")]
    Transition(TransitionError),
    #[from(ignore)]
    #[display("record file {}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },
    #[from(ignore)]
    #[display("record file {} is corrupt: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[display("record file lock: {_0}")]
    Lock(LeaseError),
}

/// Storage of [Backup] records.
pub trait BackupStore: Send + Sync {
    /// Persist a new record, assigning its id.
    fn insert(&self, backup: Backup) -> Result<Backup, StoreError>;

    /// Replace a stored record.
    ///
    /// A terminal record can only be soft deleted, any other change is an
    /// [StoreError::IntegrityConflict].
    fn update(&self, backup: &Backup) -> Result<(), StoreError>;

    fn get(&self, id: BackupId) -> Result<Backup, StoreError>;

    /// All records including soft deleted ones, oldest first.
    fn list(&self) -> Result<Vec<Backup>, StoreError>;

    /// Number of running or completed backups created on `day`.
    fn count_started_on(&self, day: NaiveDate) -> Result<usize, StoreError> {
        Ok(self
            .list()?
            .iter()
            .filter(|backup| backup.is_rate_limited() && backup.created_at.date_naive() == day)
            .count())
    }

    /// Creation time of the newest running or completed backup.
    fn last_started_at(&self) -> Result<Option<DateTime<Local>>, StoreError> {
        Ok(self
            .list()?
            .iter()
            .filter(|backup| backup.is_rate_limited())
            .map(|backup| backup.created_at)
            .max())
    }

    /// Flag a record as deleted. Running backups can't be deleted.
    fn soft_delete(&self, id: BackupId) -> Result<Backup, StoreError> {
        let mut backup = self.get(id)?;
        if !backup.status.is_terminal() {
            return Err(StoreError::IntegrityConflict(format!("backup {id} is still running")));
        }
        backup.deleted = true;
        self.update(&backup)?;
        Ok(backup)
    }
}

/// Storage of the [BackupConfig] singleton.
pub trait ConfigStore: Send + Sync {
    fn get_config(&self) -> Result<Option<BackupConfig>, StoreError>;

    /// Create the singleton. Fails if it already exists.
    fn create_config(&self, config: BackupConfig) -> Result<(), StoreError>;

    /// Update the singleton. Fails if it doesn't exist yet.
    fn update_config(&self, config: BackupConfig) -> Result<(), StoreError>;

    /// The singleton can't be deleted.
    fn delete_config(&self) -> Result<(), StoreError> {
        Err(StoreError::IntegrityConflict("the backup configuration can't be deleted".into()))
    }
}

/// Shared validation of record updates.
fn check_update(stored: &Backup, updated: &Backup) -> Result<(), StoreError> {
    if stored.status.is_terminal() {
        let only_deleted = Backup {
            deleted: stored.deleted,
            ..updated.clone()
        };
        if &only_deleted != stored {
            return Err(StoreError::IntegrityConflict(format!(
                "backup {} is {} and can only be deleted",
                stored.id, stored.status
            )));
        }
    }
    Ok(())
}

#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
struct Records {
    next_id: BackupId,
    backups: Vec<Backup>,
    config: Option<BackupConfig>,
}

impl Records {
    fn insert(&mut self, mut backup: Backup) -> Backup {
        self.next_id += 1;
        backup.id = self.next_id;
        self.backups.push(backup.clone());
        backup
    }

    fn update(&mut self, backup: &Backup) -> Result<(), StoreError> {
        let stored = self
            .backups
            .iter_mut()
            .find(|stored| stored.id == backup.id)
            .ok_or(StoreError::NotFound(backup.id))?;
        check_update(stored, backup)?;
        *stored = backup.clone();
        Ok(())
    }

    fn get(&self, id: BackupId) -> Result<Backup, StoreError> {
        self.backups
            .iter()
            .find(|backup| backup.id == id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    fn create_config(&mut self, config: BackupConfig) -> Result<(), StoreError> {
        if self.config.is_some() {
            return Err(StoreError::IntegrityConflict("a backup configuration already exists".into()));
        }
        self.config = Some(config);
        Ok(())
    }

    fn update_config(&mut self, config: BackupConfig) -> Result<(), StoreError> {
        match &mut self.config {
            Some(stored) => {
                *stored = config;
                Ok(())
            }
            None => Err(StoreError::IntegrityConflict("no backup configuration exists yet".into())),
        }
    }
}
