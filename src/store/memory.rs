use std::sync::{Mutex, MutexGuard};

use super::{BackupStore, ConfigStore, Records, StoreError};
use crate::model::{Backup, BackupConfig, BackupId};

/// Records kept in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<Records>,
}

impl MemoryStore {
    fn records(&self) -> MutexGuard<'_, Records> {
        // a panic while holding the lock can't leave the records half updated
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl BackupStore for MemoryStore {
    fn insert(&self, backup: Backup) -> Result<Backup, StoreError> {
        Ok(self.records().insert(backup))
    }

    fn update(&self, backup: &Backup) -> Result<(), StoreError> {
        self.records().update(backup)
    }

    fn get(&self, id: BackupId) -> Result<Backup, StoreError> {
        self.records().get(id)
    }

    fn list(&self) -> Result<Vec<Backup>, StoreError> {
        Ok(self.records().backups.clone())
    }
}

impl ConfigStore for MemoryStore {
    fn get_config(&self) -> Result<Option<BackupConfig>, StoreError> {
        Ok(self.records().config)
    }

    fn create_config(&self, config: BackupConfig) -> Result<(), StoreError> {
        self.records().create_config(config)
    }

    fn update_config(&self, config: BackupConfig) -> Result<(), StoreError> {
        self.records().update_config(config)
    }
}
