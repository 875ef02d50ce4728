use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;

use super::{BackupStore, ConfigStore, Records, StoreError};
use crate::lease::{owner_id, Lease, LeaseError, LeaseGuard};
use crate::model::{Backup, BackupConfig, BackupId};
use crate::util::fs::with_suffix;

/// A writer holding the file lock longer than this has died.
const LOCK_TTL: Duration = Duration::from_secs(30);
const LOCK_TIMEOUT: Duration = Duration::from_secs(10);
const LOCK_RETRY: Duration = Duration::from_millis(20);

/// Records kept in a single JSON document.
///
/// Every operation reads the document, applies the change and atomically
/// replaces the file. Writers are serialised by a mutex within the process
/// and by a `<file>.lock` lease across processes.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    write_lock: Mutex<()>,
    file_lock: Lease,
    lock_timeout: Duration,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            file_lock: Lease::new(with_suffix(&path, ".lock"), Some(LOCK_TTL)),
            path,
            write_lock: Mutex::new(()),
            lock_timeout: LOCK_TIMEOUT,
        }
    }

    /// Give up waiting for other writers after `timeout`.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Take the cross-process lock, waiting for other writers.
    ///
    /// A lock left behind by a crashed writer is cleared once it is stale.
    fn lock_file(&self) -> Result<LeaseGuard, StoreError> {
        let deadline = Instant::now() + self.lock_timeout;
        loop {
            match self.file_lock.lock(&owner_id()) {
                Ok(guard) => return Ok(guard),
                Err(LeaseError::Held(record)) if record.is_stale_at(Utc::now()) => {
                    match self.file_lock.force_clear(false) {
                        Ok(_) | Err(LeaseError::Live(_)) => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                Err(LeaseError::Held(record)) => {
                    if Instant::now() >= deadline {
                        return Err(LeaseError::Held(record).into());
                    }
                    thread::sleep(LOCK_RETRY);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn load(&self) -> Result<Records, StoreError> {
        match fs::read(&self.path) {
            Ok(content) => serde_json::from_slice(&content).map_err(|source| StoreError::Corrupt {
                path: self.path.clone(),
                source,
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Records::default()),
            Err(e) => Err(self.io_err(e)),
        }
    }

    fn save(&self, records: &Records) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| self.io_err(e))?;
        }
        let content = serde_json::to_vec_pretty(records).map_err(|source| StoreError::Corrupt {
            path: self.path.clone(),
            source,
        })?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, content).map_err(|e| self.io_err(e))?;
        fs::rename(&tmp, &self.path).map_err(|e| self.io_err(e))
    }

    fn modify<T>(&self, change: impl FnOnce(&mut Records) -> Result<T, StoreError>) -> Result<T, StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let file_guard = self.lock_file()?;
        let mut records = self.load()?;
        let result = change(&mut records)?;
        self.save(&records)?;
        file_guard.release()?;
        Ok(result)
    }
}

impl BackupStore for JsonFileStore {
    fn insert(&self, backup: Backup) -> Result<Backup, StoreError> {
        self.modify(|records| Ok(records.insert(backup)))
    }

    fn update(&self, backup: &Backup) -> Result<(), StoreError> {
        self.modify(|records| records.update(backup))
    }

    fn get(&self, id: BackupId) -> Result<Backup, StoreError> {
        self.load()?.get(id)
    }

    fn list(&self) -> Result<Vec<Backup>, StoreError> {
        Ok(self.load()?.backups)
    }
}

impl ConfigStore for JsonFileStore {
    fn get_config(&self) -> Result<Option<BackupConfig>, StoreError> {
        Ok(self.load()?.config)
    }

    fn create_config(&self, config: BackupConfig) -> Result<(), StoreError> {
        self.modify(|records| records.create_config(config))
    }

    fn update_config(&self, config: BackupConfig) -> Result<(), StoreError> {
        self.modify(|records| records.update_config(config))
    }
}
