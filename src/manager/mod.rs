//! Lifecycle of [Backup]s: rate limits, exclusive execution and the
//! asynchronous snapshot job.

pub mod worker;

use std::sync::Arc;

use chrono::{DateTime, Local, TimeDelta};
use derive_more::{Display, Error, From};

use crate::backends::SnapshotBuilder;
use crate::config::Settings;
use crate::lease::{owner_id, Lease, LeaseError, LeaseGuard, LeaseRecord, LeaseState};
use crate::model::{Backup, BackupId, BackupType};
use crate::notify::{Notification, Notifier, StatusUpdate};
use crate::store::{BackupStore, StoreError};
use crate::util::fs::remove_file_if_exists;
use crate::util::retention::expired_backups;
pub use worker::{JobHandle, SubmitError, WorkerPool};

const LOCKED: &str = "a backup is already running";

#[derive(Debug, Display, Error, From)]
/// Reasons a backup can't be started. Nothing is persisted in these cases.
pub enum StartError {
    #[display("{_0}")]
    Locked(#[error(ignore)] String),
    #[display("You can only start {limit} backups per day")]
    DailyLimit { limit: u32 },
    #[display("{_0}")]
    TooSoon(#[error(ignore)] String),
    #[display("too many backups are queued, try again later")]
    QueueFull,
    #[display("no backup worker is available")]
    NoWorker,
    #[from]
    #[display("backup records: {_0}")]
    Store(StoreError),
    #[from]
    #[display("backup lock: {_0}")]
    Lease(LeaseError),
}

/// Parameters of [BackupManager::start].
#[derive(Debug, Clone, Default)]
pub struct StartRequest {
    pub backup_type: BackupType,
    /// Defaults to `"<created at> <type>"`.
    pub name: Option<String>,
    /// Triggering user; [None] for automatic backups.
    pub user: Option<String>,
}

/// A backup which was accepted and queued.
pub struct StartedBackup {
    /// The record as persisted when starting, i.e. `running`.
    pub backup: Backup,
    /// Resolves to the final record once the snapshot job has finished.
    pub handle: JobHandle<Backup>,
}

/// Rejection message of the minimum interval, in the largest unit the
/// interval fills at least once.
pub fn interval_message(min_interval_hours: f64) -> String {
    let hours = min_interval_hours.floor() as u64;
    let minutes = (min_interval_hours * 60.0).floor() as u64;
    let seconds = (min_interval_hours * 3600.0).floor() as u64;
    if hours >= 1 {
        format!("You can only start a backup every {hours} hours")
    } else if minutes >= 1 {
        format!("You can only start a backup every {minutes} minutes")
    } else {
        format!("You can only start a backup every {seconds} seconds")
    }
}

/// Earliest start after a backup started at `last`; [None] if out of range.
fn next_start_after(last: DateTime<Local>, min_interval_hours: f64) -> Option<DateTime<Local>> {
    let millis = min_interval_hours * 3_600_000.0;
    if !millis.is_finite() || millis < 0.0 || millis >= i64::MAX as f64 {
        return None;
    }
    last.checked_add_signed(TimeDelta::try_milliseconds(millis as i64)?)
}

fn stale_message(record: &LeaseRecord) -> String {
    format!(
        "{LOCKED} (lock held by {} since {} is stale, clear it with `site_backup lock clear`)",
        record.owner, record.acquired_at
    )
}

/// State shared with the snapshot jobs.
struct Shared {
    settings: Arc<Settings>,
    store: Arc<dyn BackupStore>,
    builder: SnapshotBuilder,
    notifier: Arc<dyn Notifier>,
}

/// Starts backups and manages their records.
pub struct BackupManager {
    shared: Arc<Shared>,
    lease: Lease,
    pool: WorkerPool,
}

impl BackupManager {
    pub fn new(
        settings: Arc<Settings>,
        store: Arc<dyn BackupStore>,
        builder: SnapshotBuilder,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let lease = Lease::new(settings.lock_file(), Some(settings.lock_ttl()));
        let pool = WorkerPool::new(settings.workers, settings.queue_capacity);
        Self {
            shared: Arc::new(Shared {
                settings,
                store,
                builder,
                notifier,
            }),
            lease,
            pool,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.shared.settings
    }

    /// Check whether a backup may be started now.
    pub fn can_start(&self) -> Result<(), StartError> {
        self.can_start_at(Local::now())
    }

    fn can_start_at(&self, now: DateTime<Local>) -> Result<(), StartError> {
        match self.lease.state()? {
            LeaseState::Free => {}
            LeaseState::Held(_) => return Err(StartError::Locked(LOCKED.into())),
            LeaseState::Stale(record) => return Err(StartError::Locked(stale_message(&record))),
        }

        let settings = &self.shared.settings;
        let store = &self.shared.store;
        let started_today = store.count_started_on(now.date_naive())?;
        if started_today >= settings.daily_limit as usize {
            return Err(StartError::DailyLimit {
                limit: settings.daily_limit,
            });
        }

        if let Some(last) = store.last_started_at()? {
            let allowed = next_start_after(last, settings.min_interval_hours).is_some_and(|next| now >= next);
            if !allowed {
                return Err(StartError::TooSoon(interval_message(settings.min_interval_hours)));
            }
        }
        Ok(())
    }

    /// Start a backup in the background.
    ///
    /// Returns as soon as the `running` record is persisted and the job is
    /// queued. The lock is held until the job has finished.
    pub fn start(&self, request: StartRequest) -> Result<StartedBackup, StartError> {
        self.can_start()?;

        let guard = match self.lease.lock(&owner_id()) {
            Ok(guard) => guard,
            Err(LeaseError::Held(_)) => return Err(StartError::Locked(LOCKED.into())),
            Err(e) => return Err(e.into()),
        };

        let backup = Backup::new_running(request.name, request.backup_type, request.user, Local::now());
        let backup = self.shared.store.insert(backup)?;
        log::info!(target: "backup::manager", "Starting backup {} '{}'", backup.id, backup.name);

        let shared = Arc::clone(&self.shared);
        let job_backup = backup.clone();
        match self.pool.submit(move || shared.run(job_backup, guard)) {
            Ok(handle) => Ok(StartedBackup { backup, handle }),
            Err(e) => {
                // the rejected job and with it the lease guard is already dropped
                log::error!(target: "backup::manager", "Queueing backup {} failed: {e}", backup.id);
                let mut failed = backup;
                if failed.fail().is_ok() {
                    self.shared.store.update(&failed)?;
                }
                Err(match e {
                    SubmitError::QueueFull => StartError::QueueFull,
                    SubmitError::ShutDown => StartError::NoWorker,
                })
            }
        }
    }

    /// Acquire the backup lock outside of a backup job.
    pub fn lock(&self) -> Result<LeaseGuard, LeaseError> {
        self.lease.lock(&owner_id())
    }

    pub fn unlock(&self) -> Result<(), LeaseError> {
        self.lease.unlock()
    }

    pub fn is_locked(&self) -> bool {
        self.lease.is_locked()
    }

    pub fn lease(&self) -> &Lease {
        &self.lease
    }

    /// Backups which are not deleted, oldest first.
    pub fn list(&self) -> Result<Vec<Backup>, StoreError> {
        Ok(self
            .shared
            .store
            .list()?
            .into_iter()
            .filter(|backup| !backup.deleted)
            .collect())
    }

    pub fn get(&self, id: BackupId) -> Result<Backup, StoreError> {
        self.shared.store.get(id)
    }

    /// Soft delete a finished backup and remove its archive.
    pub fn delete(&self, id: BackupId) -> Result<Backup, StoreError> {
        self.shared.delete(id)
    }
}

/// Soft delete the backup `id` and remove its archive from disk.
///
/// A failure to remove the archive is only logged.
pub fn delete_backup(store: &dyn BackupStore, id: BackupId) -> Result<Backup, StoreError> {
    let backup = store.soft_delete(id)?;
    if let Some(file) = &backup.backup_file {
        if let Err(e) = remove_file_if_exists(file) {
            log::warn!(target: "backup::manager", "Removing archive {} failed: {e}", file.display());
        }
    }
    log::info!(target: "backup::manager", "Deleted backup {id}");
    Ok(backup)
}

impl Shared {
    fn delete(&self, id: BackupId) -> Result<Backup, StoreError> {
        delete_backup(self.store.as_ref(), id)
    }

    /// Body of the snapshot job. Never fails, the outcome is recorded on
    /// the returned record.
    fn run(&self, mut backup: Backup, guard: LeaseGuard) -> Backup {
        match self.builder.build(&backup) {
            Ok(archive) => {
                if let Err(e) = backup.complete(&archive) {
                    log::error!(target: "backup::manager", "{e}");
                }
                self.persist(&backup);
                log::info!(target: "backup::manager", "Backup {} completed: {}", backup.id, archive.display());

                let group = &self.settings.notification_group;
                if let Err(e) = self.notifier.notify(group, &Notification::completed(&backup)) {
                    log::warn!(target: "backup::manager", "Notifying {group} failed: {e}");
                }
                self.push_status(&backup);
                self.apply_retention();
            }
            Err(error) => {
                log::error!(target: "backup::manager", "Backup {} failed: {error}", backup.id);
                if let Err(e) = backup.fail() {
                    log::error!(target: "backup::manager", "{e}");
                }
                self.persist(&backup);

                let target = backup.created_by.as_deref().unwrap_or(&self.settings.notification_group);
                let notification = Notification::failed(&backup, &error.to_string());
                if let Err(e) = self.notifier.notify(target, &notification) {
                    log::warn!(target: "backup::manager", "Sending failure notification to {target} failed: {e}");
                }
                self.push_status(&backup);
            }
        }

        if let Err(e) = guard.release() {
            log::error!(target: "backup::manager", "Releasing the backup lock failed: {e}");
        }
        backup
    }

    fn persist(&self, backup: &Backup) {
        if let Err(e) = self.store.update(backup) {
            log::error!(target: "backup::manager", "Persisting backup {} failed: {e}", backup.id);
        }
    }

    fn push_status(&self, backup: &Backup) {
        let Some(user) = &backup.created_by else {
            return;
        };
        let update = StatusUpdate {
            id: backup.id,
            status: backup.status,
        };
        if let Err(e) = self.notifier.push_status(user, &update) {
            log::warn!(target: "backup::manager", "Pushing status to {user} failed: {e}");
        }
    }

    fn apply_retention(&self) {
        let Some(retention) = self.settings.retention else {
            return;
        };
        let backups = match self.store.list() {
            Ok(backups) => backups,
            Err(e) => {
                log::error!(target: "backup::retention", "Listing backups failed: {e}");
                return;
            }
        };
        for id in expired_backups(&backups, retention) {
            log::info!(target: "backup::retention", "Backup {id} is out of retention");
            if let Err(e) = self.delete(id) {
                log::error!(target: "backup::retention", "Deleting backup {id} failed: {e}");
            }
        }
    }
}
