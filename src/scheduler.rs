//! Periodic execution of automatic backups.
//!
//! A [Scheduler] has exactly one job slot which is polled by a single
//! thread. The [BackupConfigService] keeps the slot in sync with the stored
//! [BackupConfig].

use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Local, TimeDelta};
use derive_more::{Display, Error, From};

use crate::manager::{BackupManager, StartRequest};
use crate::model::BackupConfig;
use crate::store::{ConfigStore, StoreError};

/// Work executed by the scheduler.
pub type Action = Arc<dyn Fn() + Send + Sync>;

struct Job {
    period: TimeDelta,
    next_run: DateTime<Local>,
    action: Action,
}

/// Timing of the armed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArmedJob {
    pub period: TimeDelta,
    pub next_run: DateTime<Local>,
}

type Slot = Arc<Mutex<Option<Job>>>;

fn lock(slot: &Mutex<Option<Job>>) -> MutexGuard<'_, Option<Job>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Single slot job scheduler.
pub struct Scheduler {
    slot: Slot,
    poller: Mutex<Option<(Sender<()>, JoinHandle<()>)>>,
}

impl Scheduler {
    /// A scheduler without poll thread; due jobs only run on [Scheduler::run_pending].
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
            poller: Mutex::new(None),
        }
    }

    /// Start the poll thread running due jobs every `poll_interval`.
    pub fn start(poll_interval: Duration) -> Self {
        let scheduler = Self::new();
        let (stop, stopped) = mpsc::channel::<()>();
        let slot = Arc::clone(&scheduler.slot);

        let spawned = thread::Builder::new().name("scheduler".into()).spawn(move || {
            log::debug!(target: "scheduler", "Polling every {}s", poll_interval.as_secs_f64());
            loop {
                match stopped.recv_timeout(poll_interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        run_pending(&slot, Local::now());
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            log::debug!(target: "scheduler", "Poll thread stopped");
        });
        match spawned {
            Ok(handle) => *scheduler.poller.lock().unwrap_or_else(PoisonError::into_inner) = Some((stop, handle)),
            Err(e) => log::error!(target: "scheduler", "Spawning the poll thread failed: {e}"),
        }
        scheduler
    }

    /// Arm `action` to run every `period`, first in one `period` from now.
    ///
    /// Replaces the previously armed job.
    pub fn arm(&self, period: TimeDelta, action: Action) {
        let next_run = Local::now() + period;
        let previous = lock(&self.slot).replace(Job {
            period,
            next_run,
            action,
        });
        if previous.is_some() {
            log::debug!(target: "scheduler", "Cancelled previously armed job");
        }
        log::info!(target: "scheduler", "Armed job every {}h, next run at {next_run}", period.num_hours());
    }

    pub fn cancel(&self) {
        if lock(&self.slot).take().is_some() {
            log::info!(target: "scheduler", "Cancelled armed job");
        }
    }

    pub fn armed(&self) -> Option<ArmedJob> {
        lock(&self.slot).as_ref().map(|job| ArmedJob {
            period: job.period,
            next_run: job.next_run,
        })
    }

    /// Run the armed job if it is due at `now`. Returns whether it ran.
    pub fn run_pending_at(&self, now: DateTime<Local>) -> bool {
        run_pending(&self.slot, now)
    }

    pub fn run_pending(&self) -> bool {
        self.run_pending_at(Local::now())
    }

    /// Stop and join the poll thread. The armed job stays armed.
    pub fn shutdown(&self) {
        let poller = self.poller.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some((stop, handle)) = poller {
            let _ = stop.send(());
            if handle.join().is_err() {
                log::error!(target: "scheduler", "The poll thread panicked");
            }
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_pending(slot: &Mutex<Option<Job>>, now: DateTime<Local>) -> bool {
    let action = {
        let mut slot = lock(slot);
        let Some(job) = slot.as_mut() else {
            return false;
        };
        if now < job.next_run {
            return false;
        }
        job.next_run += job.period;
        if job.next_run <= now {
            // missed runs are not caught up
            job.next_run = now + job.period;
        }
        Arc::clone(&job.action)
    };
    log::debug!(target: "scheduler", "Running due job");
    action();
    true
}

#[derive(Debug, Display, Error, From)]
pub enum ConfigError {
    #[display("the backup interval must be at least one hour")]
    InvalidInterval,
    #[from]
    #[display("{_0}")]
    Store(StoreError),
}

/// Action starting an automatic backup of the configured type.
pub fn automatic_backup(manager: Arc<BackupManager>) -> Action {
    Arc::new(move || {
        let request = StartRequest {
            backup_type: manager.settings().automatic_backup_type,
            name: None,
            user: None,
        };
        match manager.start(request) {
            Ok(started) => {
                log::info!(target: "scheduler", "Started automatic backup {}", started.backup.id)
            }
            Err(e) => log::warn!(target: "scheduler", "Automatic backup rejected: {e}"),
        }
    })
}

/// Operations on the [BackupConfig] singleton which keep the scheduler armed
/// with the configured interval.
pub struct BackupConfigService {
    store: Arc<dyn ConfigStore>,
    scheduler: Arc<Scheduler>,
    action: Action,
    enabled: bool,
}

impl BackupConfigService {
    /// `enabled` turns on automatic backups; otherwise the scheduler is never armed.
    pub fn new(store: Arc<dyn ConfigStore>, scheduler: Arc<Scheduler>, action: Action, enabled: bool) -> Self {
        Self {
            store,
            scheduler,
            action,
            enabled,
        }
    }

    /// Arm the scheduler with the stored configuration, creating the default
    /// one if there is none yet.
    pub fn init(&self) -> Result<Option<BackupConfig>, ConfigError> {
        if !self.enabled {
            log::debug!(target: "scheduler", "Automatic backups are disabled");
            return Ok(None);
        }
        let config = match self.store.get_config()? {
            Some(config) => config,
            None => {
                let config = BackupConfig::default();
                self.store.create_config(config)?;
                config
            }
        };
        self.arm(config);
        Ok(Some(config))
    }

    pub fn get(&self) -> Result<Option<BackupConfig>, ConfigError> {
        Ok(self.store.get_config()?)
    }

    pub fn create(&self, config: BackupConfig) -> Result<(), ConfigError> {
        validate(config)?;
        self.store.create_config(config)?;
        self.arm(config);
        Ok(())
    }

    /// Change the interval and re-arm the scheduler with it.
    pub fn update(&self, automatic_backup_hour_interval: u32) -> Result<BackupConfig, ConfigError> {
        let config = BackupConfig {
            automatic_backup_hour_interval,
        };
        validate(config)?;
        self.store.update_config(config)?;
        self.arm(config);
        Ok(config)
    }

    pub fn delete(&self) -> Result<(), ConfigError> {
        Ok(self.store.delete_config()?)
    }

    /// Re-arm if the stored interval differs from the armed one, e.g. after
    /// another process updated it.
    pub fn refresh(&self) -> Result<(), ConfigError> {
        if !self.enabled {
            return Ok(());
        }
        let Some(config) = self.store.get_config()? else {
            return Ok(());
        };
        let period = period(config);
        if self.scheduler.armed().map(|job| job.period) != Some(period) {
            log::info!(
                target: "scheduler",
                "Backup interval changed to {}h",
                config.automatic_backup_hour_interval
            );
            self.arm(config);
        }
        Ok(())
    }

    fn arm(&self, config: BackupConfig) {
        if self.enabled {
            self.scheduler.arm(period(config), Arc::clone(&self.action));
        }
    }
}

fn period(config: BackupConfig) -> TimeDelta {
    TimeDelta::hours(i64::from(config.automatic_backup_hour_interval))
}

fn validate(config: BackupConfig) -> Result<(), ConfigError> {
    if config.automatic_backup_hour_interval == 0 {
        return Err(ConfigError::InvalidInterval);
    }
    Ok(())
}
