//! File based leases guarding exclusive operations across processes.
//!
//! A lease is a file whose existence means "operation in flight". It is
//! created atomically with [File::create_new] and carries a [LeaseRecord]
//! naming its owner, so a lease left behind by a crashed process can be
//! recognised as stale and cleared deliberately.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use derive_more::{Display, Error, From};

/// Content of a lease file.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LeaseRecord {
    /// `<hostname>:<pid>` of the acquiring process.
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
    /// Lifetime after which the lease counts as stale. [None] never expires.
    pub ttl_secs: Option<u64>,
}

impl LeaseRecord {
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let ttl = chrono::Duration::seconds(i64::try_from(self.ttl_secs?).ok()?);
        self.acquired_at.checked_add_signed(ttl)
    }

    pub fn is_stale_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().is_some_and(|expires| expires < now)
    }
}

/// Observed state of a [Lease].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseState {
    Free,
    Held(LeaseRecord),
    /// Held, but past its TTL. Presumably the owner died.
    Stale(LeaseRecord),
}

#[derive(Debug, Display, Error, From)]
pub enum LeaseError {
    /// The lease is held by someone else.
    #[display("lease is held by {} since {}", _0.owner, _0.acquired_at)]
    Held(#[error(ignore)] LeaseRecord),
    /// A live lease was about to be cleared without force.
    #[display("refusing to clear live lease held by {}", _0.owner)]
    Live(#[error(ignore)] LeaseRecord),
    #[display("lease file {}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },
    #[from]
    #[display("invalid lease record: {_0}")]
    Record(serde_json::Error),
}

/// Returns the owner id of the current process.
pub fn owner_id() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".into());
    format!("{host}:{}", std::process::id())
}

/// A named lease at a fixed path.
#[derive(Debug, Clone)]
pub struct Lease {
    path: PathBuf,
    ttl: Option<Duration>,
}

impl Lease {
    pub fn new(path: impl Into<PathBuf>, ttl: Option<Duration>) -> Self {
        Self {
            path: path.into(),
            ttl,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: io::Error) -> LeaseError {
        LeaseError::Io {
            path: self.path.clone(),
            source,
        }
    }

    /// Returns if the lease file exists, stale or not.
    pub fn is_locked(&self) -> bool {
        self.path.exists()
    }

    /// Inspect the lease without modifying it.
    pub fn state(&self) -> Result<LeaseState, LeaseError> {
        let Some(record) = self.read_record()? else {
            return Ok(LeaseState::Free);
        };

        if record.is_stale_at(Utc::now()) {
            Ok(LeaseState::Stale(record))
        } else {
            Ok(LeaseState::Held(record))
        }
    }

    fn read_record(&self) -> Result<Option<LeaseRecord>, LeaseError> {
        let content = match fs::read(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_err(e)),
        };

        match serde_json::from_slice(&content) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                // zero-content sentinel or a half written record
                log::debug!(target: "lease", "Unreadable lease record at {}: {e}", self.path.display());
                let acquired_at = fs::metadata(&self.path)
                    .and_then(|m| m.modified())
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_else(|_| Utc::now());
                Ok(Some(LeaseRecord {
                    owner: "unknown".into(),
                    acquired_at,
                    ttl_secs: None,
                }))
            }
        }
    }

    /// Acquire the lease for `owner`.
    ///
    /// Fails with [LeaseError::Held] if the lease file already exists, even
    /// if it is stale. Stale leases have to be cleared with [Lease::force_clear].
    pub fn lock(&self, owner: &str) -> Result<LeaseGuard, LeaseError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| self.io_err(e))?;
        }

        let mut file = match File::create_new(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                let record = self.read_record()?.unwrap_or_else(|| LeaseRecord {
                    owner: "unknown".into(),
                    acquired_at: Utc::now(),
                    ttl_secs: None,
                });
                return Err(LeaseError::Held(record));
            }
            Err(e) => return Err(self.io_err(e)),
        };

        let record = LeaseRecord {
            owner: owner.to_string(),
            acquired_at: Utc::now(),
            ttl_secs: self.ttl.map(|ttl| ttl.as_secs()),
        };
        let written = serde_json::to_vec(&record)
            .map_err(LeaseError::from)
            .and_then(|content| {
                file.write_all(&content)
                    .and_then(|()| file.sync_all())
                    .map_err(|e| self.io_err(e))
            });
        if let Err(e) = written {
            let _ = fs::remove_file(&self.path);
            return Err(e);
        }

        log::debug!(target: "lease", "Acquired {} for {owner}", self.path.display());
        Ok(LeaseGuard {
            lease: self.clone(),
            record,
            released: false,
        })
    }

    /// Remove the lease file. Does nothing if the lease is not held.
    pub fn unlock(&self) -> Result<(), LeaseError> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                log::debug!(target: "lease", "Released {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.io_err(e)),
        }
    }

    /// Clear a stale lease, or any lease if `force` is set.
    ///
    /// Returns the record of the cleared lease, [None] if there was none.
    pub fn force_clear(&self, force: bool) -> Result<Option<LeaseRecord>, LeaseError> {
        let record = match self.state()? {
            LeaseState::Free => return Ok(None),
            LeaseState::Held(record) if !force => return Err(LeaseError::Live(record)),
            LeaseState::Held(record) | LeaseState::Stale(record) => record,
        };

        log::warn!(
            target: "lease",
            "Clearing lease {} held by {} since {}",
            self.path.display(),
            record.owner,
            record.acquired_at
        );
        self.unlock()?;
        Ok(Some(record))
    }
}

/// Releases the held [Lease] when dropped.
#[derive(Debug)]
pub struct LeaseGuard {
    lease: Lease,
    record: LeaseRecord,
    released: bool,
}

impl LeaseGuard {
    pub fn record(&self) -> &LeaseRecord {
        &self.record
    }

    /// Release explicitly, reporting failures.
    pub fn release(mut self) -> Result<(), LeaseError> {
        self.released = true;
        self.unlock_if_owned()
    }

    /// Remove the lease file unless it was cleared and taken by someone else.
    fn unlock_if_owned(&self) -> Result<(), LeaseError> {
        match self.lease.read_record()? {
            Some(current) if current.owner != self.record.owner || current.acquired_at != self.record.acquired_at => {
                log::warn!(
                    target: "lease",
                    "Not releasing {}, it was cleared and is held by {} since {}",
                    self.lease.path.display(),
                    current.owner,
                    current.acquired_at
                );
                Ok(())
            }
            _ => self.lease.unlock(),
        }
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.unlock_if_owned() {
            log::error!(target: "lease", "Releasing lease failed: {e}");
        }
    }
}
