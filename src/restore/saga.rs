//! Undo log of the mutating restore phases.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use super::db::DatabaseAdmin;
use crate::util::fs::remove_dir_if_exists;

/// Undo action of a completed phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compensation {
    /// Remove the unpacked snapshot.
    RemoveWorkDir(PathBuf),
    /// Rename the set aside live database back to its name.
    RenameDatabaseBack { from: String, to: String },
    /// Drop the freshly created database.
    DropDatabase(String),
    /// Replace `live` by the set aside `backup`, or just remove it if there
    /// was nothing to set aside.
    ///
    /// `carried` is a subtree that was moved from `backup` into `live` and
    /// is moved back first.
    RestoreDir {
        live: PathBuf,
        backup: Option<PathBuf>,
        carried: Option<PathBuf>,
    },
}

impl Compensation {
    fn run<'a>(&self, admin: Option<&mut (dyn DatabaseAdmin + 'a)>) -> Result<(), String> {
        match self {
            Self::RemoveWorkDir(dir) => remove_dir_if_exists(dir).map_err(|e| e.to_string()),
            Self::RenameDatabaseBack { from, to } => {
                let admin = admin.ok_or("no database connection")?;
                admin.rename_database(from, to).map_err(|e| e.to_string())
            }
            Self::DropDatabase(name) => {
                let admin = admin.ok_or("no database connection")?;
                admin.drop_database(name).map_err(|e| e.to_string())
            }
            Self::RestoreDir { live, backup, carried } => {
                if let (Some(backup), Some(carried)) = (backup, carried) {
                    move_subtree(live, backup, carried).map_err(|e| e.to_string())?;
                }
                remove_dir_if_exists(live).map_err(|e| e.to_string())?;
                match backup {
                    Some(backup) => fs::rename(backup, live).map_err(|e| e.to_string()),
                    None => Ok(()),
                }
            }
        }
    }
}

/// Move `from/relative` to `to/relative` if it exists, creating parents.
pub fn move_subtree(from: &Path, to: &Path, relative: &Path) -> io::Result<()> {
    let source = from.join(relative);
    if !source.exists() {
        return Ok(());
    }
    let target = to.join(relative);
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::rename(source, target)
}

/// Stack of [Compensation]s, run in reverse order on rollback.
#[derive(Debug, Default)]
pub struct Saga {
    steps: Vec<Compensation>,
}

impl Saga {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the compensation of a phase that just completed.
    pub fn push(&mut self, compensation: Compensation) {
        log::trace!(target: "restore::saga", "Registered compensation {compensation:?}");
        self.steps.push(compensation);
    }

    pub fn steps(&self) -> &[Compensation] {
        &self.steps
    }

    /// Discard all compensations. The restore can no longer be rolled back.
    pub fn commit(self) {
        log::debug!(target: "restore::saga", "Committed, discarding {} compensations", self.steps.len());
    }

    /// Run all compensations, newest first. Failures are logged and don't
    /// stop the remaining compensations.
    ///
    /// Returns the number of failed compensations.
    pub fn rollback<'a>(mut self, mut admin: Option<&mut (dyn DatabaseAdmin + 'a)>) -> usize {
        let mut failed = 0;
        while let Some(step) = self.steps.pop() {
            log::info!(target: "restore::saga", "Rolling back: {step:?}");
            if let Err(e) = step.run(admin.as_deref_mut()) {
                log::error!(target: "restore::saga", "Compensation {step:?} failed: {e}");
                failed += 1;
            }
        }
        failed
    }
}
