//! Backend modules contributing to a snapshot archive.
//!
//! Currently the following backends are implemented:
//!
//! - [Media]: The media root, excluding the backup directory.
//! - [Dependencies]: Manifest of the installed packages (full backups).
//! - [Sources]: Source tree and checked out commit of every repository (full backups).
//! - [Postgres]: Logical dump of the database.
//!
//! The [SnapshotBuilder] runs them in this order into a single archive.

pub mod dependencies;
pub mod media;
pub mod postgres;
pub mod sources;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use derive_more::{Display, Error, From};

pub use dependencies::Dependencies;
pub use media::Media;
pub use postgres::Postgres;
pub use sources::Sources;

use crate::archive::{ArchiveError, ArchiveWriter};
use crate::config::{DbEnv, Settings};
use crate::model::{Backup, BackupType};
use crate::process::{CommandError, CommandRunner};
use crate::repositories::RepositoryError;
use crate::util::fs::{remove_file_if_exists, with_suffix, CleanupGuard};

/// Everything a [Backend] needs to contribute to a snapshot.
pub struct SnapshotContext<'a> {
    pub settings: &'a Settings,
    pub db: &'a DbEnv,
    pub runner: &'a dyn CommandRunner,
    /// Scratch directory for intermediate files, removed after the snapshot.
    pub staging: &'a Path,
}

#[derive(Debug, Display, Error, From)]
/// Errors while creating a snapshot.
pub enum SnapshotError {
    #[display("writing the archive failed: {_0}")]
    Archive(ArchiveError),
    #[display("external tool failed: {_0}")]
    Command(CommandError),
    #[display("{_0}")]
    Repository(RepositoryError),
    #[from(ignore)]
    #[display("{context}: {source}")]
    Io { context: String, source: io::Error },
}

impl SnapshotError {
    pub(crate) fn io(context: impl Into<String>) -> impl FnOnce(io::Error) -> Self {
        let context = context.into();
        move |source| Self::Io { context, source }
    }
}

/// Generic snapshot backend.
pub trait Backend {
    /// Name used in log messages.
    fn name(&self) -> &'static str;

    /// Append the data managed by the implementation to `archive`.
    ///
    /// Intermediate files have to be placed in [SnapshotContext::staging] and
    /// should be removed once appended.
    fn snapshot(&self, ctx: &SnapshotContext<'_>, archive: &mut ArchiveWriter) -> Result<(), SnapshotError>;
}

/// Backends contributing to a backup of `backup_type`, in archive order.
pub fn backends_for(backup_type: BackupType) -> Vec<Box<dyn Backend>> {
    let mut backends: Vec<Box<dyn Backend>> = vec![Box::new(Media)];
    if backup_type.is_full() {
        backends.push(Box::new(Dependencies));
        backends.push(Box::new(Sources));
    }
    backends.push(Box::new(Postgres));
    backends
}

/// Assembles the snapshot archive of a [Backup].
pub struct SnapshotBuilder {
    settings: Arc<Settings>,
    db: DbEnv,
    runner: Arc<dyn CommandRunner>,
}

impl SnapshotBuilder {
    pub fn new(settings: Arc<Settings>, db: DbEnv, runner: Arc<dyn CommandRunner>) -> Self {
        Self { settings, db, runner }
    }

    /// Path of the archive of `backup`.
    fn archive_path(&self, backup: &Backup) -> PathBuf {
        let timestamp = backup.created_at.format("%Y-%m-%dT%H-%M-%S");
        self.settings
            .backup_dir
            .join(format!("backup-{}-{timestamp}.zip", backup.id))
    }

    /// Create the archive and return its path.
    ///
    /// Any failing backend aborts the snapshot; no partial archive is left behind.
    pub fn build(&self, backup: &Backup) -> Result<PathBuf, SnapshotError> {
        let backup_dir = &self.settings.backup_dir;
        fs::create_dir_all(backup_dir).map_err(SnapshotError::io(format!(
            "creating backup directory {}",
            backup_dir.display()
        )))?;

        let staging = CleanupGuard::new(backup_dir.join(format!(".staging-{}", backup.id)));
        fs::create_dir_all(staging.path()).map_err(SnapshotError::io("creating staging directory"))?;

        let target = self.archive_path(backup);
        let partial = with_suffix(&target, ".partial");
        log::info!(target: "backup::snapshot", "Create {} snapshot {}", backup.backup_type, target.display());

        let result = self.write_archive(backup, &partial, staging.path());
        if let Err(e) = result {
            if let Err(rm) = remove_file_if_exists(&partial) {
                log::warn!(target: "backup::snapshot", "Removing partial archive {} failed: {rm}", partial.display());
            }
            return Err(e);
        }

        fs::rename(&partial, &target).map_err(SnapshotError::io("moving archive into place"))?;
        log::info!(target: "backup::snapshot", "Finished snapshot {}", target.display());
        Ok(target)
    }

    fn write_archive(&self, backup: &Backup, partial: &Path, staging: &Path) -> Result<(), SnapshotError> {
        let ctx = SnapshotContext {
            settings: &self.settings,
            db: &self.db,
            runner: self.runner.as_ref(),
            staging,
        };

        let mut archive = ArchiveWriter::create(partial)?;
        for backend in backends_for(backup.backup_type) {
            log::debug!(target: "backup::snapshot", "Running backend {}", backend.name());
            backend.snapshot(&ctx, &mut archive)?;
        }
        archive.finish()?;
        Ok(())
    }
}
