//! Restoring a snapshot archive.
//!
//! The [RestoreOrchestrator] replaces database, media, static files and the
//! checked out sources by the content of a snapshot. Every mutating phase
//! registers a [Compensation](saga::Compensation); if a later phase fails the
//! compensations run in reverse order and the original error is returned.

pub mod db;
pub mod dump;
pub mod saga;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Local;
use derive_more::{Display, Error, From};

use crate::archive::{self, ArchiveError, MANIFEST_FILE, MEDIA_DIR, REPOSITORIES_FILE};
use crate::config::{DbEnv, DbEnvError, Settings};
use crate::lease::{owner_id, Lease, LeaseError};
use crate::process::{CommandError, CommandRunner, CommandSpec};
use crate::repositories::{Git, RepositoryDescriptor, RepositoryError};
use crate::util::fs::{copy_dir_recursive, remove_dir_if_exists, with_suffix};
use db::{AdminConnector, DatabaseAdmin, DbError};
use dump::DumpError;
use saga::{move_subtree, Compensation, Saga};

/// Suffix of the set aside live database.
const TMP_DB_SUFFIX: &str = "_tmp";
const BAK_SUFFIX: &str = ".bak";

#[derive(Debug, Display, Error, From)]
pub enum RestoreError {
    #[from(ignore)]
    #[display("a restore is already in progress ({} exists)", _0.display())]
    InProgress(#[error(ignore)] PathBuf),
    #[from(ignore)]
    #[display("missing required environment variables: {}", _0.join(", "))]
    MissingEnvironment(#[error(ignore)] Vec<&'static str>),
    #[from(ignore)]
    #[display("invalid environment: {_0}")]
    Environment(DbEnvError),
    /// Leftovers of an earlier restore have to be cleaned up first.
    #[from(ignore)]
    #[display("{_0}, remove it before restoring")]
    StaleState(#[error(ignore)] String),
    #[from(ignore)]
    #[display("the snapshot has no {_0} directory")]
    Incomplete(#[error(ignore)] &'static str),
    #[display("unpacking the snapshot failed: {_0}")]
    Archive(ArchiveError),
    #[display("{_0}")]
    Command(CommandError),
    #[display("{_0}")]
    Database(DbError),
    #[display("{_0}")]
    Dump(DumpError),
    #[display("{_0}")]
    Repository(RepositoryError),
    #[display("restore marker: {_0}")]
    Marker(LeaseError),
    #[from(ignore)]
    #[display("{context}: {source}")]
    Io { context: String, source: io::Error },
}

impl From<DbEnvError> for RestoreError {
    fn from(e: DbEnvError) -> Self {
        match e {
            DbEnvError::Missing(names) => Self::MissingEnvironment(names),
            other => Self::Environment(other),
        }
    }
}

fn io_err(context: impl Into<String>) -> impl FnOnce(io::Error) -> RestoreError {
    let context = context.into();
    move |source| RestoreError::Io { context, source }
}

/// What a successful restore did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreReport {
    /// Whether the target database existed and was replaced.
    pub replaced_database: bool,
    /// Number of extracted archive entries.
    pub extracted: usize,
    /// Repository keys that were checked out.
    pub repositories: Vec<String>,
    /// Whether the dependency manifest was reinstalled.
    pub reinstalled_dependencies: bool,
}

/// Mutable state of a running restore, needed for rollback and cleanup.
#[derive(Default)]
struct Progress {
    saga: Saga,
    admin: Option<Box<dyn DatabaseAdmin>>,
    work_dir: Option<PathBuf>,
    tmp_database: Option<String>,
    set_aside: Vec<PathBuf>,
    /// Checkouts before the restore changed them.
    prior_checkouts: RepositoryDescriptor,
}

type EnvLookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Restores snapshot archives created by the [SnapshotBuilder](crate::backends::SnapshotBuilder).
pub struct RestoreOrchestrator {
    settings: Arc<Settings>,
    runner: Arc<dyn CommandRunner>,
    connector: Arc<dyn AdminConnector>,
    env: EnvLookup,
}

impl RestoreOrchestrator {
    /// Database credentials are read from the process environment.
    pub fn new(settings: Arc<Settings>, runner: Arc<dyn CommandRunner>, connector: Arc<dyn AdminConnector>) -> Self {
        Self {
            settings,
            runner,
            connector,
            env: Box::new(|key| std::env::var(key).ok()),
        }
    }

    /// Resolve database credentials with `lookup` instead of the process environment.
    pub fn with_env(mut self, lookup: impl Fn(&str) -> Option<String> + Send + Sync + 'static) -> Self {
        self.env = Box::new(lookup);
        self
    }

    pub fn marker(&self) -> Lease {
        Lease::new(self.settings.restore_marker(), None)
    }

    /// Restore `archive`.
    ///
    /// On failure every completed phase is compensated and the original
    /// error is returned. The restore marker is removed in either case.
    pub fn restore(&self, archive: &Path) -> Result<RestoreReport, RestoreError> {
        let marker = self.marker();
        if marker.is_locked() {
            return Err(RestoreError::InProgress(marker.path().to_path_buf()));
        }
        let marker_guard = match marker.lock(&owner_id()) {
            Ok(guard) => guard,
            Err(LeaseError::Held(_)) => return Err(RestoreError::InProgress(marker.path().to_path_buf())),
            Err(e) => return Err(e.into()),
        };
        log::info!(target: "restore", "Restoring {}", archive.display());

        let db = DbEnv::from_lookup(&self.env)?;
        self.check_leftovers()?;

        let mut progress = Progress::default();
        let result = self.apply(archive, &db, &mut progress);

        let Progress {
            saga,
            mut admin,
            work_dir,
            tmp_database,
            set_aside,
            prior_checkouts,
        } = progress;

        let result = match result {
            Ok(report) => {
                saga.commit();
                self.cleanup(work_dir.as_deref(), &set_aside, tmp_database.as_deref(), admin.as_deref_mut());
                Ok(report)
            }
            Err(e) => {
                log::error!(target: "restore", "Restore failed, rolling back: {e}");
                let failed = saga.rollback(admin.as_deref_mut());
                if failed > 0 {
                    log::error!(target: "restore", "{failed} compensations failed, manual repair is required");
                }
                for (key, checkout) in prior_checkouts.iter() {
                    log::warn!(
                        target: "restore",
                        "Repository {key} was at {} ({}) before the restore and is not reset",
                        checkout.commit,
                        checkout.branch
                    );
                }
                Err(e)
            }
        };

        if let Some(admin) = admin {
            if let Err(e) = admin.close() {
                log::warn!(target: "restore::db", "Closing the admin connection failed: {e}");
            }
        }
        if let Err(e) = marker_guard.release() {
            log::error!(target: "restore", "Removing the restore marker failed: {e}");
        }
        if result.is_ok() {
            log::info!(target: "restore", "Restore of {} finished", archive.display());
        }
        result
    }

    fn check_leftovers(&self) -> Result<(), RestoreError> {
        for live in [&self.settings.media_root, &self.settings.static_root] {
            let backup = with_suffix(live, BAK_SUFFIX);
            if backup.exists() {
                return Err(RestoreError::StaleState(format!(
                    "{} is left over from an earlier restore",
                    backup.display()
                )));
            }
        }
        Ok(())
    }

    fn apply(&self, archive: &Path, db: &DbEnv, progress: &mut Progress) -> Result<RestoreReport, RestoreError> {
        // unpack
        let work_dir = self
            .settings
            .backup_dir
            .join(format!("restore-{}", Local::now().format("%Y%m%dT%H%M%S%.3f")));
        fs::create_dir_all(&work_dir).map_err(io_err("creating the restore directory"))?;
        progress.saga.push(Compensation::RemoveWorkDir(work_dir.clone()));
        progress.work_dir = Some(work_dir.clone());
        let extracted = archive::extract(archive, &work_dir)?;
        log::info!(target: "restore", "Unpacked {extracted} files to {}", work_dir.display());

        // probe
        let existed = self.connector.probe(db)?;
        let admin = progress.admin.insert(self.connector.connect(db)?);
        let tmp_database = format!("{}{TMP_DB_SUFFIX}", db.name);
        if admin.database_exists(&tmp_database)? {
            return Err(RestoreError::StaleState(format!(
                "database {tmp_database} is left over from an earlier restore"
            )));
        }

        // set aside the live database
        if existed {
            log::info!(target: "restore", "Renaming database {} to {tmp_database}", db.name);
            admin.rename_database(&db.name, &tmp_database)?;
            progress.saga.push(Compensation::RenameDatabaseBack {
                from: tmp_database.clone(),
                to: db.name.clone(),
            });
            progress.tmp_database = Some(tmp_database);
        }

        log::info!(target: "restore", "Creating database {} owned by {}", db.name, db.user);
        admin.create_database(&db.name, &db.user)?;
        progress.saga.push(Compensation::DropDatabase(db.name.clone()));

        // load dump
        let dump_file = dump::find_dump(&work_dir)?;
        dump::sanitize(&dump_file)?;
        dump::load(self.runner.as_ref(), db, &dump_file)?;

        // media and static files
        self.swap_dirs(&work_dir, progress)?;

        // sources and dependencies
        let repositories = self.checkout_repositories(&work_dir, progress)?;
        if let Some(collect) = CommandSpec::from_argv(&self.settings.collect_static) {
            log::info!(target: "restore", "Collecting static files: {collect}");
            self.runner.run(&collect.current_dir(&self.settings.repository_root))?;
        }
        let reinstalled_dependencies = self.reinstall_dependencies(&work_dir)?;

        Ok(RestoreReport {
            replaced_database: existed,
            extracted,
            repositories,
            reinstalled_dependencies,
        })
    }

    /// Move media and static roots aside and put the snapshot media in place.
    ///
    /// A backup directory inside one of the roots stays where it is: it is
    /// moved from the set aside tree into the new one.
    fn swap_dirs(&self, work_dir: &Path, progress: &mut Progress) -> Result<(), RestoreError> {
        let media = work_dir.join(MEDIA_DIR);
        if !media.is_dir() {
            return Err(RestoreError::Incomplete(MEDIA_DIR));
        }

        for live in [&self.settings.media_root, &self.settings.static_root] {
            if !live.exists() {
                progress.saga.push(Compensation::RestoreDir {
                    live: live.clone(),
                    backup: None,
                    carried: None,
                });
                continue;
            }
            let carried = self.nested_backup_dir(live);
            let backup = with_suffix(live, BAK_SUFFIX);
            fs::rename(live, &backup).map_err(io_err(format!("moving {} aside", live.display())))?;
            progress.set_aside.push(backup.clone());
            progress.saga.push(Compensation::RestoreDir {
                live: live.clone(),
                backup: Some(backup.clone()),
                carried: carried.clone(),
            });
            if let Some(carried) = carried {
                log::debug!(target: "restore", "Keeping {} in {}", carried.display(), live.display());
                move_subtree(&backup, live, &carried)
                    .map_err(io_err(format!("moving the backup directory into {}", live.display())))?;
            }
        }

        let media_root = &self.settings.media_root;
        let bytes = copy_dir_recursive(&media, media_root).map_err(io_err("copying media"))?;
        log::info!(target: "restore", "Restored {bytes} bytes of media to {}", media_root.display());
        fs::create_dir_all(&self.settings.static_root).map_err(io_err("creating static root"))?;
        Ok(())
    }

    /// Location of the backup directory relative to `root`, if it is inside.
    fn nested_backup_dir(&self, root: &Path) -> Option<PathBuf> {
        let root = fs::canonicalize(root).ok()?;
        let backup_dir = fs::canonicalize(&self.settings.backup_dir).ok()?;
        backup_dir
            .strip_prefix(&root)
            .ok()
            .filter(|relative| !relative.as_os_str().is_empty())
            .map(Path::to_path_buf)
    }

    /// Check out the recorded state of every repository of the snapshot.
    fn checkout_repositories(&self, work_dir: &Path, progress: &mut Progress) -> Result<Vec<String>, RestoreError> {
        let descriptor_path = work_dir.join(REPOSITORIES_FILE);
        if !descriptor_path.is_file() {
            log::info!(target: "restore", "The snapshot contains no repository state");
            return Ok(Vec::new());
        }
        let descriptor = RepositoryDescriptor::read(&descriptor_path)?;
        let git = Git::new(self.runner.as_ref());

        let mut restored = Vec::new();
        for (key, checkout) in descriptor.iter() {
            let Some(worktree) = self.settings.repository_path(key) else {
                log::warn!(target: "restore", "Repository {key} is not configured, skipping");
                continue;
            };
            match git.current(&worktree) {
                Ok(prior) => progress.prior_checkouts.insert(key.clone(), prior),
                Err(e) => log::warn!(target: "restore", "Reading the state of {key} failed: {e}"),
            }
            git.checkout(&worktree, checkout)?;
            restored.push(key.clone());
        }
        Ok(restored)
    }

    fn reinstall_dependencies(&self, work_dir: &Path) -> Result<bool, RestoreError> {
        let manifest = work_dir.join(MANIFEST_FILE);
        if !manifest.is_file() {
            return Ok(false);
        }
        let Some(install) = CommandSpec::from_argv(&self.settings.dependencies.install) else {
            log::warn!(target: "restore", "No install command configured, dependencies are not reinstalled");
            return Ok(false);
        };
        let install = install
            .arg(manifest.to_string_lossy())
            .current_dir(&self.settings.repository_root);
        log::info!(target: "restore", "Reinstalling dependencies: {install}");
        self.runner.run(&install)?;
        Ok(true)
    }

    /// Remove what is no longer needed after a successful restore. Failures
    /// are only logged.
    fn cleanup(
        &self,
        work_dir: Option<&Path>,
        set_aside: &[PathBuf],
        tmp_database: Option<&str>,
        admin: Option<&mut (dyn DatabaseAdmin + 'static)>,
    ) {
        let dirs = work_dir.into_iter().chain(set_aside.iter().map(PathBuf::as_path));
        for dir in dirs {
            if let Err(e) = remove_dir_if_exists(dir) {
                log::warn!(target: "restore", "Removing {} failed: {e}", dir.display());
            }
        }
        if let Some(tmp_database) = tmp_database {
            match admin {
                Some(admin) => {
                    log::info!(target: "restore", "Dropping database {tmp_database}");
                    if let Err(e) = admin.drop_database(tmp_database) {
                        log::warn!(target: "restore", "Dropping {tmp_database} failed: {e}");
                    }
                }
                None => log::warn!(target: "restore", "Can't drop {tmp_database} without a database connection"),
            }
        }
    }
}
