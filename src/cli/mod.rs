use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use log::LevelFilter;

use crate::model::{BackupId, BackupType};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Verbosity of the command output.
    #[arg(long, global = true)]
    pub verbose: Option<LevelFilter>,

    /// Settings file. Written with defaults if it doesn't exist.
    #[arg(
        long,
        short = 'c',
        env = "SITE_BACKUP_CONFIG",
        default_value = "/etc/site_backup.toml",
        global = true
    )]
    pub config: PathBuf,

    #[command(subcommand)]
    pub action: Action,
}

#[derive(Subcommand, Debug)]
pub enum Action {
    /// Create a snapshot of database, media and sources.
    Backup(BackupArgs),
    /// Restore a snapshot archive. Database credentials are taken from the environment.
    Restore(RestoreArgs),
    /// List existing backups.
    List,
    /// Delete a finished backup including its archive.
    Delete {
        id: BackupId,
    },
    /// Show or change the automatic backup interval.
    #[command(subcommand)]
    Config(ConfigAction),
    /// Run automatic backups until stdin is closed.
    Daemon,
    /// Inspect or clear the backup lock.
    #[command(subcommand)]
    Lock(LockAction),
}

#[derive(Args, Debug)]
pub struct BackupArgs {
    /// Kind of backup. Partial backups skip sources and dependencies.
    #[arg(long = "type", value_enum, default_value = "full")]
    pub backup_type: BackupType,

    /// Name of the backup. Defaults to creation time and type.
    #[arg(long)]
    pub name: Option<String>,

    /// User to notify about the outcome.
    #[arg(long)]
    pub user: Option<String>,

    /// Return once the backup is started instead of waiting for it.
    #[arg(long)]
    pub no_wait: bool,
}

#[derive(Args, Debug)]
pub struct RestoreArgs {
    /// Snapshot archive to restore.
    pub archive: PathBuf,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the stored configuration.
    Show,
    /// Set the interval of automatic backups in hours.
    SetInterval { hours: u32 },
}

#[derive(Subcommand, Debug)]
pub enum LockAction {
    /// Print holder and age of the backup lock and the restore marker.
    Status,
    /// Remove a stale backup lock.
    Clear {
        /// Remove the lock even if it is not stale.
        #[arg(long)]
        force: bool,

        /// Clear the restore marker instead of the backup lock.
        #[arg(long)]
        restore: bool,
    },
}
