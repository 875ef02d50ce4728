//! Outbound notifications about finished backups.
//!
//! The push channel belongs to the surrounding application. The backup
//! subsystem sends two kinds of messages through a [Notifier]:
//!
//! - a [Notification] to a notification group (or a user on failure),
//! - a [StatusUpdate] to the channel of the user who triggered the backup.

use std::sync::Arc;

use derive_more::{Display, Error, From};

use crate::model::{Backup, BackupId, BackupStatus};
use crate::process::{CommandError, CommandRunner, CommandSpec};

#[derive(Copy, Clone, Debug, Display, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    #[display("completed")]
    Completed,
    #[display("failed")]
    Failed,
}

/// Structured "backup complete/failed" message.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub backup_id: BackupId,
    pub name: String,
    pub message: String,
}

impl Notification {
    pub fn completed(backup: &Backup) -> Self {
        Self {
            kind: NotificationKind::Completed,
            backup_id: backup.id,
            name: backup.name.clone(),
            message: format!("Backup \"{}\" completed", backup.name),
        }
    }

    pub fn failed(backup: &Backup, error: &str) -> Self {
        Self {
            kind: NotificationKind::Failed,
            backup_id: backup.id,
            name: backup.name.clone(),
            message: format!("Backup \"{}\" failed: {error}", backup.name),
        }
    }
}

/// `{id, status}` push to the triggering user.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StatusUpdate {
    pub id: BackupId,
    pub status: BackupStatus,
}

#[derive(Debug, Display, Error, From)]
pub enum NotifyError {
    #[display("notification command failed: {_0}")]
    Command(CommandError),
    #[display("notification could not be encoded: {_0}")]
    Encode(serde_json::Error),
}

/// Delivers notifications to groups and users.
pub trait Notifier: Send + Sync {
    /// Send to a notification group or a single user.
    fn notify(&self, target: &str, notification: &Notification) -> Result<(), NotifyError>;

    /// Push a status change to the channel of `user`.
    fn push_status(&self, user: &str, update: &StatusUpdate) -> Result<(), NotifyError>;
}

/// Only writes notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, target: &str, notification: &Notification) -> Result<(), NotifyError> {
        match notification.kind {
            NotificationKind::Completed => {
                log::info!(target: "notify", "[{target}] {}", notification.message)
            }
            NotificationKind::Failed => {
                log::error!(target: "notify", "[{target}] {}", notification.message)
            }
        }
        Ok(())
    }

    fn push_status(&self, user: &str, update: &StatusUpdate) -> Result<(), NotifyError> {
        log::debug!(target: "notify", "[{user}] backup {} is {}", update.id, update.status);
        Ok(())
    }
}

/// Hands notifications to an external command.
///
/// The command is invoked as `<argv...> <target> <json message>`, e.g.
/// `python manage.py notify admins '{"kind":"completed",...}'`.
pub struct CommandNotifier {
    argv: Vec<String>,
    runner: Arc<dyn CommandRunner>,
}

impl CommandNotifier {
    /// Returns [None] if `argv` is empty.
    pub fn new(argv: Vec<String>, runner: Arc<dyn CommandRunner>) -> Option<Self> {
        if argv.is_empty() {
            return None;
        }
        Some(Self { argv, runner })
    }

    fn send(&self, target: &str, message: String) -> Result<(), NotifyError> {
        let spec = CommandSpec::from_argv(&self.argv)
            .unwrap_or_else(|| CommandSpec::new(""))
            .arg(target)
            .arg(message);
        self.runner.run(&spec)?;
        Ok(())
    }
}

impl Notifier for CommandNotifier {
    fn notify(&self, target: &str, notification: &Notification) -> Result<(), NotifyError> {
        self.send(target, serde_json::to_string(notification)?)
    }

    fn push_status(&self, user: &str, update: &StatusUpdate) -> Result<(), NotifyError> {
        self.send(user, serde_json::to_string(update)?)
    }
}
