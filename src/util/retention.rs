//! Thinning of old backups.

use std::collections::HashSet;

use chrono::Datelike;

use crate::model::{Backup, BackupId, BackupStatus};

/// Configure retention of completed backups.
///
/// If either value is [None] every backup of the type will be kept.
#[derive(Copy, Clone, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct RetentionConfig {
    /// Defines how many daily backups to keep.
    ///
    /// A daily backup is the newest backup of the day.
    pub daily: Option<usize>,

    /// Defines how many weekly backups to keep.
    ///
    /// A weekly backup is the newest backup of the week.
    pub weekly: Option<usize>,

    /// Defines how many monthly backups to keep.
    ///
    /// A monthly backup is the newest backup of the month.
    pub monthly: Option<usize>,

    /// Defines how many yearly backups to keep.
    ///
    /// A yearly backup is the newest backup of the year.
    pub yearly: Option<usize>,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            daily: Some(7),
            weekly: Some(4),
            monthly: Some(12),
            yearly: Some(3),
        }
    }
}

/// Stateful filter deciding for a sequence of dates, newest first,
/// which ones to keep.
#[derive(Clone, Debug)]
pub struct Retention {
    pub config: RetentionConfig,
    daily: HashSet<(i32, u32)>,
    weekly: HashSet<(i32, u32)>,
    monthly: HashSet<(i32, u32)>,
    yearly: HashSet<i32>,
}

impl From<RetentionConfig> for Retention {
    fn from(config: RetentionConfig) -> Self {
        Self::new(config)
    }
}

impl Retention {
    pub fn new(config: RetentionConfig) -> Self {
        Self {
            config,
            daily: HashSet::new(),
            weekly: HashSet::new(),
            monthly: HashSet::new(),
            yearly: HashSet::new(),
        }
    }

    /// Returns if the [Datelike] is to be retained.
    ///
    /// Dates have to be passed newest first.
    pub fn retain(&mut self, date: impl Datelike) -> bool {
        let Self {
            config,
            daily,
            weekly,
            monthly,
            yearly,
        } = self;

        let new_daily = config
            .daily
            .is_none_or(|keep_daily| daily.len() < keep_daily)
            && daily.insert((date.year(), date.ordinal()));

        let iso_week = date.iso_week();
        let new_weekly = config
            .weekly
            .is_none_or(|keep_weekly| weekly.len() < keep_weekly)
            && weekly.insert((iso_week.year(), iso_week.week()));

        let new_monthly = config
            .monthly
            .is_none_or(|keep_monthly| monthly.len() < keep_monthly)
            && monthly.insert((date.year(), date.month()));

        let new_yearly = config
            .yearly
            .is_none_or(|keep_yearly| yearly.len() < keep_yearly)
            && yearly.insert(date.year());

        new_daily || new_weekly || new_monthly || new_yearly
    }
}

/// Ids of completed, not yet deleted backups which fall out of retention.
pub fn expired_backups(backups: &[Backup], config: RetentionConfig) -> Vec<BackupId> {
    let mut candidates: Vec<&Backup> = backups
        .iter()
        .filter(|backup| !backup.deleted && backup.status == BackupStatus::Completed)
        .collect();
    candidates.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    let mut retention = Retention::new(config);
    candidates
        .into_iter()
        .filter(|backup| !retention.retain(backup.created_at.date_naive()))
        .map(|backup| backup.id)
        .collect()
}
