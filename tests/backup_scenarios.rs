mod common;

use std::fs;
use std::sync::Arc;

use chrono::{Local, TimeDelta};
use site_backup_lib::archive;
use site_backup_lib::backends::SnapshotBuilder;
use site_backup_lib::config::Settings;
use site_backup_lib::manager::{BackupManager, StartError, StartRequest};
use site_backup_lib::model::{Backup, BackupStatus, BackupType};
use site_backup_lib::notify::NotificationKind;
use site_backup_lib::repositories::RepositoryDescriptor;
use site_backup_lib::store::{BackupStore, MemoryStore};
use site_backup_lib::util::retention::RetentionConfig;
use tempfile::TempDir;

use common::{db_env, read_tree, site, FakeTools, RecordingNotifier};

struct Harness {
    manager: BackupManager,
    store: Arc<MemoryStore>,
    tools: Arc<FakeTools>,
    notifier: Arc<RecordingNotifier>,
}

fn harness(settings: Settings) -> Harness {
    harness_with(settings, RecordingNotifier::default())
}

fn harness_with(settings: Settings, notifier: RecordingNotifier) -> Harness {
    let settings = Arc::new(settings);
    let store = Arc::new(MemoryStore::default());
    let tools = FakeTools::new();
    let notifier = Arc::new(notifier);
    let builder = SnapshotBuilder::new(Arc::clone(&settings), db_env(), tools.clone());
    let manager = BackupManager::new(settings, store.clone(), builder, notifier.clone());
    Harness {
        manager,
        store,
        tools,
        notifier,
    }
}

fn request(backup_type: BackupType, user: Option<&str>) -> StartRequest {
    StartRequest {
        backup_type,
        name: None,
        user: user.map(str::to_string),
    }
}

#[test]
fn test_back_to_back_starts() {
    let temp = TempDir::new().unwrap();
    let h = harness(site(&temp));
    let release = h.tools.gate_dump();

    let first = h.manager.start(request(BackupType::Full, Some("alice"))).unwrap();
    assert_eq!(first.backup.status, BackupStatus::Running);
    assert!(h.manager.is_locked());

    match h.manager.start(request(BackupType::Full, Some("bob"))) {
        Err(StartError::Locked(message)) => assert_eq!(message, "a backup is already running"),
        other => panic!("unexpected result: {:?}", other.err()),
    }
    assert_eq!(h.store.list().unwrap().len(), 1);

    release.send(()).unwrap();
    let finished = first.handle.wait();
    assert_eq!(finished.status, BackupStatus::Completed);
    assert_eq!(h.store.get(finished.id).unwrap(), finished);
    assert!(finished.backup_file.as_ref().unwrap().is_file());
    assert!(!h.manager.is_locked());

    let notifications = h.notifier.notifications.lock().unwrap();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].0, "admins");
    assert_eq!(notifications[0].1.kind, NotificationKind::Completed);
    let updates = h.notifier.updates.lock().unwrap();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].0, "alice");
    assert_eq!(updates[0].1.status, BackupStatus::Completed);
}

#[test]
fn test_full_archive_contents() {
    let temp = TempDir::new().unwrap();
    let h = harness(site(&temp));

    let started = h.manager.start(request(BackupType::Full, None)).unwrap();
    let finished = started.handle.wait();
    assert_eq!(finished.status, BackupStatus::Completed);
    assert!(finished.name.ends_with(" Full"));

    let file = finished.backup_file.unwrap();
    assert!(file.file_name().unwrap().to_string_lossy().starts_with(&format!("backup-{}-", finished.id)));
    let entries = archive::list_entries(&file).unwrap();
    for expected in [
        "media/uploads/logo.png",
        "requirements.txt",
        "sources/main.tar.gz",
        "sources/theme.tar.gz",
        "repositories.json",
        "database.sql",
    ] {
        assert!(entries.iter().any(|entry| entry == expected), "missing {expected} in {entries:?}");
    }
    assert!(entries.iter().any(|entry| entry.ends_with(".sql")));

    let unpacked = temp.path().join("unpacked");
    archive::extract(&file, &unpacked).unwrap();
    let descriptor = RepositoryDescriptor::read(&unpacked.join("repositories.json")).unwrap();
    assert_eq!(descriptor.get("main").unwrap().branch, "master");
    assert_eq!(descriptor.get("theme").unwrap().commit, "0123456789abcdef");
    assert_eq!(
        fs::read_to_string(unpacked.join("requirements.txt")).unwrap(),
        "Django==5.0\npsycopg==3.1\n"
    );

    // staging and partial files are gone
    let leftovers = read_tree(&temp.path().join("backups"));
    assert_eq!(leftovers.len(), 1, "{leftovers:?}");

    let calls = h.tools.calls.lock().unwrap();
    let dump = calls.iter().find(|spec| spec.program == "pg_dump").unwrap();
    assert_eq!(dump.env.get("PGPASSWORD").map(String::as_str), Some("secret"));
    assert!(dump.args.iter().all(|arg| !arg.contains("secret")));
}

#[test]
fn test_partial_archive_skips_sources() {
    let temp = TempDir::new().unwrap();
    let h = harness(site(&temp));

    let finished = h.manager.start(request(BackupType::Partial, None)).unwrap().handle.wait();
    let entries = archive::list_entries(&finished.backup_file.unwrap()).unwrap();
    assert!(entries.contains(&"database.sql".to_string()));
    assert!(entries.contains(&"media/uploads/logo.png".to_string()));
    assert!(!entries.iter().any(|entry| entry.starts_with("sources/")));
    assert!(!entries.contains(&"requirements.txt".to_string()));
    assert!(!h.tools.programs().iter().any(|call| call.starts_with("git")));
}

#[test]
fn test_media_skips_nested_backup_dir() {
    let temp = TempDir::new().unwrap();
    let mut settings = site(&temp);
    settings.backup_dir = settings.media_root.join("backups");
    let h = harness(settings);

    let first = h.manager.start(request(BackupType::Partial, None)).unwrap().handle.wait();
    let second = h.manager.start(request(BackupType::Partial, None)).unwrap().handle.wait();
    assert_eq!(second.status, BackupStatus::Completed);

    let entries = archive::list_entries(&second.backup_file.unwrap()).unwrap();
    assert!(entries.contains(&"media/uploads/logo.png".to_string()));
    assert!(
        !entries.iter().any(|entry| entry.starts_with("media/backups")),
        "{entries:?}"
    );
    assert!(first.backup_file.unwrap().is_file());
}

#[test]
fn test_held_lock_creates_no_row() {
    let temp = TempDir::new().unwrap();
    let h = harness(site(&temp));

    let guard = h.manager.lock().unwrap();
    assert!(matches!(
        h.manager.start(request(BackupType::Full, None)),
        Err(StartError::Locked(_))
    ));
    assert!(h.store.list().unwrap().is_empty());

    drop(guard);
    h.manager.unlock().unwrap();
    let finished = h.manager.start(request(BackupType::Full, None)).unwrap().handle.wait();
    assert_eq!(finished.status, BackupStatus::Completed);
}

#[test]
fn test_daily_limit() {
    let temp = TempDir::new().unwrap();
    let mut settings = site(&temp);
    settings.daily_limit = 2;
    let h = harness(settings);

    for _ in 0..2 {
        let finished = h.manager.start(request(BackupType::Partial, None)).unwrap().handle.wait();
        assert_eq!(finished.status, BackupStatus::Completed);
    }
    let err = h.manager.start(request(BackupType::Partial, None)).err().unwrap();
    assert!(matches!(err, StartError::DailyLimit { limit: 2 }));
    assert_eq!(err.to_string(), "You can only start 2 backups per day");
    assert_eq!(h.store.list().unwrap().len(), 2);
}

#[test]
fn test_min_interval_messages() {
    for (hours, message) in [
        (2.0, "You can only start a backup every 2 hours"),
        (0.5, "You can only start a backup every 30 minutes"),
        (0.001, "You can only start a backup every 3 seconds"),
    ] {
        let temp = TempDir::new().unwrap();
        let mut settings = site(&temp);
        settings.min_interval_hours = hours;
        let h = harness(settings);
        h.store
            .insert(Backup::new_running(None, BackupType::Full, None, Local::now()))
            .unwrap();

        match h.manager.can_start() {
            Err(StartError::TooSoon(text)) => assert_eq!(text, message),
            other => panic!("unexpected result for {hours}: {other:?}"),
        }
    }
}

#[test]
fn test_failed_backup_is_contained() {
    let temp = TempDir::new().unwrap();
    let h = harness(site(&temp));
    h.tools.fail("pg_dump");

    let finished = h.manager.start(request(BackupType::Full, Some("bob"))).unwrap().handle.wait();
    assert_eq!(finished.status, BackupStatus::Failed);
    assert!(finished.backup_file.is_none());
    assert_eq!(h.store.get(finished.id).unwrap().status, BackupStatus::Failed);
    assert!(!h.manager.is_locked());
    assert!(read_tree(&temp.path().join("backups")).is_empty());

    {
        let notifications = h.notifier.notifications.lock().unwrap();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].0, "bob");
        assert_eq!(notifications[0].1.kind, NotificationKind::Failed);
        assert!(notifications[0].1.message.contains("pg_dump exploded"));
    }

    // failed backups don't count towards the limits
    h.tools.failing.lock().unwrap().clear();
    let retry = h.manager.start(request(BackupType::Full, Some("bob"))).unwrap().handle.wait();
    assert_eq!(retry.status, BackupStatus::Completed);
}

#[test]
fn test_unreachable_notifier_is_contained() {
    let temp = TempDir::new().unwrap();
    let h = harness_with(site(&temp), RecordingNotifier::unreachable());
    h.tools.fail("pg_dump");

    let failed = h.manager.start(request(BackupType::Partial, Some("bob"))).unwrap().handle.wait();
    assert_eq!(failed.status, BackupStatus::Failed);
    assert_eq!(h.store.get(failed.id).unwrap(), failed);
    assert!(!h.manager.is_locked());
    assert_eq!(h.notifier.notifications.lock().unwrap().len(), 1);
    assert_eq!(h.notifier.updates.lock().unwrap()[0].1.status, BackupStatus::Failed);

    h.tools.failing.lock().unwrap().clear();
    let completed = h.manager.start(request(BackupType::Partial, Some("bob"))).unwrap().handle.wait();
    assert_eq!(completed.status, BackupStatus::Completed);
    assert_eq!(h.store.get(completed.id).unwrap(), completed);
    assert!(completed.backup_file.unwrap().is_file());
    assert!(!h.manager.is_locked());
    assert_eq!(h.notifier.updates.lock().unwrap().len(), 2);
}

#[test]
fn test_retention_after_success() {
    let temp = TempDir::new().unwrap();
    let mut settings = site(&temp);
    settings.retention = Some(RetentionConfig {
        daily: Some(1),
        weekly: Some(0),
        monthly: Some(0),
        yearly: Some(0),
    });
    let backups = settings.backup_dir.clone();
    let h = harness(settings);

    fs::create_dir_all(&backups).unwrap();
    let old_archive = backups.join("backup-old.zip");
    fs::write(&old_archive, "zip").unwrap();
    let mut old = Backup::new_running(None, BackupType::Full, None, Local::now() - TimeDelta::days(1));
    old.complete(&old_archive).unwrap();
    let old = h.store.insert(old).unwrap();

    let finished = h.manager.start(request(BackupType::Full, None)).unwrap().handle.wait();
    assert_eq!(finished.status, BackupStatus::Completed);

    assert!(h.store.get(old.id).unwrap().deleted);
    assert!(!old_archive.exists());
    assert!(!h.store.get(finished.id).unwrap().deleted);
    assert_eq!(h.manager.list().unwrap(), vec![h.store.get(finished.id).unwrap()]);
}

#[test]
fn test_delete_removes_archive() {
    let temp = TempDir::new().unwrap();
    let h = harness(site(&temp));
    let finished = h.manager.start(request(BackupType::Partial, None)).unwrap().handle.wait();
    let file = finished.backup_file.clone().unwrap();

    let deleted = h.manager.delete(finished.id).unwrap();
    assert!(deleted.deleted);
    assert!(!file.exists());
    assert!(h.manager.list().unwrap().is_empty());
}
