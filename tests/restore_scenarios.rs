mod common;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Local;
use site_backup_lib::archive::ArchiveWriter;
use site_backup_lib::backends::SnapshotBuilder;
use site_backup_lib::config::Settings;
use site_backup_lib::lease::owner_id;
use site_backup_lib::model::{Backup, BackupType};
use site_backup_lib::restore::dump::DumpError;
use site_backup_lib::restore::{RestoreError, RestoreOrchestrator};
use tempfile::TempDir;

use common::{db_env, env_lookup, read_tree, site, FakeCluster, FakeConnector, FakeTools, DB_VARS};

/// Create a full snapshot of the current site.
fn snapshot(settings: &Arc<Settings>) -> PathBuf {
    let builder = SnapshotBuilder::new(Arc::clone(settings), db_env(), FakeTools::new());
    let mut backup = Backup::new_running(None, BackupType::Full, None, Local::now());
    backup.id = 1;
    builder.build(&backup).unwrap()
}

fn orchestrator(settings: &Arc<Settings>, tools: &Arc<FakeTools>, cluster: &Arc<FakeCluster>) -> RestoreOrchestrator {
    RestoreOrchestrator::new(
        Arc::clone(settings),
        tools.clone(),
        Arc::new(FakeConnector(Arc::clone(cluster))),
    )
    .with_env(env_lookup(DB_VARS))
}

/// Change the live site so a restore is observable.
fn modify_site(settings: &Settings) {
    fs::remove_file(settings.media_root.join("uploads/logo.png")).unwrap();
    fs::write(settings.media_root.join("uploads/new.png"), "new").unwrap();
}

fn work_dirs(settings: &Settings) -> Vec<String> {
    fs::read_dir(&settings.backup_dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with("restore-"))
        .collect()
}

fn assert_no_leftovers(settings: &Settings) {
    assert!(work_dirs(settings).is_empty(), "{:?}", work_dirs(settings));
    assert!(!Path::new(&format!("{}.bak", settings.media_root.display())).exists());
    assert!(!Path::new(&format!("{}.bak", settings.static_root.display())).exists());
    assert!(!settings.restore_marker().exists());
}

#[test]
fn test_restore_replaces_site() {
    let temp = TempDir::new().unwrap();
    let settings = Arc::new(site(&temp));
    let archive = snapshot(&settings);
    modify_site(&settings);

    let tools = FakeTools::new();
    let cluster = FakeCluster::with_databases(&["site"]);
    let report = orchestrator(&settings, &tools, &cluster).restore(&archive).unwrap();

    assert!(report.replaced_database);
    assert!(report.reinstalled_dependencies);
    assert_eq!(report.repositories, ["main", "theme"]);
    assert_eq!(read_tree(&settings.media_root), ["uploads/logo.png"]);
    assert!(read_tree(&settings.static_root).is_empty());
    assert_eq!(cluster.databases(), ["site"]);
    assert_eq!(
        cluster.journal(),
        ["rename site site_tmp", "create site site", "drop site_tmp"]
    );
    assert_eq!(*cluster.open_connections.lock().unwrap(), 0);
    assert_no_leftovers(&settings);

    let programs = tools.programs();
    for expected in ["psql --host=localhost", "git checkout", "python manage.py", "pip install"] {
        assert!(programs.iter().any(|call| call == expected), "missing {expected} in {programs:?}");
    }
    let calls = tools.calls.lock().unwrap();
    let checkouts: Vec<_> = calls
        .iter()
        .filter(|spec| spec.program == "git" && spec.args[0] == "checkout")
        .map(|spec| (spec.current_dir.clone().unwrap(), spec.args[1].clone()))
        .collect();
    let theme = settings.repository_root.join("themes/default");
    assert_eq!(
        checkouts,
        [
            (settings.repository_root.clone(), "master".to_string()),
            (settings.repository_root.clone(), "0123456789abcdef".to_string()),
            (theme.clone(), "master".to_string()),
            (theme, "0123456789abcdef".to_string()),
        ]
    );
    let load = calls.iter().find(|spec| spec.program == "psql").unwrap();
    assert_eq!(load.env.get("PGPASSWORD").map(String::as_str), Some("secret"));
}

#[test]
fn test_restore_into_missing_database() {
    let temp = TempDir::new().unwrap();
    let settings = Arc::new(site(&temp));
    let archive = snapshot(&settings);

    let cluster = FakeCluster::with_databases(&[]);
    let report = orchestrator(&settings, &FakeTools::new(), &cluster)
        .restore(&archive)
        .unwrap();

    assert!(!report.replaced_database);
    assert_eq!(cluster.databases(), ["site"]);
    assert_eq!(cluster.journal(), ["create site site"]);
    assert_no_leftovers(&settings);
}

#[test]
fn test_failed_create_rolls_back() {
    let temp = TempDir::new().unwrap();
    let settings = Arc::new(site(&temp));
    let archive = snapshot(&settings);
    modify_site(&settings);

    let tools = FakeTools::new();
    let cluster = FakeCluster::with_databases(&["site"]);
    *cluster.fail_create.lock().unwrap() = true;

    let err = orchestrator(&settings, &tools, &cluster).restore(&archive).unwrap_err();
    assert!(matches!(err, RestoreError::Database(_)), "{err}");
    assert!(err.to_string().contains("permission denied"));

    assert_eq!(cluster.databases(), ["site"]);
    assert_eq!(
        cluster.journal(),
        ["rename site site_tmp", "create site site", "rename site_tmp site"]
    );
    assert_eq!(*cluster.open_connections.lock().unwrap(), 0);
    // live files are untouched
    assert_eq!(read_tree(&settings.media_root), ["uploads/new.png"]);
    assert_eq!(read_tree(&settings.static_root), ["app.css"]);
    assert!(!tools.programs().iter().any(|call| call.starts_with("psql")));
    assert_no_leftovers(&settings);
}

#[test]
fn test_failed_load_rolls_back() {
    let temp = TempDir::new().unwrap();
    let settings = Arc::new(site(&temp));
    let archive = snapshot(&settings);
    modify_site(&settings);

    let tools = FakeTools::new();
    *tools.psql_stderr.lock().unwrap() = "ERROR:  relation \"page\" already exists\n".into();
    let cluster = FakeCluster::with_databases(&["site"]);

    let err = orchestrator(&settings, &tools, &cluster).restore(&archive).unwrap_err();
    assert!(matches!(err, RestoreError::Dump(DumpError::Load(_))), "{err}");

    assert_eq!(cluster.databases(), ["site"]);
    assert_eq!(
        cluster.journal(),
        [
            "rename site site_tmp",
            "create site site",
            "drop site",
            "rename site_tmp site"
        ]
    );
    assert_eq!(read_tree(&settings.media_root), ["uploads/new.png"]);
    assert_no_leftovers(&settings);
}

#[test]
fn test_failed_checkout_restores_files() {
    let temp = TempDir::new().unwrap();
    let settings = Arc::new(site(&temp));
    let archive = snapshot(&settings);
    modify_site(&settings);

    let tools = FakeTools::new();
    tools.fail("git checkout");
    let cluster = FakeCluster::with_databases(&["site"]);

    let err = orchestrator(&settings, &tools, &cluster).restore(&archive).unwrap_err();
    assert!(matches!(err, RestoreError::Repository(_)), "{err}");

    assert_eq!(cluster.databases(), ["site"]);
    assert_eq!(read_tree(&settings.media_root), ["uploads/new.png"]);
    assert_eq!(read_tree(&settings.static_root), ["app.css"]);
    assert!(!tools.programs().iter().any(|call| call.starts_with("pip install")));
    assert_no_leftovers(&settings);
}

#[test]
fn test_sql_upload_is_not_a_dump() {
    let temp = TempDir::new().unwrap();
    let settings = Arc::new(site(&temp));
    fs::write(settings.media_root.join("uploads/schema.sql"), "DROP TABLE page;").unwrap();
    let archive = snapshot(&settings);

    let tools = FakeTools::new();
    let cluster = FakeCluster::with_databases(&["site"]);
    orchestrator(&settings, &tools, &cluster).restore(&archive).unwrap();

    let calls = tools.calls.lock().unwrap();
    let load = calls.iter().find(|spec| spec.program == "psql").unwrap();
    assert!(load.args.last().unwrap().ends_with("database.sql"), "{:?}", load.args);
    assert_eq!(read_tree(&settings.media_root), ["uploads/logo.png", "uploads/schema.sql"]);
}

/// Site whose backup directory lives inside the media root.
fn nested_site(temp: &TempDir) -> Arc<Settings> {
    let mut settings = site(temp);
    settings.backup_dir = settings.media_root.join("backups");
    Arc::new(settings)
}

fn media_without_backups(settings: &Settings) -> Vec<String> {
    read_tree(&settings.media_root)
        .into_iter()
        .filter(|file| !file.starts_with("backups/"))
        .collect()
}

#[test]
fn test_restore_keeps_nested_backup_dir() {
    let temp = TempDir::new().unwrap();
    let settings = nested_site(&temp);
    let archive = snapshot(&settings);
    fs::write(settings.records_file(), "{}").unwrap();
    modify_site(&settings);

    let tools = FakeTools::new();
    let cluster = FakeCluster::with_databases(&["site"]);
    let report = orchestrator(&settings, &tools, &cluster).restore(&archive).unwrap();

    assert_eq!(report.repositories, ["main", "theme"]);
    assert!(report.reinstalled_dependencies);
    assert_eq!(media_without_backups(&settings), ["uploads/logo.png"]);
    assert!(archive.is_file());
    assert!(settings.records_file().is_file());
    assert_no_leftovers(&settings);

    // the kept archive can be restored again
    modify_site(&settings);
    orchestrator(&settings, &FakeTools::new(), &cluster)
        .restore(&archive)
        .unwrap();
    assert_eq!(media_without_backups(&settings), ["uploads/logo.png"]);
}

#[test]
fn test_failed_restore_keeps_nested_backup_dir() {
    let temp = TempDir::new().unwrap();
    let settings = nested_site(&temp);
    let archive = snapshot(&settings);
    fs::write(settings.records_file(), "{}").unwrap();
    modify_site(&settings);

    let tools = FakeTools::new();
    tools.fail("git checkout");
    let cluster = FakeCluster::with_databases(&["site"]);
    let err = orchestrator(&settings, &tools, &cluster).restore(&archive).unwrap_err();
    assert!(matches!(err, RestoreError::Repository(_)), "{err}");

    assert_eq!(media_without_backups(&settings), ["uploads/new.png"]);
    assert!(archive.is_file());
    assert!(settings.records_file().is_file());
    assert_no_leftovers(&settings);
}

#[test]
fn test_snapshot_without_media_is_rejected() {
    let temp = TempDir::new().unwrap();
    let settings = Arc::new(site(&temp));
    modify_site(&settings);

    let dump = temp.path().join("database.sql");
    fs::write(&dump, "SELECT 1;").unwrap();
    fs::create_dir_all(&settings.backup_dir).unwrap();
    let mut writer = ArchiveWriter::create(&settings.backup_dir.join("handmade.zip")).unwrap();
    writer.append_file(&dump, "database.sql").unwrap();
    let archive = writer.finish().unwrap();

    let cluster = FakeCluster::with_databases(&["site"]);
    let err = orchestrator(&settings, &FakeTools::new(), &cluster)
        .restore(&archive)
        .unwrap_err();

    assert!(matches!(err, RestoreError::Incomplete("media")), "{err}");
    assert_eq!(cluster.databases(), ["site"]);
    assert_eq!(read_tree(&settings.media_root), ["uploads/new.png"]);
    assert_eq!(read_tree(&settings.static_root), ["app.css"]);
    assert_no_leftovers(&settings);
}

#[test]
fn test_missing_password_is_rejected_early() {
    let temp = TempDir::new().unwrap();
    let settings = Arc::new(site(&temp));
    let archive = snapshot(&settings);

    let tools = FakeTools::new();
    let cluster = FakeCluster::with_databases(&["site"]);
    let err = orchestrator(&settings, &tools, &cluster)
        .with_env(env_lookup(&[("DB_NAME", "site"), ("DB_USER", "site")]))
        .restore(&archive)
        .unwrap_err();

    match &err {
        RestoreError::MissingEnvironment(names) => assert_eq!(names, &["DB_PASSWORD"]),
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.to_string().contains("DB_PASSWORD"));
    assert!(cluster.journal().is_empty());
    assert_eq!(*cluster.open_connections.lock().unwrap(), 0);
    assert!(tools.calls.lock().unwrap().is_empty());
    assert_no_leftovers(&settings);
}

#[test]
fn test_sequential_restores() {
    let temp = TempDir::new().unwrap();
    let settings = Arc::new(site(&temp));
    let archive = snapshot(&settings);
    let cluster = FakeCluster::with_databases(&["site"]);

    for _ in 0..2 {
        modify_site(&settings);
        orchestrator(&settings, &FakeTools::new(), &cluster)
            .restore(&archive)
            .unwrap();

        assert_eq!(cluster.databases(), ["site"]);
        assert_eq!(read_tree(&settings.media_root), ["uploads/logo.png"]);
        assert!(read_tree(&settings.static_root).is_empty());
        assert_no_leftovers(&settings);
    }
}

#[test]
fn test_restore_in_progress() {
    let temp = TempDir::new().unwrap();
    let settings = Arc::new(site(&temp));
    let archive = snapshot(&settings);

    let tools = FakeTools::new();
    let cluster = FakeCluster::with_databases(&["site"]);
    let orchestrator = orchestrator(&settings, &tools, &cluster);
    let guard = orchestrator.marker().lock(&owner_id()).unwrap();

    let err = orchestrator.restore(&archive).unwrap_err();
    assert!(matches!(err, RestoreError::InProgress(_)), "{err}");
    assert!(tools.calls.lock().unwrap().is_empty());
    assert!(settings.restore_marker().exists());

    guard.release().unwrap();
    orchestrator.restore(&archive).unwrap();
}

#[test]
fn test_leftover_tmp_database() {
    let temp = TempDir::new().unwrap();
    let settings = Arc::new(site(&temp));
    let archive = snapshot(&settings);

    let cluster = FakeCluster::with_databases(&["site", "site_tmp"]);
    let err = orchestrator(&settings, &FakeTools::new(), &cluster)
        .restore(&archive)
        .unwrap_err();

    assert!(matches!(err, RestoreError::StaleState(_)), "{err}");
    assert!(err.to_string().contains("site_tmp"));
    assert_eq!(cluster.databases(), ["site", "site_tmp"]);
    assert!(cluster.journal().is_empty());
    assert_eq!(*cluster.open_connections.lock().unwrap(), 0);
    assert_no_leftovers(&settings);
}

#[test]
fn test_leftover_bak_directory() {
    let temp = TempDir::new().unwrap();
    let settings = Arc::new(site(&temp));
    let archive = snapshot(&settings);
    let media_bak = PathBuf::from(format!("{}.bak", settings.media_root.display()));
    fs::create_dir_all(&media_bak).unwrap();

    let cluster = FakeCluster::with_databases(&["site"]);
    let err = orchestrator(&settings, &FakeTools::new(), &cluster)
        .restore(&archive)
        .unwrap_err();

    assert!(matches!(err, RestoreError::StaleState(_)), "{err}");
    assert!(cluster.journal().is_empty());
    assert!(media_bak.is_dir());
    assert!(work_dirs(&settings).is_empty());
    assert!(!settings.restore_marker().exists());
}

#[test]
fn test_multiple_dumps_are_rejected() {
    let temp = TempDir::new().unwrap();
    let settings = Arc::new(site(&temp));

    let sources = temp.path().join("sources");
    fs::create_dir_all(&sources).unwrap();
    fs::write(sources.join("a.sql"), "SELECT 1;").unwrap();
    fs::write(sources.join("b.SQL"), "SELECT 2;").unwrap();
    fs::create_dir_all(&settings.backup_dir).unwrap();
    let mut writer = ArchiveWriter::create(&settings.backup_dir.join("handmade.zip")).unwrap();
    writer.append_file(&sources.join("a.sql"), "database.sql").unwrap();
    writer.append_file(&sources.join("b.SQL"), "old.SQL").unwrap();
    let archive = writer.finish().unwrap();

    let tools = FakeTools::new();
    let cluster = FakeCluster::with_databases(&["site"]);
    let err = orchestrator(&settings, &tools, &cluster).restore(&archive).unwrap_err();

    match err {
        RestoreError::Dump(DumpError::MultipleDumps(found)) => assert_eq!(found.len(), 2),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(cluster.databases(), ["site"]);
    assert_eq!(
        cluster.journal(),
        [
            "rename site site_tmp",
            "create site site",
            "drop site",
            "rename site_tmp site"
        ]
    );
    assert!(tools.calls.lock().unwrap().is_empty());
    assert_no_leftovers(&settings);
}
