use std::io;
use std::path::Path;
use std::process::ExitCode;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;

use clap::Parser;
use derive_more::{Display, Error, From};

use site_backup_lib::backends::SnapshotBuilder;
use site_backup_lib::cli::{Action, BackupArgs, Cli, ConfigAction, LockAction};
use site_backup_lib::config::{DbEnv, DbEnvError, Settings, SettingsError};
use site_backup_lib::lease::{Lease, LeaseError, LeaseState};
use site_backup_lib::manager::{delete_backup, BackupManager, StartError, StartRequest};
use site_backup_lib::model::{Backup, BackupConfig, BackupId, BackupStatus, DEFAULT_AUTOMATIC_BACKUP_HOUR_INTERVAL};
use site_backup_lib::notify::{CommandNotifier, LogNotifier, Notifier};
use site_backup_lib::process::{CommandRunner, SystemRunner};
use site_backup_lib::restore::db::PgConnector;
use site_backup_lib::restore::{RestoreError, RestoreOrchestrator};
use site_backup_lib::scheduler::{automatic_backup, BackupConfigService, ConfigError, Scheduler};
use site_backup_lib::store::{BackupStore, JsonFileStore, StoreError};

#[derive(Debug, Display, Error, From)]
enum AppError {
    #[display("{_0}")]
    Settings(SettingsError),
    #[display("{_0}")]
    Environment(DbEnvError),
    #[display("{_0}")]
    Start(StartError),
    #[display("{_0}")]
    Store(StoreError),
    #[display("Restore failed: {_0}")]
    Restore(RestoreError),
    #[display("{_0}")]
    Config(ConfigError),
    #[display("{_0}")]
    Lease(LeaseError),
    #[from(ignore)]
    #[display("Backup {_0} failed")]
    BackupFailed(#[error(ignore)] BackupId),
}

/// Components shared by the subcommands.
struct App {
    settings: Arc<Settings>,
    runner: Arc<dyn CommandRunner>,
    store: Arc<JsonFileStore>,
}

impl App {
    fn new(config: &Path) -> Result<Self, AppError> {
        let settings = Arc::new(Settings::load_or_init(config)?);
        let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner::new(settings.command_timeout()));
        let store = Arc::new(JsonFileStore::new(settings.records_file()));
        Ok(Self {
            settings,
            runner,
            store,
        })
    }

    fn notifier(&self) -> Arc<dyn Notifier> {
        let command = self
            .settings
            .notification_command
            .clone()
            .and_then(|argv| CommandNotifier::new(argv, Arc::clone(&self.runner)));
        match command {
            Some(notifier) => Arc::new(notifier),
            None => Arc::new(LogNotifier),
        }
    }

    fn manager(&self) -> Result<BackupManager, AppError> {
        let db = DbEnv::from_env()?;
        let builder = SnapshotBuilder::new(Arc::clone(&self.settings), db, Arc::clone(&self.runner));
        Ok(BackupManager::new(
            Arc::clone(&self.settings),
            self.store.clone(),
            builder,
            self.notifier(),
        ))
    }

    fn config_service(&self, scheduler: Arc<Scheduler>, manager: Option<Arc<BackupManager>>) -> BackupConfigService {
        match manager {
            Some(manager) => BackupConfigService::new(
                self.store.clone(),
                scheduler,
                automatic_backup(manager),
                self.settings.automatic_backups,
            ),
            // only edits the stored configuration
            None => BackupConfigService::new(self.store.clone(), scheduler, Arc::new(|| {}), false),
        }
    }
}

fn print_backup(backup: &Backup) {
    let file = backup
        .backup_file
        .as_ref()
        .map(|file| file.display().to_string())
        .unwrap_or_default();
    println!(
        "{}\t{}\t{}\t{}\t{}\t{file}",
        backup.id,
        backup.status,
        backup.backup_type,
        backup.created_at.format("%Y-%m-%d %H:%M:%S"),
        backup.name
    );
}

fn print_lease(name: &str, lease: &Lease) -> Result<(), AppError> {
    match lease.state()? {
        LeaseState::Free => println!("{name}: free"),
        LeaseState::Held(record) => println!("{name}: held by {} since {}", record.owner, record.acquired_at),
        LeaseState::Stale(record) => println!(
            "{name}: stale, held by {} since {} (clear with `lock clear`)",
            record.owner, record.acquired_at
        ),
    }
    Ok(())
}

fn backup(app: &App, args: BackupArgs) -> Result<(), AppError> {
    let manager = app.manager()?;
    let started = manager.start(StartRequest {
        backup_type: args.backup_type,
        name: args.name,
        user: args.user,
    })?;
    log::info!("Started backup {} '{}'", started.backup.id, started.backup.name);
    if args.no_wait {
        return Ok(());
    }

    let finished = started.handle.wait();
    print_backup(&finished);
    if finished.status == BackupStatus::Failed {
        return Err(AppError::BackupFailed(finished.id));
    }
    Ok(())
}

fn restore(app: &App, archive: &Path) -> Result<(), AppError> {
    let orchestrator = RestoreOrchestrator::new(
        Arc::clone(&app.settings),
        Arc::clone(&app.runner),
        Arc::new(PgConnector),
    );
    let report = orchestrator.restore(archive)?;
    log::info!(
        "Restored {} entries, database replaced: {}, repositories: {}",
        report.extracted,
        report.replaced_database,
        report.repositories.join(", ")
    );
    Ok(())
}

fn config(app: &App, action: ConfigAction) -> Result<(), AppError> {
    let service = app.config_service(Arc::new(Scheduler::new()), None);
    match action {
        ConfigAction::Show => match service.get()? {
            Some(config) => println!("automatic_backup_hour_interval = {}", config.automatic_backup_hour_interval),
            None => println!(
                "not configured (defaults to {DEFAULT_AUTOMATIC_BACKUP_HOUR_INTERVAL} hours once automatic backups run)"
            ),
        },
        ConfigAction::SetInterval { hours } => {
            if service.get()?.is_some() {
                service.update(hours)?;
            } else {
                service.create(BackupConfig {
                    automatic_backup_hour_interval: hours,
                })?;
            }
            println!("automatic_backup_hour_interval = {hours}");
        }
    }
    Ok(())
}

fn daemon(app: &App) -> Result<(), AppError> {
    let manager = Arc::new(app.manager()?);
    let scheduler = Arc::new(Scheduler::start(app.settings.scheduler_poll()));
    let service = app.config_service(Arc::clone(&scheduler), Some(manager));
    match service.init()? {
        Some(config) => log::info!(
            "Automatic backups every {} hours",
            config.automatic_backup_hour_interval
        ),
        None => log::warn!("Automatic backups are disabled in the settings"),
    }

    // stdin closing is the shutdown signal
    let (closed_tx, closed) = mpsc::channel::<()>();
    thread::spawn(move || {
        let _ = io::copy(&mut io::stdin().lock(), &mut io::sink());
        let _ = closed_tx.send(());
    });

    loop {
        match closed.recv_timeout(app.settings.scheduler_poll()) {
            Err(RecvTimeoutError::Timeout) => {
                if let Err(e) = service.refresh() {
                    log::warn!(target: "scheduler", "Reloading the backup configuration failed: {e}");
                }
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    log::info!("Shutting down");
    scheduler.shutdown();
    Ok(())
}

fn lock(app: &App, action: LockAction) -> Result<(), AppError> {
    let backup_lock = Lease::new(app.settings.lock_file(), Some(app.settings.lock_ttl()));
    let restore_marker = Lease::new(app.settings.restore_marker(), None);
    match action {
        LockAction::Status => {
            print_lease("backup lock", &backup_lock)?;
            print_lease("restore marker", &restore_marker)?;
        }
        LockAction::Clear { force, restore } => {
            let lease = if restore { &restore_marker } else { &backup_lock };
            match lease.force_clear(force)? {
                Some(record) => println!("Cleared {} held by {}", lease.path().display(), record.owner),
                None => println!("{} is not locked", lease.path().display()),
            }
        }
    }
    Ok(())
}

fn run(cli: Cli) -> Result<(), AppError> {
    let app = App::new(&cli.config)?;
    match cli.action {
        Action::Backup(args) => backup(&app, args),
        Action::Restore(args) => restore(&app, &args.archive),
        Action::List => {
            for backup in app.store.list()?.iter().filter(|backup| !backup.deleted) {
                print_backup(backup);
            }
            Ok(())
        }
        Action::Delete { id } => {
            let backup = delete_backup(app.store.as_ref(), id)?;
            println!("Deleted backup {} '{}'", backup.id, backup.name);
            Ok(())
        }
        Action::Config(action) => config(&app, action),
        Action::Daemon => daemon(&app),
        Action::Lock(action) => lock(&app, action),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // init logger
    let mut env_logger = env_logger::builder();
    if let Some(level) = cli.verbose {
        env_logger.filter_level(level);
    }
    if let Err(e) = env_logger.try_init() {
        eprintln!("Initializing the logger failed: {e}");
    }

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}
