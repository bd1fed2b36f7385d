//! Vaultline backup service
//!
//! Runs the backup worker, scheduler and maintenance loop, or a single operation
//! from the command line.

use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use vaultline::archive::{ArchiveBuilder, PgDump};
use vaultline::audit::PgAuditLog;
use vaultline::config::AppConfig;
use vaultline::logging;
use vaultline::maintenance::Maintenance;
use vaultline::orchestrator::Orchestrator;
use vaultline::queue::JobQueue;
use vaultline::reaper::{RetentionReaper, StuckRunReaper};
use vaultline::registry::DestinationRegistry;
use vaultline::scheduler::Scheduler;
use vaultline::settings::PgSettings;
use vaultline::storage::CloudProviders;
use vaultline::store::PgBackupStore;

/// Main entry point for the backup service
#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    logging::init();
    match run_app().await {
        Ok(_) => {
            println!("✅ Operation completed successfully.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

struct Services {
    config: AppConfig,
    settings: Arc<PgSettings>,
    registry: DestinationRegistry,
    orchestrator: Arc<Orchestrator>,
    stuck: Arc<StuckRunReaper>,
    retention: Arc<RetentionReaper>,
}

async fn build_services(config: AppConfig) -> Result<Services> {
    let store = Arc::new(
        PgBackupStore::connect(&config.database_url)
            .await
            .context("Failed to connect to the application database")?,
    );
    store.migrate().await.context("Failed to apply backup migrations")?;

    let settings = Arc::new(PgSettings::new(store.pool().clone()));
    let audit = Arc::new(PgAuditLog::new(store.pool().clone()));
    let providers = Arc::new(CloudProviders);
    let archiver = Arc::new(ArchiveBuilder::new(
        Arc::new(PgDump::new(config.database_url.clone())),
        config.uploads_dir.clone(),
        config.env_file.clone(),
        config.app_version.clone(),
    ));
    let retention = Arc::new(RetentionReaper::new(
        store.clone(),
        settings.clone(),
        providers.clone(),
    ));
    let stuck = Arc::new(StuckRunReaper::new(store.clone(), config.stuck_timeouts));
    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        providers.clone(),
        archiver,
        audit,
        retention.clone(),
        config.temp_root.clone(),
    ));
    let registry = DestinationRegistry::new(store, providers);

    Ok(Services {
        config,
        settings,
        registry,
        orchestrator,
        stuck,
        retention,
    })
}

async fn run_app() -> Result<()> {
    let config_path = PathBuf::from("config.json");
    let config = AppConfig::load(&config_path).context(format!(
        "Failed to load application configuration from {}",
        config_path.display()
    ))?;

    let args: Vec<String> = env::args().collect();
    let choice = if args.len() > 1 {
        args[1].trim().to_string()
    } else {
        prompt_choice()?
    };

    let services = build_services(config).await?;

    match choice.as_str() {
        "1" | "serve" => {
            println!("🚀 Starting backup service...");
            serve(services).await.context("Backup service failed")?;
        }
        "2" | "backup" => {
            println!("📦 Running a manual backup...");
            let finished = services
                .orchestrator
                .run_manual_now(None)
                .await
                .context("Backup run failed")?;
            let details = match finished {
                Some(run) => services.orchestrator.run_details(run.id).await?,
                None => None,
            };
            if let Some((run, uploads)) = details {
                println!(
                    "Run {}: {} ({})",
                    run.id,
                    run.status,
                    run.file_name.as_deref().unwrap_or("-")
                );
                for upload in uploads {
                    println!(
                        "  {} → {}{}",
                        upload.destination_name,
                        upload.status,
                        upload.error.map(|e| format!(" ({e})")).unwrap_or_default()
                    );
                }
            }
        }
        "3" | "sweep" => {
            println!("🧹 Running maintenance sweep...");
            let failed = services.stuck.sweep().await?;
            let report = services.retention.sweep().await?;
            println!(
                "Stuck runs failed: {}. Expired runs removed: {} ({} remote copies deleted, {} delete failures).",
                failed, report.runs_deleted, report.remote_deleted, report.remote_failures
            );
        }
        "4" | "destinations" => {
            let destinations = services.registry.list().await?;
            if destinations.is_empty() {
                println!("No backup destinations configured.");
            }
            for d in destinations {
                println!(
                    "{}  {:<24} {:<13} {}",
                    d.id,
                    d.name,
                    d.provider.as_str(),
                    if d.is_active { "active" } else { "inactive" }
                );
            }
        }
        "5" | "runs" => {
            for run in services.orchestrator.list_runs(20).await? {
                println!(
                    "{}  {}  {:<9} {:<9} {}",
                    run.id,
                    run.created_at.format("%Y-%m-%d %H:%M"),
                    run.cause.as_str(),
                    run.status.as_str(),
                    run.error.as_deref().unwrap_or("")
                );
            }
        }
        "6" | "test" => {
            let id = match args.get(2) {
                Some(id) => id.clone(),
                None => prompt_line("Destination id")?,
            };
            let id = Uuid::parse_str(id.trim()).context("Destination id must be a UUID")?;
            services.registry.test_connection(id).await?;
            println!("✓ Connection OK");
        }
        _ => {
            println!("❌ Invalid choice. Please enter 1-6 or one of: serve, backup, sweep, destinations, runs, test.");
            anyhow::bail!("Invalid operation choice");
        }
    }
    Ok(())
}

async fn serve(services: Services) -> Result<()> {
    let (queue, worker) = JobQueue::start(
        services.orchestrator.clone(),
        services.config.retry_policy,
    );

    let scheduler = Scheduler::new(queue.clone(), services.settings.clone());
    let cadence = scheduler.sync_from_settings().await?;
    info!("Backup schedule: {}", cadence);

    let cancel = CancellationToken::new();
    let maintenance = Arc::new(Maintenance::new(services.stuck, services.retention))
        .spawn(services.config.maintenance_interval, cancel.clone());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    println!("Shutting down; waiting for the current backup to finish...");

    scheduler.shutdown().await;
    cancel.cancel();
    maintenance.await.context("Maintenance loop panicked")?;
    drop(scheduler);
    drop(queue);
    worker.await.context("Backup worker panicked")?;
    Ok(())
}

/// Prompts user to select an operation
///
/// Returns the user's choice as String
fn prompt_choice() -> Result<String> {
    println!("Select an operation:");
    println!("1. Run the backup service (or type 'serve')");
    println!("2. Take a backup now (or type 'backup')");
    println!("3. Run maintenance sweep (or type 'sweep')");
    println!("4. List destinations (or type 'destinations')");
    println!("5. List recent runs (or type 'runs')");
    println!("6. Test a destination (or type 'test')");
    prompt_line("Enter your choice")
}

fn prompt_line(label: &str) -> Result<String> {
    use std::io::{Write, stdin, stdout};

    print!("{}: ", label);
    stdout().flush().context("Failed to flush stdout")?;
    let mut input = String::new();
    stdin()
        .read_line(&mut input)
        .context("Failed to read user input")?;
    Ok(input.trim().to_string())
}
