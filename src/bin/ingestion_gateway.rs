use clap::{Parser, Subcommand};
use dotenv::dotenv;
use smogroute::config::{DatabaseConfig, Settings};
use smogroute::daemon::{CommandSignature, DaemonManager};
use smogroute::ingest::IngestionGateway;
use smogroute::postgres_store::PostgresStore;
use smogroute::shutdown::install_termination_handler;
use smogroute::PipelineError;
use std::path::{Path, PathBuf};

const SERVICE: &str = "ingestion_gateway";

#[derive(Parser)]
#[command(name = "ingestion_gateway")]
#[command(about = "Sensor node measurement ingestion over MQTT", long_about = None)]
struct Cli {
    /// Settings file (defaults to $SMOGROUTE_SETTINGS, then /etc/smogroute/settings.yaml)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch the gateway as a detached daemon
    Start,
    /// Terminate the running daemon
    Stop,
    /// Report whether the daemon is running
    Status,
    /// Run the gateway in the foreground (default)
    Run,
}

/// The daemon re-executes this binary with an absolute settings path so that
/// `status` can recognise it regardless of the caller's environment.
fn daemon_signature(settings_path: &Path) -> Result<CommandSignature, PipelineError> {
    let exe = std::env::current_exe()?;
    let settings_path = std::fs::canonicalize(settings_path)?;
    Ok(CommandSignature::new(
        exe,
        vec!["run".to_string(), "--settings".to_string(), settings_path.display().to_string()],
    ))
}

fn run(settings: &Settings) -> Result<(), PipelineError> {
    let cancel = install_termination_handler()?;
    let database = DatabaseConfig::from_env()?;
    let store = PostgresStore::connect(&database.url)?;
    let mut gateway = IngestionGateway::new(store, settings);
    smogroute::mqtt::run_gateway(&mut gateway, &settings.broker, &cancel)?;
    let stats = gateway.stats();
    println!(
        "[{}] stopped: {} accepted, {} duplicates, {} malformed, {} store failures",
        SERVICE, stats.accepted, stats.duplicates, stats.parse_failures, stats.store_failures
    );
    Ok(())
}

fn main() {
    dotenv().ok();
    let _tracing = smogroute::init_tracing(SERVICE);
    let cli = Cli::parse();

    let settings_path = Settings::resolve_path(cli.settings.as_deref());
    let settings = match Settings::load(Some(&settings_path)) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("[{}] {}", SERVICE, e);
            std::process::exit(2);
        }
    };
    let daemon = DaemonManager::new(SERVICE, settings.pid_file(SERVICE));

    let result = match cli.command.unwrap_or(Commands::Run) {
        Commands::Start => daemon_signature(&settings_path)
            .and_then(|signature| daemon.start(&[signature]))
            .map(|pids| println!("[{}] started (pid {:?})", SERVICE, pids)),
        Commands::Stop => daemon.stop().map(|()| println!("[{}] stopped", SERVICE)),
        Commands::Status => {
            let status = daemon_signature(&settings_path).and_then(|signature| daemon.status(&[signature]));
            match status {
                Ok(status) => {
                    println!("[{}] {}", SERVICE, status);
                    std::process::exit(status.exit_code());
                }
                Err(e) => Err(e),
            }
        }
        Commands::Run => run(&settings),
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "{} failed", SERVICE);
        eprintln!("[{}] {}", SERVICE, e);
        std::process::exit(1);
    }
}
