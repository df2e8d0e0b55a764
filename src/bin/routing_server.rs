use clap::{Parser, Subcommand};
use dotenv::dotenv;
use smogroute::config::Settings;
use smogroute::routing::{ReloadTarget, RoutingSupervisor};
use std::path::PathBuf;

const SERVICE: &str = "routing_server";

#[derive(Parser)]
#[command(name = "routing_server")]
#[command(about = "Start, stop and inspect the per-profile routing servers", long_about = None)]
struct Cli {
    /// Settings file (defaults to $SMOGROUTE_SETTINGS, then /etc/smogroute/settings.yaml)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch one server per routing profile
    Start,
    /// Terminate every recorded server
    Stop,
    /// Stop the servers if running, then start them again
    Restart,
    /// Report whether all servers are running
    Status,
}

fn main() {
    dotenv().ok();
    let _tracing = smogroute::init_tracing(SERVICE);
    let cli = Cli::parse();

    let settings = match Settings::load(cli.settings.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("[{}] {}", SERVICE, e);
            std::process::exit(2);
        }
    };
    let mut supervisor = RoutingSupervisor::new(&settings);

    let result = match cli.command {
        Commands::Start => supervisor.start().map(|pids| println!("[{}] started {} servers", SERVICE, pids.len())),
        Commands::Stop => supervisor.stop().map(|()| println!("[{}] stopped", SERVICE)),
        Commands::Restart => supervisor.reload().map(|()| println!("[{}] restarted", SERVICE)),
        Commands::Status => match supervisor.status() {
            Ok(status) => {
                println!("[{}] {}", SERVICE, status);
                std::process::exit(status.exit_code());
            }
            Err(e) => Err(e),
        },
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "{} failed", SERVICE);
        eprintln!("[{}] {}", SERVICE, e);
        std::process::exit(1);
    }
}
