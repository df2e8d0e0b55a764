use chrono::Local;
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use smogroute::aggregation::run_aggregation;
use smogroute::config::{DatabaseConfig, Settings};
use smogroute::interpolation::run_interpolation_cycle;
use smogroute::period::{Period, PeriodKind};
use smogroute::postgres_store::PostgresStore;
use smogroute::raster::{compose_from_store, install_raster, read_raster, write_raster};
use smogroute::rebuild::{RebuildCoordinator, RebuildReport, RebuildTrigger};
use smogroute::routing::{PollutionDependency, RoutingSupervisor};
use smogroute::shutdown::install_termination_handler;
use smogroute::store::SurfaceSourceLike;
use smogroute::toolchain::run_logged;
use smogroute::PipelineError;
use std::path::{Path, PathBuf};
use std::process::Command;

const SERVICE: &str = "pipeline";

#[derive(Parser)]
#[command(name = "pipeline")]
#[command(about = "Aggregation, interpolation and routing data jobs", long_about = None)]
struct Cli {
    /// Settings file (defaults to $SMOGROUTE_SETTINGS, then /etc/smogroute/settings.yaml)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the stored aggregation functions for one period
    Aggregate {
        /// hourly or daily
        kind: PeriodKind,
        /// Period to aggregate ("YYYY-MM-DD HH" or "YYYY-MM-DD"); defaults to the last completed one
        #[arg(long)]
        when: Option<String>,
    },
    /// Interpolate every configured method and quantity
    Interpolate {
        #[arg(long)]
        when: Option<String>,
    },
    /// Count stored surface points against the raster grid
    CheckSurfaces {
        #[arg(long)]
        when: Option<String>,
    },
    /// Compose the cost raster into a file without touching routing data
    ComposeRaster {
        #[arg(long)]
        when: Option<String>,
        #[arg(long)]
        output: PathBuf,
    },
    /// Compose the sensor raster and rebuild the profiles that read it
    UpdateRouting {
        #[arg(long)]
        when: Option<String>,
    },
    /// Download a new map snapshot and rebuild the pollution-independent profiles
    RefreshMap,
    /// Install an externally produced knowledge raster and rebuild its profiles
    InstallKnowledgeRaster {
        /// Raster file in the sensor raster format
        file: PathBuf,
    },
}

fn period_for(kind: PeriodKind, when: Option<&str>) -> Result<Period, PipelineError> {
    match when {
        Some(text) => Period::parse(kind, text),
        None => Ok(Period::last_completed(kind, Local::now().naive_local())),
    }
}

fn connect() -> Result<PostgresStore, PipelineError> {
    let database = DatabaseConfig::from_env()?;
    PostgresStore::connect(&database.url)
}

fn aggregate(settings: &Settings, kind: PeriodKind, when: Option<&str>) -> Result<(), PipelineError> {
    let period = period_for(kind, when)?;
    let mut store = connect()?;
    let report = run_aggregation(&mut store, settings, &period);
    println!(
        "[{}] aggregation {}: {} succeeded, {} failed",
        SERVICE,
        period,
        report.succeeded.len(),
        report.failed.len()
    );
    if report.failed.is_empty() {
        Ok(())
    } else {
        Err(PipelineError::Other(format!("aggregation functions failed: {}", report.failed.join(", "))))
    }
}

fn interpolate(settings: &Settings, when: Option<&str>) -> Result<(), PipelineError> {
    let period = period_for(settings.interpolation.period, when)?;
    let cancel = install_termination_handler()?;
    // The sink holds a transaction open while the source streams.
    let mut source = connect()?;
    let mut sink = connect()?;
    let report = run_interpolation_cycle(&mut source, &mut sink, settings, period, &cancel);
    for job in report.completed.iter().chain(&report.failed) {
        println!(
            "[{}] {} {}: fed {} rows, received {}/{} points, committed {}",
            SERVICE, job.method, job.quantity, job.rows_fed, job.points_received, job.expected_points, job.committed
        );
    }
    println!(
        "[{}] interpolation {}: {} completed, {} failed, {} skipped, {} aborted",
        SERVICE,
        period,
        report.completed.len(),
        report.failed.len(),
        report.skipped,
        report.errors
    );
    if report.failed.is_empty() && report.errors == 0 {
        Ok(())
    } else {
        Err(PipelineError::Other("interpolation cycle had failures".to_string()))
    }
}

fn check_surfaces(settings: &Settings, when: Option<&str>) -> Result<(), PipelineError> {
    let period = period_for(settings.interpolation.period, when)?;
    let mut store = connect()?;
    let expected = settings.raster.cell_count() as u64;
    let mut incomplete = 0;
    for method in &settings.interpolation.methods {
        for quantity in settings.routing_quantities() {
            let table = quantity.interpolation_table(&method.id, period.kind);
            let found = store.count_surface(&table, &period)?;
            let mark = if found == expected { "ok" } else { "INCOMPLETE" };
            println!("[{}] {} {}: {}/{} {}", SERVICE, table, period, found, expected, mark);
            if found != expected {
                incomplete += 1;
            }
        }
    }
    if incomplete == 0 {
        Ok(())
    } else {
        Err(PipelineError::Contract(format!("{} surfaces incomplete for {}", incomplete, period)))
    }
}

fn compose_raster(settings: &Settings, when: Option<&str>, output: &Path) -> Result<(), PipelineError> {
    let period = period_for(settings.interpolation.period, when)?;
    let mut store = connect()?;
    let composition = compose_from_store(&mut store, settings, &period);
    write_raster(output, &composition.raster, &settings.raster)?;
    println!("[{}] raster for {} written to {}", SERVICE, period, output.display());
    if !composition.is_complete() {
        println!("[{}] surfaces missing, raster is all zero: {:?}", SERVICE, composition.incomplete);
    }
    Ok(())
}

fn raster_path(settings: &Settings, dependency: PollutionDependency) -> Result<PathBuf, PipelineError> {
    settings
        .raster
        .path_for(dependency)
        .map(Path::to_path_buf)
        .ok_or_else(|| PipelineError::Config(format!("no raster path configured for {:?}", dependency)))
}

fn print_rebuild(report: &RebuildReport) -> Result<(), PipelineError> {
    for profile in &report.profiles {
        match (&profile.failed_stage, &profile.error) {
            (Some(stage), Some(error)) => println!("[{}] {}: {} failed: {}", SERVICE, profile.profile, stage, error),
            (Some(stage), None) => println!("[{}] {}: {} failed", SERVICE, profile.profile, stage),
            _ => println!("[{}] {}: rebuilt", SERVICE, profile.profile),
        }
    }
    println!("[{}] routing servers reloaded: {}", SERVICE, report.reloaded);
    if report.failures() == 0 {
        Ok(())
    } else {
        Err(PipelineError::Other(format!("{} profiles failed to rebuild", report.failures())))
    }
}

fn update_routing(settings: &Settings, when: Option<&str>) -> Result<(), PipelineError> {
    let period = period_for(settings.interpolation.period, when)?;
    let destination = raster_path(settings, PollutionDependency::Sensor)?;
    let mut store = connect()?;
    let composition = compose_from_store(&mut store, settings, &period);

    let mut coordinator = RebuildCoordinator::from_settings(settings);
    let mut supervisor = RoutingSupervisor::new(settings);
    let report = coordinator.rebuild_with(
        RebuildTrigger::RasterProduced(PollutionDependency::Sensor),
        || write_raster(&destination, &composition.raster, &settings.raster),
        &mut supervisor,
    )?;
    print_rebuild(&report)
}

fn refresh_map(settings: &Settings) -> Result<(), PipelineError> {
    let url = settings
        .routing
        .map_url
        .clone()
        .ok_or_else(|| PipelineError::Config("routing.map_url is not set".to_string()))?;
    let map_path = settings.routing.map_path.clone();

    let mut coordinator = RebuildCoordinator::from_settings(settings);
    let mut supervisor = RoutingSupervisor::new(settings);
    let report = coordinator.rebuild_with(
        RebuildTrigger::MapRefreshed,
        || {
            let mut curl = Command::new("curl");
            curl.arg(&url).args(["--silent", "--show-error", "--output"]).arg(&map_path);
            run_logged(&mut curl, "map", "download")
        },
        &mut supervisor,
    )?;
    print_rebuild(&report)
}

fn install_knowledge_raster(settings: &Settings, file: &Path) -> Result<(), PipelineError> {
    // Reject a bad file before waiting on the lock.
    read_raster(file, &settings.raster)?;
    let destination = raster_path(settings, PollutionDependency::Knowledge)?;

    let mut coordinator = RebuildCoordinator::from_settings(settings);
    let mut supervisor = RoutingSupervisor::new(settings);
    let report = coordinator.rebuild_with(
        RebuildTrigger::RasterProduced(PollutionDependency::Knowledge),
        || install_raster(file, &destination, &settings.raster),
        &mut supervisor,
    )?;
    print_rebuild(&report)
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

    let result = match &cli.command {
        Commands::Aggregate { kind, when } => aggregate(&settings, *kind, when.as_deref()),
        Commands::Interpolate { when } => interpolate(&settings, when.as_deref()),
        Commands::CheckSurfaces { when } => check_surfaces(&settings, when.as_deref()),
        Commands::ComposeRaster { when, output } => compose_raster(&settings, when.as_deref(), output),
        Commands::UpdateRouting { when } => update_routing(&settings, when.as_deref()),
        Commands::RefreshMap => refresh_map(&settings),
        Commands::InstallKnowledgeRaster { file } => install_knowledge_raster(&settings, file),
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "{} failed", SERVICE);
        eprintln!("[{}] {}", SERVICE, e);
        std::process::exit(1);
    }
}
