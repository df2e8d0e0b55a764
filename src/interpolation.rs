//! Streams aggregated samples through the external interpolation engine and
//! stores the resulting surface.
//!
//! Each job runs the engine as a child process with two scoped threads around
//! its standard streams: the feed-in thread writes the row count and the
//! samples then closes stdin, the drain-out thread reads surface points until
//! EOF. Pipes block when full, which is all the backpressure the protocol
//! needs. The destination is written inside one transaction that is committed
//! only when the engine exits cleanly and returned exactly one point per grid
//! cell.

use crate::config::{InterpolationMethod, RasterSettings, Settings};
use crate::error::PipelineError;
use crate::period::Period;
use crate::quantity::Quantity;
use crate::store::{GridPoint, SampleSourceLike, SurfaceSinkLike};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::thread;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct InterpolationJob {
    pub method: InterpolationMethod,
    pub quantity: String,
    pub period: Period,
    pub source_table: String,
    pub destination_table: String,
}

impl InterpolationJob {
    pub fn new(settings: &Settings, method: &InterpolationMethod, quantity: &Quantity, period: Period) -> Self {
        let interpolation = &settings.interpolation;
        Self {
            method: method.clone(),
            quantity: quantity.id.clone(),
            period,
            source_table: quantity.aggregation_table(interpolation.statistic, period.kind, &interpolation.resolution),
            destination_table: quantity.interpolation_table(&method.id, period.kind),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobReport {
    pub method: String,
    pub quantity: String,
    pub rows_fed: u64,
    pub points_received: u64,
    pub expected_points: u64,
    pub exit_code: Option<i32>,
    pub committed: bool,
    pub failure: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// No source rows: the engine was not started.
    Skipped,
    Completed(JobReport),
    Failed(JobReport),
}

/// Build the engine command line: method arguments, then bounding box and
/// grid cell size.
pub fn engine_command(method: &InterpolationMethod, raster: &RasterSettings) -> Command {
    let bbox = &raster.bbox;
    let mut command = Command::new(&method.program);
    command
        .args(&method.extra_args)
        .arg("--min-longitude")
        .arg(bbox.min_longitude.to_string())
        .arg("--max-longitude")
        .arg(bbox.max_longitude.to_string())
        .arg("--min-latitude")
        .arg(bbox.min_latitude.to_string())
        .arg("--max-latitude")
        .arg(bbox.max_latitude.to_string())
        .arg("--grid-cell-size")
        .arg(raster.grid_cell_size.to_string());
    command
}

pub fn run_job<Src: SampleSourceLike, Snk: SurfaceSinkLike>(
    source: &mut Src,
    sink: &mut Snk,
    job: &InterpolationJob,
    raster: &RasterSettings,
) -> Result<JobOutcome, PipelineError> {
    let count = source.count_samples(&job.source_table, &job.period)?;
    if count == 0 {
        info!(method = %job.method.id, quantity = %job.quantity, period = %job.period, "no samples, skipping");
        return Ok(JobOutcome::Skipped);
    }
    info!(method = %job.method.id, quantity = %job.quantity, period = %job.period, rows = count, "interpolation started");

    sink.begin_surface(&job.destination_table, &job.period)?;
    let mut child = match engine_command(&job.method, raster)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            sink.rollback_surface()?;
            return Err(PipelineError::Subprocess {
                program: job.method.program.display().to_string(),
                reason: e.to_string(),
            });
        }
    };
    let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
        (Some(stdin), Some(stdout)) => (stdin, stdout),
        _ => {
            let _ = child.kill();
            let _ = child.wait();
            sink.rollback_surface()?;
            return Err(PipelineError::Subprocess {
                program: job.method.program.display().to_string(),
                reason: "standard streams not captured".to_string(),
            });
        }
    };

    let (fed, drained) = thread::scope(|scope| {
        let feeder = scope.spawn(|| feed_in(source, stdin, job, count));
        let drainer = scope.spawn(|| drain_out(sink, stdout));
        let fed = feeder
            .join()
            .unwrap_or_else(|_| Err(PipelineError::Other("feed-in thread panicked".to_string())));
        let drained = drainer.join().unwrap_or_else(|_| Drained {
            points: 0,
            failure: Some("drain-out thread panicked".to_string()),
        });
        (fed, drained)
    });
    let status = wait_child(&mut child, &job.method)?;

    let expected = raster.cell_count() as u64;
    let mut report = JobReport {
        method: job.method.id.clone(),
        quantity: job.quantity.clone(),
        rows_fed: *fed.as_ref().unwrap_or(&0),
        points_received: drained.points,
        expected_points: expected,
        exit_code: status.code(),
        committed: false,
        failure: None,
    };
    report.failure = match (&fed, &drained.failure) {
        (Err(e), _) => Some(format!("feed-in failed: {}", e)),
        (_, Some(reason)) => Some(format!("drain-out failed: {}", reason)),
        _ if !status.success() => Some(format!("engine exited with {}", status)),
        _ if drained.points != expected => Some(
            PipelineError::Contract(format!(
                "engine returned {} points for a grid of {}",
                drained.points, expected
            ))
            .to_string(),
        ),
        _ => None,
    };

    match &report.failure {
        None => {
            sink.commit_surface()?;
            report.committed = true;
            info!(
                method = %job.method.id,
                quantity = %job.quantity,
                points = report.points_received,
                table = %job.destination_table,
                "surface stored"
            );
            Ok(JobOutcome::Completed(report))
        }
        Some(reason) => {
            error!(method = %job.method.id, quantity = %job.quantity, period = %job.period, reason = %reason, "interpolation failed, surface discarded");
            sink.rollback_surface()?;
            Ok(JobOutcome::Failed(report))
        }
    }
}

fn wait_child(child: &mut Child, method: &InterpolationMethod) -> Result<ExitStatus, PipelineError> {
    child.wait().map_err(|e| PipelineError::Subprocess {
        program: method.program.display().to_string(),
        reason: e.to_string(),
    })
}

fn feed_in<Src: SampleSourceLike>(
    source: &mut Src,
    stdin: ChildStdin,
    job: &InterpolationJob,
    count: u64,
) -> Result<u64, PipelineError> {
    let mut writer = BufWriter::new(stdin);
    writeln!(writer, "{}", count)?;
    let sent = source.stream_samples(&job.source_table, &job.period, &mut |point| {
        writeln!(writer, "{} {} {}", point.longitude, point.latitude, point.value)?;
        Ok(())
    })?;
    writer.flush()?;
    if sent != count {
        warn!(table = %job.source_table, announced = count, sent = sent, "row count changed while streaming");
    }
    // Dropping the writer closes stdin, which tells the engine the input is complete.
    Ok(sent)
}

struct Drained {
    points: u64,
    failure: Option<String>,
}

/// Read points until EOF. After the first failure the remaining output is
/// still consumed so the engine never blocks on a full pipe.
fn drain_out<Snk: SurfaceSinkLike>(sink: &mut Snk, stdout: ChildStdout) -> Drained {
    let reader = BufReader::new(stdout);
    let mut drained = Drained { points: 0, failure: None };
    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                drained.failure.get_or_insert(e.to_string());
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        drained.points += 1;
        if drained.failure.is_some() {
            continue;
        }
        let stored = parse_point(&line).and_then(|point| sink.insert_point(point));
        if let Err(e) = stored {
            drained.failure = Some(e.to_string());
        }
    }
    drained
}

pub fn parse_point(line: &str) -> Result<GridPoint, PipelineError> {
    let mut fields = line.split_whitespace().map(str::parse::<f64>);
    match (fields.next(), fields.next(), fields.next(), fields.next()) {
        (Some(Ok(longitude)), Some(Ok(latitude)), Some(Ok(value)), None) => {
            Ok(GridPoint::new(longitude, latitude, value))
        }
        _ => Err(PipelineError::Contract(format!("malformed engine output line {:?}", line))),
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct CycleReport {
    pub completed: Vec<JobReport>,
    pub failed: Vec<JobReport>,
    pub skipped: usize,
    pub errors: usize,
}

/// Run every method over every quantity that has a surface for this period.
/// One failing job never stops the cycle.
pub fn run_interpolation_cycle<Src: SampleSourceLike, Snk: SurfaceSinkLike>(
    source: &mut Src,
    sink: &mut Snk,
    settings: &Settings,
    period: Period,
    cancel: &CancellationToken,
) -> CycleReport {
    let mut report = CycleReport::default();
    for method in &settings.interpolation.methods {
        for quantity in settings.interpolation_targets(period.kind) {
            if cancel.is_cancelled() {
                warn!("interpolation cycle cancelled");
                return report;
            }
            let job = InterpolationJob::new(settings, method, quantity, period);
            match run_job(source, sink, &job, &settings.raster) {
                Ok(JobOutcome::Skipped) => report.skipped += 1,
                Ok(JobOutcome::Completed(r)) => report.completed.push(r),
                Ok(JobOutcome::Failed(r)) => report.failed.push(r),
                Err(e) => {
                    error!(method = %method.id, quantity = %quantity.id, error = %e, "interpolation job aborted");
                    report.errors += 1;
                }
            }
        }
    }
    info!(
        period = %period,
        completed = report.completed.len(),
        failed = report.failed.len(),
        skipped = report.skipped,
        errors = report.errors,
        "interpolation cycle finished"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_point() {
        assert_eq!(parse_point("-8.4 40.2 12.5").unwrap(), GridPoint::new(-8.4, 40.2, 12.5));
        assert!(parse_point("-8.4 40.2").is_err());
        assert!(parse_point("-8.4 40.2 x").is_err());
        assert!(parse_point("1 2 3 4").is_err());
    }

    #[test]
    fn test_engine_command_arguments() {
        let settings = crate::config::tests::sample_settings();
        let command = engine_command(&settings.interpolation.methods[0], &settings.raster);
        let args: Vec<String> = command.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(
            args,
            vec![
                "--min-longitude", "-8.5", "--max-longitude", "-8.3", "--min-latitude", "40.1",
                "--max-latitude", "40.3", "--grid-cell-size", "0.05"
            ]
        );
    }
}
