//! The four-stage routing data toolchain.

use crate::error::PipelineError;
use crate::routing::RoutingProfile;
use std::fmt;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Extract,
    Partition,
    Customize,
    Contract,
}

impl Stage {
    pub const ORDER: [Stage; 4] = [Stage::Extract, Stage::Partition, Stage::Customize, Stage::Contract];

    pub fn program(&self) -> &'static str {
        match self {
            Stage::Extract => "osrm-extract",
            Stage::Partition => "osrm-partition",
            Stage::Customize => "osrm-customize",
            Stage::Contract => "osrm-contract",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Extract => "extract",
            Stage::Partition => "partition",
            Stage::Customize => "customize",
            Stage::Contract => "contract",
        };
        f.write_str(name)
    }
}

pub trait StageRunner {
    fn run_stage(&mut self, stage: Stage, profile: &RoutingProfile, map_path: &Path) -> Result<(), PipelineError>;
}

/// Runs the toolchain binaries found in one directory.
pub struct ToolchainRunner {
    bin_dir: PathBuf,
}

impl ToolchainRunner {
    pub fn new(bin_dir: impl Into<PathBuf>) -> Self {
        Self { bin_dir: bin_dir.into() }
    }

    pub fn stage_command(&self, stage: Stage, profile: &RoutingProfile, map_path: &Path) -> Command {
        let mut command = Command::new(self.bin_dir.join(stage.program()));
        match stage {
            Stage::Extract => {
                command.arg(profile.map_link(map_path)).arg("--profile").arg(&profile.profile_script);
            }
            _ => {
                command.arg(profile.data_file(map_path));
            }
        }
        command
    }

    /// The extract stage reads the map through a link in the profile folder.
    fn ensure_map_link(profile: &RoutingProfile, map_path: &Path) -> Result<(), PipelineError> {
        std::fs::create_dir_all(&profile.folder)?;
        let link = profile.map_link(map_path);
        if link.symlink_metadata().is_err() {
            std::os::unix::fs::symlink(map_path, &link)?;
        }
        Ok(())
    }
}

impl StageRunner for ToolchainRunner {
    fn run_stage(&mut self, stage: Stage, profile: &RoutingProfile, map_path: &Path) -> Result<(), PipelineError> {
        if stage == Stage::Extract {
            Self::ensure_map_link(profile, map_path)?;
        }
        let mut command = self.stage_command(stage, profile, map_path);
        run_logged(&mut command, &profile.name, &stage.to_string())
    }
}

/// Run a command to completion, logging every output line, and fail on a
/// non-zero exit.
pub fn run_logged(command: &mut Command, profile: &str, stage: &str) -> Result<(), PipelineError> {
    let program = command.get_program().to_string_lossy().into_owned();
    info!(profile = %profile, stage = %stage, program = %program, "running");
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| PipelineError::Subprocess { program: program.clone(), reason: e.to_string() })?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    thread::scope(|scope| {
        if let Some(stderr) = stderr {
            scope.spawn(move || {
                for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                    warn!(profile = %profile, stage = %stage, "{}", line);
                }
            });
        }
        if let Some(stdout) = stdout {
            for line in BufReader::new(stdout).lines().map_while(Result::ok) {
                info!(profile = %profile, stage = %stage, "{}", line);
            }
        }
    });

    let status = child
        .wait()
        .map_err(|e| PipelineError::Subprocess { program: program.clone(), reason: e.to_string() })?;
    info!(profile = %profile, stage = %stage, code = ?status.code(), "finished");
    if status.success() {
        Ok(())
    } else {
        Err(PipelineError::Subprocess { program, reason: format!("exited with {}", status) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::PollutionDependency;

    fn profile(folder: &Path) -> RoutingProfile {
        RoutingProfile {
            name: "car".to_string(),
            profile_script: PathBuf::from("/etc/smogroute/car.lua"),
            folder: folder.to_path_buf(),
            port: 5000,
            pollution: PollutionDependency::None,
        }
    }

    #[test]
    fn test_stage_arguments() {
        let runner = ToolchainRunner::new("/usr/local/bin");
        let p = profile(Path::new("/data/car"));
        let map = Path::new("/maps/region.osm.pbf");

        let extract = runner.stage_command(Stage::Extract, &p, map);
        assert_eq!(extract.get_program(), "/usr/local/bin/osrm-extract");
        let args: Vec<_> = extract.get_args().collect();
        assert_eq!(args, vec!["/data/car/region.osm.pbf", "--profile", "/etc/smogroute/car.lua"]);

        let contract = runner.stage_command(Stage::Contract, &p, map);
        let args: Vec<_> = contract.get_args().collect();
        assert_eq!(args, vec!["/data/car/region.osrm"]);
    }

    #[test]
    fn test_run_logged_reports_exit_code() {
        assert!(run_logged(Command::new("sh").args(["-c", "echo out; echo err >&2"]), "car", "extract").is_ok());
        let err = run_logged(Command::new("sh").args(["-c", "exit 3"]), "car", "partition").unwrap_err();
        assert!(matches!(err, PipelineError::Subprocess { .. }));
        assert!(run_logged(&mut Command::new("/nonexistent/osrm-extract"), "car", "extract").is_err());
    }

    #[test]
    fn test_extract_creates_map_link() {
        let dir = tempfile::tempdir().expect("tempdir should succeed");
        let map = dir.path().join("region.osm.pbf");
        std::fs::write(&map, b"pbf").unwrap();
        let p = profile(&dir.path().join("car"));
        ToolchainRunner::ensure_map_link(&p, &map).expect("link should succeed");
        ToolchainRunner::ensure_map_link(&p, &map).expect("existing link is fine");
        assert_eq!(std::fs::read(p.map_link(&map)).unwrap(), b"pbf");
    }
}
