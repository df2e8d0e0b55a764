//! Routing profiles and the routing engine supervisor.

use crate::config::Settings;
use crate::daemon::{CommandSignature, DaemonManager, ServiceStatus};
use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

pub const ROUTING_SERVICE: &str = "routing_server";

/// Which cost raster, if any, a profile script reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PollutionDependency {
    #[default]
    None,
    Sensor,
    Knowledge,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingProfile {
    pub name: String,
    pub profile_script: PathBuf,
    pub folder: PathBuf,
    pub port: u16,
    #[serde(default)]
    pub pollution: PollutionDependency,
}

impl RoutingProfile {
    /// The map snapshot as seen from this profile's folder.
    pub fn map_link(&self, map_path: &Path) -> PathBuf {
        match map_path.file_name() {
            Some(name) => self.folder.join(name),
            None => self.folder.join("map.osm.pbf"),
        }
    }

    /// The `.osrm` base file the later stages and the server operate on.
    pub fn data_file(&self, map_path: &Path) -> PathBuf {
        let name = map_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "map.osm.pbf".to_string());
        let stem = name
            .strip_suffix(".osm.pbf")
            .or_else(|| name.strip_suffix(".pbf"))
            .unwrap_or(&name);
        self.folder.join(format!("{}.osrm", stem))
    }

    pub fn server_signature(&self, server_program: &Path, map_path: &Path) -> CommandSignature {
        CommandSignature::new(
            server_program,
            vec![
                self.data_file(map_path).display().to_string(),
                "--algorithm".to_string(),
                "mld".to_string(),
                "--port".to_string(),
                self.port.to_string(),
            ],
        )
    }
}

/// Something that must pick up freshly rebuilt routing data.
pub trait ReloadTarget {
    fn reload(&mut self) -> Result<(), PipelineError>;
}

/// One routing server process per profile, all recorded in one PID file.
pub struct RoutingSupervisor {
    daemon: DaemonManager,
    signatures: Vec<CommandSignature>,
}

impl RoutingSupervisor {
    pub fn new(settings: &Settings) -> Self {
        let routing = &settings.routing;
        let signatures = routing
            .profiles
            .iter()
            .map(|p| p.server_signature(&routing.server_program, &routing.map_path))
            .collect();
        let daemon = DaemonManager::new(ROUTING_SERVICE, settings.pid_file(ROUTING_SERVICE))
            .with_stop_timeout(Duration::from_secs(routing.server_stop_timeout_secs));
        Self { daemon, signatures }
    }

    pub fn signatures(&self) -> &[CommandSignature] {
        &self.signatures
    }

    pub fn start(&self) -> Result<Vec<u32>, PipelineError> {
        let pids = self.daemon.start(&self.signatures)?;
        info!(servers = pids.len(), "routing servers started");
        Ok(pids)
    }

    pub fn stop(&self) -> Result<(), PipelineError> {
        self.daemon.stop()
    }

    pub fn status(&self) -> Result<ServiceStatus, PipelineError> {
        self.daemon.status(&self.signatures)
    }
}

impl ReloadTarget for RoutingSupervisor {
    fn reload(&mut self) -> Result<(), PipelineError> {
        match self.stop() {
            Ok(()) => {}
            Err(PipelineError::NotRunning(_)) => warn!("routing servers were not running, starting them"),
            Err(e) => return Err(e),
        }
        self.start().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> RoutingProfile {
        RoutingProfile {
            name: "bike_sensor".to_string(),
            profile_script: PathBuf::from("/etc/smogroute/bike.lua"),
            folder: PathBuf::from("/var/lib/smogroute/bike_sensor"),
            port: 5001,
            pollution: PollutionDependency::Sensor,
        }
    }

    #[test]
    fn test_data_paths() {
        let map = Path::new("/var/lib/smogroute/portugal-latest.osm.pbf");
        let p = profile();
        assert_eq!(p.map_link(map), PathBuf::from("/var/lib/smogroute/bike_sensor/portugal-latest.osm.pbf"));
        assert_eq!(p.data_file(map), PathBuf::from("/var/lib/smogroute/bike_sensor/portugal-latest.osrm"));
    }

    #[test]
    fn test_server_signature() {
        let map = Path::new("/maps/region.osm.pbf");
        let sig = profile().server_signature(Path::new("/usr/local/bin/osrm-routed"), map);
        assert!(sig.matches(&[
            "osrm-routed".to_string(),
            "/var/lib/smogroute/bike_sensor/region.osrm".to_string(),
            "--algorithm".to_string(),
            "mld".to_string(),
            "--port".to_string(),
            "5001".to_string(),
        ]));
    }
}
