//! Settings loaded once at process start and passed to every component.

use crate::aggregation::{Resolution, Statistic};
use crate::error::PipelineError;
use crate::period::PeriodKind;
use crate::quantity::{is_sql_identifier, Quantity};
use crate::routing::{PollutionDependency, RoutingProfile};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const SETTINGS_ENV: &str = "SMOGROUTE_SETTINGS";
pub const DEFAULT_SETTINGS_PATH: &str = "/etc/smogroute/settings.yaml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Directory holding PID files of managed services.
    pub run_dir: PathBuf,
    pub broker: BrokerSettings,
    #[serde(default)]
    pub wire: WireSettings,
    pub quantities: Vec<Quantity>,
    pub aggregation: AggregationSettings,
    pub interpolation: InterpolationSettings,
    pub raster: RasterSettings,
    pub routing: RoutingSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerSettings {
    pub host: String,
    #[serde(default = "default_broker_port")]
    pub port: u16,
    pub client_id: String,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    /// Topic of one node, `{node}` is replaced by the node id.
    #[serde(default = "default_topic_template")]
    pub topic_template: String,
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
    #[serde(default = "default_gap_report_interval_secs")]
    pub gap_report_interval_secs: u64,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl BrokerSettings {
    pub fn topic_for(&self, node_id: i32) -> String {
        self.topic_template.replace("{node}", &node_id.to_string())
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn gap_report_interval(&self) -> Duration {
        Duration::from_secs(self.gap_report_interval_secs)
    }
}

fn default_broker_port() -> u16 {
    1883
}
fn default_keep_alive_secs() -> u64 {
    30
}
fn default_topic_template() -> String {
    "sensor_nodes/sn_{node}".to_string()
}
fn default_reconcile_interval_secs() -> u64 {
    300
}
fn default_gap_report_interval_secs() -> u64 {
    60
}
fn default_channel_capacity() -> usize {
    64
}

/// Fixed positions of the wire record that are not per-quantity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireSettings {
    pub gps_error_index: usize,
}

impl Default for WireSettings {
    fn default() -> Self {
        Self { gps_error_index: 19 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationSettings {
    pub statistics: Vec<Statistic>,
    pub resolutions: Vec<Resolution>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterpolationSettings {
    /// Statistic and resolution of the aggregation tables used as engine input.
    pub statistic: Statistic,
    pub resolution: String,
    #[serde(default = "default_interpolation_period")]
    pub period: PeriodKind,
    pub methods: Vec<InterpolationMethod>,
}

fn default_interpolation_period() -> PeriodKind {
    PeriodKind::Daily
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterpolationMethod {
    pub id: String,
    pub program: PathBuf,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_longitude: f64,
    pub min_latitude: f64,
    pub max_longitude: f64,
    pub max_latitude: f64,
}

impl BoundingBox {
    pub fn is_empty(&self) -> bool {
        !(self.min_longitude < self.max_longitude && self.min_latitude < self.max_latitude)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RasterSettings {
    pub bbox: BoundingBox,
    pub rows: usize,
    pub cols: usize,
    pub weight_routing: f64,
    pub weight_pollution: f64,
    pub grid_cell_size: f64,
    pub sensor_path: PathBuf,
    pub knowledge_path: PathBuf,
}

impl RasterSettings {
    pub fn cell_count(&self) -> usize {
        self.rows * self.cols
    }

    pub fn path_for(&self, dependency: PollutionDependency) -> Option<&Path> {
        match dependency {
            PollutionDependency::None => None,
            PollutionDependency::Sensor => Some(&self.sensor_path),
            PollutionDependency::Knowledge => Some(&self.knowledge_path),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockSettings {
    pub dir: PathBuf,
    #[serde(default = "default_lock_name")]
    pub name: String,
    #[serde(default = "default_lock_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_lock_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl LockSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn default_lock_name() -> String {
    "routing_data".to_string()
}
fn default_lock_timeout_secs() -> u64 {
    3600
}
fn default_lock_poll_interval_ms() -> u64 {
    500
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingSettings {
    pub map_path: PathBuf,
    #[serde(default)]
    pub map_url: Option<String>,
    /// Directory containing the extract/partition/customize/contract binaries.
    pub toolchain_dir: PathBuf,
    #[serde(default = "default_server_program")]
    pub server_program: PathBuf,
    /// How long a reload waits for the old servers to exit.
    #[serde(default = "default_server_stop_timeout_secs")]
    pub server_stop_timeout_secs: u64,
    pub lock: LockSettings,
    pub profiles: Vec<RoutingProfile>,
}

fn default_server_program() -> PathBuf {
    PathBuf::from("osrm-routed")
}
fn default_server_stop_timeout_secs() -> u64 {
    30
}

impl Settings {
    /// Load from an explicit path, falling back to `SMOGROUTE_SETTINGS` and
    /// then the system default.
    pub fn load(path: Option<&Path>) -> Result<Self, PipelineError> {
        let path = Self::resolve_path(path);
        let text = std::fs::read_to_string(&path).map_err(|e| {
            PipelineError::Config(format!("cannot read settings {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&text)
    }

    pub fn resolve_path(path: Option<&Path>) -> PathBuf {
        match path {
            Some(p) => p.to_path_buf(),
            None => std::env::var(SETTINGS_ENV)
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_SETTINGS_PATH)),
        }
    }

    pub fn from_yaml(text: &str) -> Result<Self, PipelineError> {
        let settings: Settings = serde_yaml::from_str(text)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        let mut ids = HashSet::new();
        for quantity in &self.quantities {
            quantity.validate()?;
            if !ids.insert(quantity.id.as_str()) {
                return Err(PipelineError::Config(format!("duplicate quantity id {}", quantity.id)));
            }
        }
        for resolution in &self.aggregation.resolutions {
            require_identifier("resolution", &resolution.id)?;
        }
        require_identifier("interpolation resolution", &self.interpolation.resolution)?;
        if !self.aggregation.statistics.contains(&self.interpolation.statistic) {
            return Err(PipelineError::Config(format!(
                "interpolation statistic {} is not aggregated",
                self.interpolation.statistic.sql_function()
            )));
        }
        if !self.aggregation.resolutions.iter().any(|r| r.id == self.interpolation.resolution) {
            return Err(PipelineError::Config(format!(
                "interpolation resolution {} is not aggregated",
                self.interpolation.resolution
            )));
        }
        if self.interpolation.methods.is_empty() {
            return Err(PipelineError::Config("at least one interpolation method is required".to_string()));
        }
        for method in &self.interpolation.methods {
            require_identifier("interpolation method", &method.id)?;
        }
        if self.raster.rows == 0 || self.raster.cols == 0 {
            return Err(PipelineError::Config("raster rows and cols must be positive".to_string()));
        }
        if self.raster.bbox.is_empty() {
            return Err(PipelineError::Config("raster bounding box is empty".to_string()));
        }
        if !(self.raster.grid_cell_size > 0.0) {
            return Err(PipelineError::Config("grid cell size must be positive".to_string()));
        }
        let mut ports = HashSet::new();
        let mut names = HashSet::new();
        for profile in &self.routing.profiles {
            if !ports.insert(profile.port) {
                return Err(PipelineError::Config(format!("port {} used by two profiles", profile.port)));
            }
            if !names.insert(profile.name.as_str()) {
                return Err(PipelineError::Config(format!("duplicate routing profile {}", profile.name)));
            }
        }
        if !self.broker.topic_template.contains("{node}") {
            return Err(PipelineError::Config("broker topic template must contain {node}".to_string()));
        }
        Ok(())
    }

    /// Quantities with an interpolation surface for periods of `kind`.
    /// Routing-only quantities are interpolated at the routing period only.
    pub fn interpolation_targets(&self, kind: PeriodKind) -> impl Iterator<Item = &Quantity> {
        let routing_period = self.interpolation.period;
        self.quantities
            .iter()
            .filter(move |q| q.mobile_app || (q.route_planner && kind == routing_period))
    }

    pub fn routing_quantities(&self) -> impl Iterator<Item = &Quantity> {
        self.quantities.iter().filter(|q| q.routing_profile().is_some())
    }

    pub fn pid_file(&self, service: &str) -> PathBuf {
        self.run_dir.join(format!("{}.pid", service))
    }
}

fn require_identifier(what: &str, id: &str) -> Result<(), PipelineError> {
    if is_sql_identifier(id) {
        Ok(())
    } else {
        Err(PipelineError::Config(format!("{} {:?} must match [a-z0-9_]+", what, id)))
    }
}

pub struct DatabaseConfig {
    pub url: String,
}

impl DatabaseConfig {
    pub fn from_env() -> Result<Self, PipelineError> {
        std::env::var("DATABASE_URL")
            .map(|url| Self { url })
            .map_err(|_| PipelineError::Config("DATABASE_URL is not set".to_string()))
    }
}
