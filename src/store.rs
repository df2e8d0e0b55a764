use crate::error::PipelineError;
use crate::measurement::Measurement;
use crate::period::Period;
use crate::quantity::Quantity;
use chrono::NaiveDateTime;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// One `<lon> <lat> <value>` sample, either engine input or a surface point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridPoint {
    pub longitude: f64,
    pub latitude: f64,
    pub value: f64,
}

impl GridPoint {
    pub fn new(longitude: f64, latitude: f64, value: f64) -> Self {
        Self { longitude, latitude, value }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Duplicate,
}

pub trait MeasurementStoreLike {
    /// Insert through the stored procedure; a (node, sequence) clash is
    /// reported as `Duplicate`, never as an error.
    fn insert_measurement(&mut self, measurement: &Measurement, quantities: &[Quantity]) -> Result<InsertOutcome, PipelineError>;
    /// Node registry.
    fn node_ids(&mut self) -> Result<Vec<i32>, PipelineError>;
}

pub trait AggregationStoreLike {
    fn call_aggregation(&mut self, function: &str, period: &Period) -> Result<(), PipelineError>;
}

pub trait SampleSourceLike: Send {
    fn count_samples(&mut self, table: &str, period: &Period) -> Result<u64, PipelineError>;
    /// Stream rows of `table` inside `period` to `emit` without collecting them.
    fn stream_samples(
        &mut self,
        table: &str,
        period: &Period,
        emit: &mut dyn FnMut(GridPoint) -> Result<(), PipelineError>,
    ) -> Result<u64, PipelineError>;
}

/// Transactional destination of one interpolation job.
pub trait SurfaceSinkLike: Send {
    /// Open a transaction that replaces the rows of `table` for `period`.
    fn begin_surface(&mut self, table: &str, period: &Period) -> Result<(), PipelineError>;
    fn insert_point(&mut self, point: GridPoint) -> Result<(), PipelineError>;
    fn commit_surface(&mut self) -> Result<(), PipelineError>;
    fn rollback_surface(&mut self) -> Result<(), PipelineError>;
}

pub trait SurfaceSourceLike {
    /// Surface values ordered north to south, then west to east.
    fn load_surface(&mut self, table: &str, period: &Period) -> Result<Vec<f64>, PipelineError>;
    fn count_surface(&mut self, table: &str, period: &Period) -> Result<u64, PipelineError>;
}

struct PendingSurface {
    table: String,
    period: Period,
    points: Vec<GridPoint>,
}

/// In-memory stand-in for the relational store.
pub struct InMemoryStore {
    pub measurements: BTreeMap<(i32, i64), Measurement>,
    pub nodes: BTreeSet<i32>,
    /// Aggregated samples and interpolated surfaces, keyed by table name.
    pub tables: HashMap<String, Vec<(NaiveDateTime, GridPoint)>>,
    pub aggregation_calls: Vec<String>,
    failing_functions: HashSet<String>,
    unavailable: bool,
    pending: Option<PendingSurface>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            measurements: BTreeMap::new(),
            nodes: BTreeSet::new(),
            tables: HashMap::new(),
            aggregation_calls: Vec::new(),
            failing_functions: HashSet::new(),
            unavailable: false,
            pending: None,
        }
    }

    pub fn with_nodes(nodes: &[i32]) -> Self {
        let mut store = Self::new();
        store.nodes.extend(nodes.iter().copied());
        store
    }

    pub fn add_rows(&mut self, table: &str, when: NaiveDateTime, points: &[GridPoint]) {
        self.tables
            .entry(table.to_string())
            .or_default()
            .extend(points.iter().map(|p| (when, *p)));
    }

    pub fn rows_in(&self, table: &str, period: &Period) -> Vec<GridPoint> {
        self.tables
            .get(table)
            .map(|rows| rows.iter().filter(|(w, _)| period.contains(*w)).map(|(_, p)| *p).collect())
            .unwrap_or_default()
    }

    pub fn fail_function(&mut self, function: &str) {
        self.failing_functions.insert(function.to_string());
    }

    /// Make every subsequent call fail as if the database were down.
    pub fn set_unavailable(&mut self, unavailable: bool) {
        self.unavailable = unavailable;
    }

    fn check_available(&self) -> Result<(), PipelineError> {
        if self.unavailable {
            Err(PipelineError::Database("connection refused".to_string()))
        } else {
            Ok(())
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MeasurementStoreLike for InMemoryStore {
    fn insert_measurement(&mut self, measurement: &Measurement, _quantities: &[Quantity]) -> Result<InsertOutcome, PipelineError> {
        self.check_available()?;
        let key = (measurement.node_id, measurement.sequence);
        if self.measurements.contains_key(&key) {
            return Ok(InsertOutcome::Duplicate);
        }
        self.measurements.insert(key, measurement.clone());
        Ok(InsertOutcome::Inserted)
    }

    fn node_ids(&mut self) -> Result<Vec<i32>, PipelineError> {
        self.check_available()?;
        Ok(self.nodes.iter().copied().collect())
    }
}

impl AggregationStoreLike for InMemoryStore {
    fn call_aggregation(&mut self, function: &str, _period: &Period) -> Result<(), PipelineError> {
        self.check_available()?;
        if self.failing_functions.contains(function) {
            return Err(PipelineError::Database(format!("function {} raised an exception", function)));
        }
        self.aggregation_calls.push(function.to_string());
        Ok(())
    }
}

impl SampleSourceLike for InMemoryStore {
    fn count_samples(&mut self, table: &str, period: &Period) -> Result<u64, PipelineError> {
        self.check_available()?;
        Ok(self.rows_in(table, period).len() as u64)
    }

    fn stream_samples(
        &mut self,
        table: &str,
        period: &Period,
        emit: &mut dyn FnMut(GridPoint) -> Result<(), PipelineError>,
    ) -> Result<u64, PipelineError> {
        self.check_available()?;
        let mut sent = 0;
        for point in self.rows_in(table, period) {
            emit(point)?;
            sent += 1;
        }
        Ok(sent)
    }
}

impl SurfaceSinkLike for InMemoryStore {
    fn begin_surface(&mut self, table: &str, period: &Period) -> Result<(), PipelineError> {
        self.check_available()?;
        if self.pending.is_some() {
            return Err(PipelineError::Database("a surface transaction is already open".to_string()));
        }
        self.pending = Some(PendingSurface { table: table.to_string(), period: *period, points: Vec::new() });
        Ok(())
    }

    fn insert_point(&mut self, point: GridPoint) -> Result<(), PipelineError> {
        match self.pending.as_mut() {
            Some(pending) => {
                pending.points.push(point);
                Ok(())
            }
            None => Err(PipelineError::Database("no surface transaction open".to_string())),
        }
    }

    fn commit_surface(&mut self) -> Result<(), PipelineError> {
        let pending = self
            .pending
            .take()
            .ok_or_else(|| PipelineError::Database("no surface transaction open".to_string()))?;
        let rows = self.tables.entry(pending.table).or_default();
        rows.retain(|(when, _)| !pending.period.contains(*when));
        rows.extend(pending.points.into_iter().map(|p| (pending.period.start, p)));
        Ok(())
    }

    fn rollback_surface(&mut self) -> Result<(), PipelineError> {
        self.pending = None;
        Ok(())
    }
}

impl SurfaceSourceLike for InMemoryStore {
    fn load_surface(&mut self, table: &str, period: &Period) -> Result<Vec<f64>, PipelineError> {
        self.check_available()?;
        let mut points = self.rows_in(table, period);
        points.sort_by(|a, b| {
            b.latitude
                .total_cmp(&a.latitude)
                .then(a.longitude.total_cmp(&b.longitude))
        });
        Ok(points.into_iter().map(|p| p.value).collect())
    }

    fn count_surface(&mut self, table: &str, period: &Period) -> Result<u64, PipelineError> {
        self.check_available()?;
        Ok(self.rows_in(table, period).len() as u64)
    }
}
