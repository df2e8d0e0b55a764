//! Pollution cost raster: composition from interpolated surfaces and the
//! text file the routing toolchain reads.
//!
//! File layout:
//!
//! ```text
//! <min_lon> <min_lat>
//! <max_lon> <max_lat>
//! <rows> <cols>
//! <weight_routing> <weight_pollution>
//! <v v v ...>        one line per row, north to south
//! ```

use crate::config::{RasterSettings, Settings};
use crate::error::PipelineError;
use crate::period::Period;
use crate::quantity::LinearProfile;
use crate::store::SurfaceSourceLike;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct Raster {
    pub rows: usize,
    pub cols: usize,
    pub values: Vec<f64>,
}

impl Raster {
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self { rows, cols, values: vec![0.0; rows * cols] }
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.values[row * self.cols + col]
    }

    pub fn is_all_zero(&self) -> bool {
        self.values.iter().all(|v| *v == 0.0)
    }
}

/// One surface contributing to the cost raster, `None` when it could not be loaded.
#[derive(Debug, Clone)]
pub struct CostSurface {
    pub name: String,
    pub profile: LinearProfile,
    pub values: Option<Vec<f64>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Composition {
    pub raster: Raster,
    /// Surfaces that were missing or had the wrong number of points.
    pub incomplete: Vec<String>,
}

impl Composition {
    pub fn is_complete(&self) -> bool {
        self.incomplete.is_empty()
    }
}

/// Cell cost is the worst case over all surfaces of `slope * value + intercept`.
/// If any surface is absent or mis-sized the result is all zeros.
pub fn compose(surfaces: &[CostSurface], rows: usize, cols: usize) -> Composition {
    let cells = rows * cols;
    let incomplete: Vec<String> = surfaces
        .iter()
        .filter(|s| s.values.as_ref().map(|v| v.len()) != Some(cells))
        .map(|s| s.name.clone())
        .collect();
    if !incomplete.is_empty() || surfaces.is_empty() {
        return Composition { raster: Raster::zeros(rows, cols), incomplete };
    }

    let mut values = vec![f64::NEG_INFINITY; cells];
    for surface in surfaces {
        if let Some(points) = &surface.values {
            for (cell, value) in values.iter_mut().zip(points) {
                *cell = cell.max(surface.profile.cost(*value));
            }
        }
    }
    Composition { raster: Raster { rows, cols, values }, incomplete }
}

/// Load every (method, routing quantity) surface of `period` and compose them.
pub fn compose_from_store<S: SurfaceSourceLike>(store: &mut S, settings: &Settings, period: &Period) -> Composition {
    let mut surfaces = Vec::new();
    for method in &settings.interpolation.methods {
        for quantity in settings.routing_quantities() {
            let Some(profile) = quantity.routing_profile() else {
                continue;
            };
            let table = quantity.interpolation_table(&method.id, period.kind);
            let values = match store.load_surface(&table, period) {
                Ok(values) if values.len() == settings.raster.cell_count() => Some(values),
                Ok(values) => {
                    warn!(table = %table, points = values.len(), expected = settings.raster.cell_count(), "surface has wrong size");
                    None
                }
                Err(e) => {
                    warn!(table = %table, error = %e, "surface could not be loaded");
                    None
                }
            };
            surfaces.push(CostSurface { name: table, profile: *profile, values });
        }
    }
    let composition = compose(&surfaces, settings.raster.rows, settings.raster.cols);
    if composition.is_complete() {
        info!(period = %period, surfaces = surfaces.len(), "cost raster composed");
    } else {
        warn!(period = %period, incomplete = ?composition.incomplete, "surfaces incomplete, emitting zero raster");
    }
    composition
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write the raster next to `path` and rename it into place.
pub fn write_raster(path: &Path, raster: &Raster, settings: &RasterSettings) -> Result<(), PipelineError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = temp_path(path);
    {
        let file = fs::File::create(&tmp)?;
        let mut writer = BufWriter::new(file);
        let bbox = &settings.bbox;
        writeln!(writer, "{} {}", bbox.min_longitude, bbox.min_latitude)?;
        writeln!(writer, "{} {}", bbox.max_longitude, bbox.max_latitude)?;
        writeln!(writer, "{} {}", raster.rows, raster.cols)?;
        writeln!(writer, "{} {}", settings.weight_routing, settings.weight_pollution)?;
        for row in raster.values.chunks(raster.cols.max(1)) {
            let line: Vec<String> = row.iter().map(|v| v.to_string()).collect();
            writeln!(writer, "{}", line.join(" "))?;
        }
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Parse and check a raster file against the configured grid.
pub fn read_raster(path: &Path, settings: &RasterSettings) -> Result<Raster, PipelineError> {
    let text = fs::read_to_string(path)?;
    let mut lines = text.lines();
    let invalid = |reason: String| PipelineError::Contract(format!("raster {}: {}", path.display(), reason));

    for header in ["lower corner", "upper corner"] {
        let line = lines.next().ok_or_else(|| invalid(format!("missing {}", header)))?;
        parse_numbers::<f64>(line).filter(|v| v.len() == 2).ok_or_else(|| invalid(format!("bad {} {:?}", header, line)))?;
    }
    let line = lines.next().ok_or_else(|| invalid("missing dimensions".to_string()))?;
    let dims = parse_numbers::<usize>(line)
        .filter(|v| v.len() == 2)
        .ok_or_else(|| invalid(format!("bad dimensions {:?}", line)))?;
    if dims[0] != settings.rows || dims[1] != settings.cols {
        return Err(invalid(format!(
            "grid is {}x{}, expected {}x{}",
            dims[0], dims[1], settings.rows, settings.cols
        )));
    }
    let line = lines.next().ok_or_else(|| invalid("missing weights".to_string()))?;
    parse_numbers::<f64>(line).filter(|v| v.len() == 2).ok_or_else(|| invalid(format!("bad weights {:?}", line)))?;

    let mut values = Vec::with_capacity(settings.cell_count());
    let mut row_count = 0;
    for (index, line) in lines.filter(|l| !l.trim().is_empty()).enumerate() {
        let row = parse_numbers::<f64>(line).ok_or_else(|| invalid(format!("row {} is not numeric", index)))?;
        if row.len() != settings.cols {
            return Err(invalid(format!("row {} has {} values, expected {}", index, row.len(), settings.cols)));
        }
        values.extend(row);
        row_count += 1;
    }
    if row_count != settings.rows {
        return Err(invalid(format!("{} rows, expected {}", row_count, settings.rows)));
    }
    Ok(Raster { rows: settings.rows, cols: settings.cols, values })
}

fn parse_numbers<T: std::str::FromStr>(line: &str) -> Option<Vec<T>> {
    line.split_whitespace().map(|f| f.parse().ok()).collect()
}

/// Validate an externally produced raster and atomically copy it to `destination`.
pub fn install_raster(source: &Path, destination: &Path, settings: &RasterSettings) -> Result<(), PipelineError> {
    read_raster(source, settings)?;
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = temp_path(destination);
    fs::copy(source, &tmp)?;
    fs::rename(&tmp, destination)?;
    info!(source = %source.display(), destination = %destination.display(), "raster installed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample_settings;

    fn surface(name: &str, slope: f64, intercept: f64, values: Option<Vec<f64>>) -> CostSurface {
        CostSurface { name: name.to_string(), profile: LinearProfile::new(slope, intercept), values }
    }

    #[test]
    fn test_cell_is_worst_case_over_quantities() {
        let composition = compose(
            &[surface("a", 1.0, 0.0, Some(vec![3.0])), surface("b", 2.0, -1.0, Some(vec![1.5]))],
            1,
            1,
        );
        assert!(composition.is_complete());
        assert_eq!(composition.raster.values, vec![3.0]);
    }

    #[test]
    fn test_missing_surface_gives_zero_raster() {
        let composition = compose(
            &[surface("a", 1.0, 0.0, Some(vec![3.0, 4.0])), surface("b", 2.0, -1.0, None)],
            1,
            2,
        );
        assert_eq!(composition.incomplete, vec!["b".to_string()]);
        assert_eq!(composition.raster, Raster::zeros(1, 2));
    }

    #[test]
    fn test_mis_sized_surface_gives_zero_raster() {
        let composition = compose(&[surface("a", 1.0, 0.0, Some(vec![3.0]))], 2, 2);
        assert!(!composition.is_complete());
        assert!(composition.raster.is_all_zero());
        assert_eq!(composition.raster.values.len(), 4);
    }

    #[test]
    fn test_negative_costs_are_kept() {
        let composition = compose(&[surface("a", 1.0, -5.0, Some(vec![1.0, 2.0]))], 1, 2);
        assert_eq!(composition.raster.values, vec![-4.0, -3.0]);
    }

    #[test]
    fn test_write_then_validate() {
        let dir = tempfile::tempdir().expect("tempdir should succeed");
        let settings = sample_settings().raster;
        let path = dir.path().join("osrm").join("sensor.raster");
        let raster = Raster { rows: 4, cols: 5, values: (0..20).map(f64::from).collect() };
        write_raster(&path, &raster, &settings).expect("write should succeed");

        let text = fs::read_to_string(&path).expect("read should succeed");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "-8.5 40.1");
        assert_eq!(lines[2], "4 5");
        assert_eq!(lines[3], "1 0.5");
        assert_eq!(lines[4], "0 1 2 3 4");
        assert_eq!(lines.len(), 8);
        assert!(!temp_path(&path).exists());

        let back = read_raster(&path, &settings).expect("validate should succeed");
        assert_eq!(back.get(3, 4), 19.0);
    }

    #[test]
    fn test_validation_rejects_wrong_shape() {
        let dir = tempfile::tempdir().expect("tempdir should succeed");
        let settings = sample_settings().raster;
        let path = dir.path().join("k.raster");

        fs::write(&path, "-8.5 40.1\n-8.3 40.3\n3 5\n1 0.5\n").unwrap();
        assert!(read_raster(&path, &settings).is_err());

        let mut body = String::from("-8.5 40.1\n-8.3 40.3\n4 5\n1 0.5\n");
        for _ in 0..4 {
            body.push_str("1 2 3 4\n");
        }
        fs::write(&path, &body).unwrap();
        assert!(read_raster(&path, &settings).is_err());

        let mut body = String::from("-8.5 40.1\n-8.3 40.3\n4 5\n1 0.5\n");
        for _ in 0..3 {
            body.push_str("1 2 3 4 5\n");
        }
        fs::write(&path, &body).unwrap();
        assert!(read_raster(&path, &settings).is_err());
    }

    #[test]
    fn test_install_replaces_destination() {
        let dir = tempfile::tempdir().expect("tempdir should succeed");
        let settings = sample_settings().raster;
        let source = dir.path().join("incoming.raster");
        let destination = dir.path().join("knowledge.raster");
        write_raster(&source, &Raster::zeros(4, 5), &settings).unwrap();
        fs::write(&destination, "old").unwrap();

        install_raster(&source, &destination, &settings).expect("install should succeed");
        assert_eq!(fs::read_to_string(&destination).unwrap(), fs::read_to_string(&source).unwrap());

        fs::write(&source, "garbage").unwrap();
        assert!(install_raster(&source, &destination, &settings).is_err());
        assert!(read_raster(&destination, &settings).is_ok());
    }
}
