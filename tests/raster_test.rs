use smogroute::config::Settings;
use smogroute::period::{Period, PeriodKind};
use smogroute::raster::{compose_from_store, read_raster, write_raster};
use smogroute::store::{GridPoint, InMemoryStore};
use tempfile::TempDir;

const SETTINGS: &str = r#"
run_dir: /tmp/smogroute-raster-test
broker:
  host: localhost
  client_id: raster-test
quantities:
  - { id: pm10, sql_type: real, wire_index: 6, mobile_app: true }
  - { id: no2, sql_type: double precision, wire_index: 8, route_planner: true, profile: { slope: 2.0, intercept: -1.0 } }
  - { id: o3, sql_type: double precision, wire_index: 9, route_planner: true, profile: { slope: 1.0, intercept: 0.0 } }
aggregation:
  statistics: [avg]
  resolutions:
    - { id: hundred_meters, cell_latitude_size: 0.001, cell_longitude_size: 0.0012 }
interpolation:
  statistic: avg
  resolution: hundred_meters
  methods:
    - { id: idw, program: /bin/true }
raster:
  bbox: { min_longitude: -8.5, min_latitude: 40.1, max_longitude: -8.3, max_latitude: 40.3 }
  rows: 2
  cols: 2
  weight_routing: 1.0
  weight_pollution: 0.25
  grid_cell_size: 0.1
  sensor_path: /tmp/smogroute-raster-test/sensor.raster
  knowledge_path: /tmp/smogroute-raster-test/knowledge.raster
routing:
  map_path: /tmp/map.osm.pbf
  toolchain_dir: /usr/bin
  lock:
    dir: /tmp
  profiles: []
"#;

fn settings() -> Settings {
    Settings::from_yaml(SETTINGS).expect("settings should parse")
}

fn period() -> Period {
    Period::parse(PeriodKind::Daily, "2024-05-01").expect("period should parse")
}

/// NW, NE, SW, SE cells in a deliberately scrambled order.
fn surface(nw: f64, ne: f64, sw: f64, se: f64) -> Vec<GridPoint> {
    vec![
        GridPoint::new(-8.35, 40.15, se),
        GridPoint::new(-8.45, 40.25, nw),
        GridPoint::new(-8.45, 40.15, sw),
        GridPoint::new(-8.35, 40.25, ne),
    ]
}

#[test]
fn test_composed_raster_is_north_up_worst_case() {
    let dir = TempDir::new().expect("tempdir should succeed");
    let mut store = InMemoryStore::new();
    store.add_rows("interpolation_idw_daily_no2", period().start, &surface(1.0, 2.0, 3.0, 4.0));
    store.add_rows("interpolation_idw_daily_o3", period().start, &surface(0.0, 9.0, 0.0, 0.0));
    // Rows of another day are ignored.
    store.add_rows("interpolation_idw_daily_no2", period().next().start, &surface(50.0, 50.0, 50.0, 50.0));

    let settings = settings();
    let composition = compose_from_store(&mut store, &settings, &period());
    assert!(composition.is_complete());
    assert_eq!(composition.raster.values, vec![1.0, 9.0, 5.0, 7.0]);

    let path = dir.path().join("sensor.raster");
    write_raster(&path, &composition.raster, &settings.raster).expect("write should succeed");
    let text = std::fs::read_to_string(&path).unwrap();
    assert_eq!(text, "-8.5 40.1\n-8.3 40.3\n2 2\n1 0.25\n1 9\n5 7\n");
    assert_eq!(read_raster(&path, &settings.raster).expect("raster should validate"), composition.raster);
}

#[test]
fn test_missing_quantity_surface_yields_zero_raster() {
    let mut store = InMemoryStore::new();
    store.add_rows("interpolation_idw_daily_no2", period().start, &surface(1.0, 2.0, 3.0, 4.0));

    let composition = compose_from_store(&mut store, &settings(), &period());
    assert_eq!(composition.incomplete, vec!["interpolation_idw_daily_o3".to_string()]);
    assert_eq!(composition.raster.values, vec![0.0; 4]);
}

#[test]
fn test_partial_surface_yields_zero_raster() {
    let mut store = InMemoryStore::new();
    store.add_rows("interpolation_idw_daily_no2", period().start, &surface(1.0, 2.0, 3.0, 4.0));
    store.add_rows("interpolation_idw_daily_o3", period().start, &surface(1.0, 2.0, 3.0, 4.0)[..3]);

    let composition = compose_from_store(&mut store, &settings(), &period());
    assert!(!composition.is_complete());
    assert!(composition.raster.is_all_zero());
}

#[test]
fn test_unreachable_store_yields_zero_raster() {
    let mut store = InMemoryStore::new();
    store.set_unavailable(true);
    let composition = compose_from_store(&mut store, &settings(), &period());
    assert_eq!(composition.incomplete.len(), 2);
    assert!(composition.raster.is_all_zero());
}
