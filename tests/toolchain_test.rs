use smogroute::config::Settings;
use smogroute::rebuild::{RebuildCoordinator, RebuildTrigger};
use smogroute::routing::ReloadTarget;
use smogroute::toolchain::Stage;
use smogroute::PipelineError;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tempfile::TempDir;

const SETTINGS: &str = r#"
run_dir: ROOT/run
broker:
  host: localhost
  client_id: toolchain-test
quantities:
  - { id: no2, sql_type: double precision, wire_index: 8, route_planner: true, profile: { slope: 1.0, intercept: 0.0 } }
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
  weight_pollution: 1.0
  grid_cell_size: 0.1
  sensor_path: ROOT/sensor.raster
  knowledge_path: ROOT/knowledge.raster
routing:
  map_path: ROOT/region.osm.pbf
  toolchain_dir: ROOT/bin
  lock:
    dir: ROOT/run
    poll_interval_ms: 5
  profiles:
    - { name: broken, profile_script: /etc/broken.lua, folder: ROOT/broken, port: 5000 }
    - { name: car, profile_script: /etc/car.lua, folder: ROOT/car, port: 5001 }
    - { name: bike, profile_script: /etc/bike.lua, folder: ROOT/bike, port: 5002, pollution: sensor }
"#;

/// Every fake stage appends its name and arguments to `calls`. Extract
/// insists on the map link and fails for the broken profile script.
const STAGE_SCRIPT: &str = r#"#!/bin/sh
echo "$(basename "$0") $*" >> ROOT/calls
echo "processing $1"
if [ "$(basename "$0")" = "osrm-extract" ]; then
    test -e "$1" || exit 9
    case "$3" in *broken*) echo "profile error" >&2; exit 2;; esac
fi
exit 0
"#;

#[derive(Default)]
struct CountingTarget {
    reloads: usize,
}

impl ReloadTarget for CountingTarget {
    fn reload(&mut self) -> Result<(), PipelineError> {
        self.reloads += 1;
        Ok(())
    }
}

fn install_toolchain(root: &Path) {
    let bin = root.join("bin");
    fs::create_dir_all(&bin).unwrap();
    let script = STAGE_SCRIPT.replace("ROOT", &root.display().to_string());
    for stage in Stage::ORDER {
        let path = bin.join(stage.program());
        fs::write(&path, &script).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    }
}

// One test only: the fake stages are freshly written executables, and a
// concurrent fork from a sibling test could keep them busy.
#[test]
fn test_map_refresh_rebuilds_independent_profiles_through_real_processes() {
    let dir = TempDir::new().expect("tempdir should succeed");
    let root = dir.path();
    install_toolchain(root);
    fs::write(root.join("region.osm.pbf"), b"pbf").unwrap();

    let yaml = SETTINGS.replace("ROOT", &root.display().to_string());
    let settings = Settings::from_yaml(&yaml).expect("settings should parse");
    let mut coordinator = RebuildCoordinator::from_settings(&settings);
    let mut target = CountingTarget::default();

    let report = coordinator.rebuild(RebuildTrigger::MapRefreshed, &mut target).expect("rebuild should run");

    assert_eq!(report.profiles.len(), 2, "the sensor profile does not depend on the map refresh alone");
    assert_eq!(report.profiles[0].profile, "broken");
    assert_eq!(report.profiles[0].failed_stage, Some(Stage::Extract));
    assert!(report.profiles[1].succeeded());
    assert!(report.reloaded);
    assert_eq!(target.reloads, 1);

    let r = root.display();
    let calls = fs::read_to_string(root.join("calls")).expect("stages should have run");
    let calls: Vec<&str> = calls.lines().collect();
    assert_eq!(
        calls,
        vec![
            format!("osrm-extract {r}/broken/region.osm.pbf --profile /etc/broken.lua"),
            format!("osrm-extract {r}/car/region.osm.pbf --profile /etc/car.lua"),
            format!("osrm-partition {r}/car/region.osrm"),
            format!("osrm-customize {r}/car/region.osrm"),
            format!("osrm-contract {r}/car/region.osrm"),
        ]
    );
    assert_eq!(fs::read(root.join("car/region.osm.pbf")).unwrap(), b"pbf");
    assert!(!coordinator.lock().path().exists());
}
