//! Routing data rebuild under the cross-process lock.

use crate::config::Settings;
use crate::error::PipelineError;
use crate::lock::RebuildLock;
use crate::routing::{PollutionDependency, ReloadTarget, RoutingProfile};
use crate::toolchain::{Stage, StageRunner, ToolchainRunner};
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildTrigger {
    /// A cost raster was regenerated; profiles reading it must be rebuilt.
    RasterProduced(PollutionDependency),
    /// A new map snapshot; profiles that read no raster are rebuilt.
    MapRefreshed,
}

impl RebuildTrigger {
    pub fn affects(&self, profile: &RoutingProfile) -> bool {
        match self {
            RebuildTrigger::RasterProduced(PollutionDependency::None) => false,
            RebuildTrigger::RasterProduced(dependency) => profile.pollution == *dependency,
            RebuildTrigger::MapRefreshed => profile.pollution == PollutionDependency::None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            RebuildTrigger::RasterProduced(PollutionDependency::Sensor) => "sensor-raster",
            RebuildTrigger::RasterProduced(PollutionDependency::Knowledge) => "knowledge-raster",
            RebuildTrigger::RasterProduced(PollutionDependency::None) => "raster",
            RebuildTrigger::MapRefreshed => "map-refresh",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProfileReport {
    pub profile: String,
    pub failed_stage: Option<Stage>,
    pub error: Option<String>,
}

impl ProfileReport {
    pub fn succeeded(&self) -> bool {
        self.failed_stage.is_none()
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct RebuildReport {
    pub profiles: Vec<ProfileReport>,
    pub reloaded: bool,
}

impl RebuildReport {
    pub fn failures(&self) -> usize {
        self.profiles.iter().filter(|p| !p.succeeded()).count()
    }
}

pub struct RebuildCoordinator<R: StageRunner> {
    lock: RebuildLock,
    runner: R,
    map_path: PathBuf,
    profiles: Vec<RoutingProfile>,
}

impl RebuildCoordinator<ToolchainRunner> {
    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            RebuildLock::from_settings(&settings.routing.lock),
            ToolchainRunner::new(&settings.routing.toolchain_dir),
            settings,
        )
    }
}

impl<R: StageRunner> RebuildCoordinator<R> {
    pub fn new(lock: RebuildLock, runner: R, settings: &Settings) -> Self {
        Self {
            lock,
            runner,
            map_path: settings.routing.map_path.clone(),
            profiles: settings.routing.profiles.clone(),
        }
    }

    pub fn lock(&self) -> &RebuildLock {
        &self.lock
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    pub fn affected_profiles(&self, trigger: RebuildTrigger) -> Vec<&RoutingProfile> {
        self.profiles.iter().filter(|p| trigger.affects(p)).collect()
    }

    pub fn rebuild(&mut self, trigger: RebuildTrigger, target: &mut dyn ReloadTarget) -> Result<RebuildReport, PipelineError> {
        self.rebuild_with(trigger, || Ok(()), target)
    }

    /// Take the lock, run `prepare` (e.g. write the raster or fetch the map),
    /// rebuild every affected profile, release the lock and reload `target`.
    /// A failing profile is logged and the others still run.
    pub fn rebuild_with<F>(
        &mut self,
        trigger: RebuildTrigger,
        prepare: F,
        target: &mut dyn ReloadTarget,
    ) -> Result<RebuildReport, PipelineError>
    where
        F: FnOnce() -> Result<(), PipelineError>,
    {
        let guard = self.lock.acquire(trigger.label())?;
        prepare()?;

        let affected: Vec<RoutingProfile> = self.profiles.iter().filter(|p| trigger.affects(p)).cloned().collect();
        let mut report = RebuildReport::default();
        for profile in &affected {
            report.profiles.push(self.rebuild_profile(profile));
        }
        drop(guard);

        if !affected.is_empty() {
            match target.reload() {
                Ok(()) => report.reloaded = true,
                Err(e) => error!(error = %e, "routing servers did not reload"),
            }
        }
        info!(
            trigger = trigger.label(),
            profiles = report.profiles.len(),
            failures = report.failures(),
            reloaded = report.reloaded,
            "rebuild finished"
        );
        Ok(report)
    }

    fn rebuild_profile(&mut self, profile: &RoutingProfile) -> ProfileReport {
        info!(profile = %profile.name, folder = %profile.folder.display(), "rebuilding profile");
        for stage in Stage::ORDER {
            if let Err(e) = self.runner.run_stage(stage, profile, &self.map_path) {
                // Later stages would read half-written files.
                error!(profile = %profile.name, stage = %stage, error = %e, "stage failed, profile data left indeterminate");
                return ProfileReport {
                    profile: profile.name.clone(),
                    failed_stage: Some(stage),
                    error: Some(e.to_string()),
                };
            }
        }
        ProfileReport { profile: profile.name.clone(), failed_stage: None, error: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample_settings;
    use std::path::Path;
    use std::time::Duration;

    #[derive(Default)]
    struct ScriptedRunner {
        calls: Vec<(Stage, String)>,
        fail: Option<(Stage, String)>,
    }

    impl StageRunner for ScriptedRunner {
        fn run_stage(&mut self, stage: Stage, profile: &RoutingProfile, _map_path: &Path) -> Result<(), PipelineError> {
            self.calls.push((stage, profile.name.clone()));
            if self.fail.as_ref() == Some(&(stage, profile.name.clone())) {
                return Err(PipelineError::Subprocess { program: stage.program().to_string(), reason: "exit 1".to_string() });
            }
            Ok(())
        }
    }

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

    fn coordinator(dir: &Path, runner: ScriptedRunner) -> RebuildCoordinator<ScriptedRunner> {
        let lock = RebuildLock::new(dir, "routing_data", Duration::from_millis(200), Duration::from_millis(10));
        RebuildCoordinator::new(lock, runner, &sample_settings())
    }

    #[test]
    fn test_trigger_selects_profiles() {
        let dir = tempfile::tempdir().expect("tempdir should succeed");
        let c = coordinator(dir.path(), ScriptedRunner::default());
        let names = |t| c.affected_profiles(t).iter().map(|p| p.name.clone()).collect::<Vec<_>>();
        assert_eq!(names(RebuildTrigger::RasterProduced(PollutionDependency::Sensor)), vec!["bike_sensor"]);
        assert_eq!(names(RebuildTrigger::RasterProduced(PollutionDependency::Knowledge)), vec!["bike_knowledge"]);
        assert_eq!(names(RebuildTrigger::MapRefreshed), vec!["car"]);
        assert!(names(RebuildTrigger::RasterProduced(PollutionDependency::None)).is_empty());
    }

    #[test]
    fn test_stages_run_in_order() {
        let dir = tempfile::tempdir().expect("tempdir should succeed");
        let mut c = coordinator(dir.path(), ScriptedRunner::default());
        let mut target = CountingTarget::default();
        let report = c.rebuild(RebuildTrigger::MapRefreshed, &mut target).expect("rebuild should succeed");
        let stages: Vec<Stage> = c.runner().calls.iter().map(|(s, _)| *s).collect();
        assert_eq!(stages, Stage::ORDER.to_vec());
        assert_eq!(report.failures(), 0);
        assert_eq!(target.reloads, 1);
        assert!(c.lock().holder().unwrap().is_none());
    }

    #[test]
    fn test_failed_stage_stops_profile_and_releases_lock() {
        let dir = tempfile::tempdir().expect("tempdir should succeed");
        let runner = ScriptedRunner { fail: Some((Stage::Partition, "bike_sensor".to_string())), ..Default::default() };
        let mut c = coordinator(dir.path(), runner);
        let mut target = CountingTarget::default();
        let report = c
            .rebuild(RebuildTrigger::RasterProduced(PollutionDependency::Sensor), &mut target)
            .expect("rebuild should report, not fail");
        assert_eq!(report.profiles[0].failed_stage, Some(Stage::Partition));
        assert_eq!(c.runner().calls.len(), 2);
        assert!(c.lock().holder().unwrap().is_none());
        assert!(report.reloaded);
    }

    #[test]
    fn test_failed_prepare_releases_lock_without_rebuild() {
        let dir = tempfile::tempdir().expect("tempdir should succeed");
        let mut c = coordinator(dir.path(), ScriptedRunner::default());
        let mut target = CountingTarget::default();
        let result = c.rebuild_with(RebuildTrigger::MapRefreshed, || Err("download failed".into()), &mut target);
        assert!(result.is_err());
        assert!(c.runner().calls.is_empty());
        assert_eq!(target.reloads, 0);
        assert!(c.lock().holder().unwrap().is_none());
    }
}
