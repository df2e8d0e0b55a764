//! Triggers the stored aggregation functions that feed interpolation.
//!
//! The functions themselves live in the database; this module only decides
//! which ones run for a period and invokes them one by one.

use crate::config::Settings;
use crate::period::{Period, PeriodKind};
use crate::store::AggregationStoreLike;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Statistic {
    Avg,
    Max,
    Min,
}

impl Statistic {
    pub fn sql_function(&self) -> &'static str {
        match self {
            Statistic::Avg => "avg",
            Statistic::Max => "max",
            Statistic::Min => "min",
        }
    }
}

/// Spatial resolution of an aggregation grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub id: String,
    pub cell_latitude_size: f64,
    pub cell_longitude_size: f64,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct AggregationReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
}

/// Names of the aggregation functions to call for a period of the given kind.
///
/// Hourly periods only serve the mobile app. Daily periods also produce the
/// interpolation input of routing quantities, at the interpolation statistic
/// and resolution only.
pub fn plan_aggregation(settings: &Settings, kind: PeriodKind) -> Vec<String> {
    let interpolation = &settings.interpolation;
    let mut functions = Vec::new();
    for statistic in &settings.aggregation.statistics {
        for resolution in &settings.aggregation.resolutions {
            for quantity in &settings.quantities {
                let wanted = match kind {
                    PeriodKind::Hourly => quantity.mobile_app,
                    PeriodKind::Daily => {
                        quantity.mobile_app
                            || (quantity.route_planner
                                && *statistic == interpolation.statistic
                                && resolution.id == interpolation.resolution)
                    }
                };
                if wanted {
                    functions.push(quantity.aggregation_function(*statistic, kind, &resolution.id));
                }
            }
        }
    }
    functions
}

pub fn run_aggregation<S: AggregationStoreLike>(
    store: &mut S,
    settings: &Settings,
    period: &Period,
) -> AggregationReport {
    info!(period = %period, "aggregation started");
    let mut report = AggregationReport::default();
    for function in plan_aggregation(settings, period.kind) {
        match store.call_aggregation(&function, period) {
            Ok(()) => report.succeeded.push(function),
            Err(e) => {
                error!(function = %function, error = %e, "aggregation function failed");
                report.failed.push(function);
            }
        }
    }
    info!(
        period = %period,
        succeeded = report.succeeded.len(),
        failed = report.failed.len(),
        "aggregation finished"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample_settings;
    use crate::store::InMemoryStore;
    use chrono::NaiveDate;

    #[test]
    fn test_hourly_plan_only_mobile_app_quantities() {
        let settings = sample_settings();
        let plan = plan_aggregation(&settings, PeriodKind::Hourly);
        // 3 statistics x 2 resolutions x 1 mobile-app quantity (pm10)
        assert_eq!(plan.len(), 6);
        assert!(plan.iter().all(|f| f.ends_with("_pm10")));
        assert!(plan.contains(&"aggregate_min_hourly_fifty_meters_pm10".to_string()));
    }

    #[test]
    fn test_daily_plan_adds_interpolation_input_of_routing_quantities() {
        let settings = sample_settings();
        let plan = plan_aggregation(&settings, PeriodKind::Daily);
        assert_eq!(plan.len(), 7);
        assert!(plan.contains(&"aggregate_avg_daily_hundred_meters_no2".to_string()));
        assert!(!plan.contains(&"aggregate_max_daily_hundred_meters_no2".to_string()));
    }

    #[test]
    fn test_failing_function_does_not_stop_the_rest() {
        let settings = sample_settings();
        let mut store = InMemoryStore::new();
        store.fail_function("aggregate_avg_daily_fifty_meters_pm10");
        let day = NaiveDate::from_ymd_opt(2024, 3, 10).unwrap().and_hms_opt(12, 0, 0).unwrap();
        let period = Period::containing(PeriodKind::Daily, day);
        let report = run_aggregation(&mut store, &settings, &period);
        assert_eq!(report.failed, vec!["aggregate_avg_daily_fifty_meters_pm10".to_string()]);
        assert_eq!(report.succeeded.len(), 6);
        assert_eq!(store.aggregation_calls.len(), 6);
    }
}
