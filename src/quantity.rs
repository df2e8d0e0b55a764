//! Measured quantities and the table names derived from them.

use crate::aggregation::Statistic;
use crate::error::PipelineError;
use crate::period::PeriodKind;
use serde::{Deserialize, Serialize};

/// Storage type of a quantity's readings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SqlType {
    #[serde(rename = "integer")]
    Integer,
    #[serde(rename = "real")]
    Real,
    #[serde(rename = "double precision")]
    DoublePrecision,
}

impl SqlType {
    pub fn sql_name(&self) -> &'static str {
        match self {
            SqlType::Integer => "INTEGER",
            SqlType::Real => "REAL",
            SqlType::DoublePrecision => "DOUBLE PRECISION",
        }
    }
}

/// Maps an interpolated value to its routing-cost contribution.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinearProfile {
    pub slope: f64,
    pub intercept: f64,
}

impl LinearProfile {
    pub fn new(slope: f64, intercept: f64) -> Self {
        Self { slope, intercept }
    }

    pub fn cost(&self, value: f64) -> f64 {
        self.slope * value + self.intercept
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quantity {
    pub id: String,
    #[serde(default)]
    pub description: String,
    pub sql_type: SqlType,
    /// Position of this quantity's value in the wire record.
    pub wire_index: usize,
    #[serde(default)]
    pub mobile_app: bool,
    #[serde(default)]
    pub route_planner: bool,
    #[serde(default)]
    pub subscribable: bool,
    #[serde(default)]
    pub profile: Option<LinearProfile>,
}

impl Quantity {
    pub fn routing_profile(&self) -> Option<&LinearProfile> {
        if self.route_planner {
            self.profile.as_ref()
        } else {
            None
        }
    }

    pub fn aggregation_table(&self, statistic: Statistic, period: PeriodKind, resolution: &str) -> String {
        format!(
            "aggregation_{}_{}_{}_{}",
            statistic.sql_function(),
            period.identifier(),
            resolution,
            self.id
        )
    }

    pub fn aggregation_function(&self, statistic: Statistic, period: PeriodKind, resolution: &str) -> String {
        format!(
            "aggregate_{}_{}_{}_{}",
            statistic.sql_function(),
            period.identifier(),
            resolution,
            self.id
        )
    }

    pub fn interpolation_table(&self, method: &str, period: PeriodKind) -> String {
        format!("interpolation_{}_{}_{}", method, period.identifier(), self.id)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if !is_sql_identifier(&self.id) {
            return Err(PipelineError::Config(format!(
                "quantity id {:?} must match [a-z0-9_]+",
                self.id
            )));
        }
        match (self.route_planner, self.profile.is_some()) {
            (true, false) => Err(PipelineError::Config(format!(
                "quantity {} feeds the route planner but has no pollution profile",
                self.id
            ))),
            (false, true) => Err(PipelineError::Config(format!(
                "quantity {} has a pollution profile but does not feed the route planner",
                self.id
            ))),
            _ => Ok(()),
        }
    }
}

/// Identifiers end up inside table and function names, so only a narrow
/// alphabet is accepted.
pub fn is_sql_identifier(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no2() -> Quantity {
        Quantity {
            id: "no2".to_string(),
            description: "nitrogen dioxide".to_string(),
            sql_type: SqlType::Real,
            wire_index: 8,
            mobile_app: true,
            route_planner: true,
            subscribable: true,
            profile: Some(LinearProfile::new(2.0, -1.0)),
        }
    }

    #[test]
    fn test_table_names() {
        let q = no2();
        assert_eq!(
            q.aggregation_table(Statistic::Avg, PeriodKind::Daily, "hundred_meters"),
            "aggregation_avg_daily_hundred_meters_no2"
        );
        assert_eq!(
            q.aggregation_function(Statistic::Max, PeriodKind::Hourly, "fifty_meters"),
            "aggregate_max_hourly_fifty_meters_no2"
        );
        assert_eq!(q.interpolation_table("kriging", PeriodKind::Daily), "interpolation_kriging_daily_no2");
    }

    #[test]
    fn test_profile_required_iff_route_planner() {
        let mut q = no2();
        assert!(q.validate().is_ok());
        q.profile = None;
        assert!(q.validate().is_err());
        q.route_planner = false;
        assert!(q.validate().is_ok());
        q.profile = Some(LinearProfile::new(1.0, 0.0));
        assert!(q.validate().is_err());
    }

    #[test]
    fn test_identifier_alphabet() {
        assert!(is_sql_identifier("pm2_5"));
        assert!(!is_sql_identifier("pm2.5"));
        assert!(!is_sql_identifier("no2; DROP TABLE x"));
        assert!(!is_sql_identifier(""));
    }

    #[test]
    fn test_linear_cost() {
        let p = LinearProfile::new(2.0, -1.0);
        assert_eq!(p.cost(1.5), 2.0);
    }
}
