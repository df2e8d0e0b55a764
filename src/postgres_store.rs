//! Postgres/PostGIS implementation of the store traits.
//!
//! Table and function names are built from validated identifiers, values
//! always travel as bind parameters.

use crate::error::PipelineError;
use crate::measurement::Measurement;
use crate::period::Period;
use crate::quantity::{Quantity, SqlType};
use crate::store::{
    AggregationStoreLike, GridPoint, InsertOutcome, MeasurementStoreLike, SampleSourceLike,
    SurfaceSinkLike, SurfaceSourceLike,
};
use postgres::error::SqlState;
use postgres::fallible_iterator::FallibleIterator;
use postgres::types::ToSql;
use postgres::{Client, NoTls, Statement};

pub struct PostgresStore {
    client: Client,
    surface: Option<Statement>,
    surface_period: Option<Period>,
}

impl PostgresStore {
    pub fn connect(url: &str) -> Result<Self, PipelineError> {
        let client = Client::connect(url, NoTls)?;
        Ok(Self { client, surface: None, surface_period: None })
    }

    fn insert_statement(present: &[&Quantity]) -> String {
        let mut sql = String::from(
            "SELECT * FROM insert_measurements(CAST($1 AS INTEGER), CAST($2 AS TIMESTAMP), \
             CAST($3 AS REAL), CAST($4 AS DOUBLE PRECISION), CAST($5 AS DOUBLE PRECISION)",
        );
        for (offset, quantity) in present.iter().enumerate() {
            sql.push_str(&format!(
                ", {} => CAST(${} AS {})",
                quantity.id,
                offset + 6,
                quantity.sql_type.sql_name()
            ));
        }
        sql.push(')');
        sql
    }
}

fn quantity_param(sql_type: SqlType, value: Option<f64>) -> Box<dyn ToSql + Sync> {
    match sql_type {
        SqlType::Integer => Box::new(value.map(|v| v.round() as i32)),
        SqlType::Real => Box::new(value.map(|v| v as f32)),
        SqlType::DoublePrecision => Box::new(value),
    }
}

impl MeasurementStoreLike for PostgresStore {
    fn insert_measurement(&mut self, measurement: &Measurement, quantities: &[Quantity]) -> Result<InsertOutcome, PipelineError> {
        // Absent quantities fall back to the procedure's NULL defaults.
        let present: Vec<&Quantity> = quantities
            .iter()
            .filter(|q| measurement.values.contains_key(&q.id))
            .collect();
        let sql = Self::insert_statement(&present);

        let mut params: Vec<Box<dyn ToSql + Sync>> = vec![
            Box::new(measurement.node_id),
            Box::new(measurement.timestamp),
            Box::new(measurement.gps_error as f32),
            Box::new(measurement.longitude),
            Box::new(measurement.latitude),
        ];
        for quantity in &present {
            let value = measurement.values.get(&quantity.id).copied().flatten();
            params.push(quantity_param(quantity.sql_type, value));
        }
        let refs: Vec<&(dyn ToSql + Sync)> = params.iter().map(|p| p.as_ref()).collect();

        match self.client.query(sql.as_str(), &refs) {
            Ok(_) => Ok(InsertOutcome::Inserted),
            Err(e) if e.code() == Some(&SqlState::UNIQUE_VIOLATION) => Ok(InsertOutcome::Duplicate),
            Err(e) => Err(e.into()),
        }
    }

    fn node_ids(&mut self) -> Result<Vec<i32>, PipelineError> {
        let rows = self.client.query("SELECT id FROM node_sensors ORDER BY id", &[])?;
        Ok(rows.iter().map(|row| row.get::<_, i32>(0)).collect())
    }
}

impl AggregationStoreLike for PostgresStore {
    fn call_aggregation(&mut self, function: &str, period: &Period) -> Result<(), PipelineError> {
        let sql = format!(
            "SELECT * FROM {}(from_date => CAST($1 AS TIMESTAMP), to_date => CAST($2 AS TIMESTAMP))",
            function
        );
        self.client.query(sql.as_str(), &[&period.start, &period.end])?;
        Ok(())
    }
}

impl SampleSourceLike for PostgresStore {
    fn count_samples(&mut self, table: &str, period: &Period) -> Result<u64, PipelineError> {
        let sql = format!("SELECT count(*) FROM {} WHERE when_ >= $1 AND when_ < $2", table);
        let row = self.client.query_one(sql.as_str(), &[&period.start, &period.end])?;
        let count: i64 = row.get(0);
        Ok(count.max(0) as u64)
    }

    fn stream_samples(
        &mut self,
        table: &str,
        period: &Period,
        emit: &mut dyn FnMut(GridPoint) -> Result<(), PipelineError>,
    ) -> Result<u64, PipelineError> {
        let sql = format!(
            "SELECT ST_X(long_lat)::float8, ST_Y(long_lat)::float8, value::float8 \
             FROM {} WHERE when_ >= $1 AND when_ < $2",
            table
        );
        let params: [&(dyn ToSql + Sync); 2] = [&period.start, &period.end];
        let mut rows = self.client.query_raw(sql.as_str(), params)?;
        let mut sent = 0;
        while let Some(row) = rows.next()? {
            emit(GridPoint::new(row.get(0), row.get(1), row.get(2)))?;
            sent += 1;
        }
        Ok(sent)
    }
}

impl SurfaceSinkLike for PostgresStore {
    fn begin_surface(&mut self, table: &str, period: &Period) -> Result<(), PipelineError> {
        self.client.batch_execute("BEGIN")?;
        let cleared = self.client.execute(
            format!("DELETE FROM {} WHERE when_ >= $1 AND when_ < $2", table).as_str(),
            &[&period.start, &period.end],
        );
        if let Err(e) = cleared {
            let _ = self.client.batch_execute("ROLLBACK");
            return Err(e.into());
        }
        let statement = self.client.prepare(
            format!(
                "INSERT INTO {} (longLat, value, when_) \
                 VALUES (ST_SetSRID(ST_MakePoint($1, $2), 4326), $3, $4)",
                table
            )
            .as_str(),
        );
        match statement {
            Ok(statement) => {
                self.surface = Some(statement);
                self.surface_period = Some(*period);
                Ok(())
            }
            Err(e) => {
                let _ = self.client.batch_execute("ROLLBACK");
                Err(e.into())
            }
        }
    }

    fn insert_point(&mut self, point: GridPoint) -> Result<(), PipelineError> {
        let (Some(statement), Some(period)) = (self.surface.as_ref(), self.surface_period.as_ref()) else {
            return Err(PipelineError::Database("no surface transaction open".to_string()));
        };
        self.client
            .execute(statement, &[&point.longitude, &point.latitude, &point.value, &period.start])?;
        Ok(())
    }

    fn commit_surface(&mut self) -> Result<(), PipelineError> {
        self.surface = None;
        self.surface_period = None;
        self.client.batch_execute("COMMIT")?;
        Ok(())
    }

    fn rollback_surface(&mut self) -> Result<(), PipelineError> {
        self.surface = None;
        self.surface_period = None;
        self.client.batch_execute("ROLLBACK")?;
        Ok(())
    }
}

impl SurfaceSourceLike for PostgresStore {
    fn load_surface(&mut self, table: &str, period: &Period) -> Result<Vec<f64>, PipelineError> {
        let sql = format!(
            "SELECT value::float8 FROM {} WHERE when_ >= $1 AND when_ < $2 \
             ORDER BY ST_Y(longLat) DESC, ST_X(longLat) ASC",
            table
        );
        let rows = self.client.query(sql.as_str(), &[&period.start, &period.end])?;
        Ok(rows.iter().map(|row| row.get::<_, f64>(0)).collect())
    }

    fn count_surface(&mut self, table: &str, period: &Period) -> Result<u64, PipelineError> {
        let sql = format!("SELECT count(*) FROM {} WHERE when_ >= $1 AND when_ < $2", table);
        let row = self.client.query_one(sql.as_str(), &[&period.start, &period.end])?;
        let count: i64 = row.get(0);
        Ok(count.max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quantity(id: &str, sql_type: SqlType) -> Quantity {
        Quantity {
            id: id.to_string(),
            description: String::new(),
            sql_type,
            wire_index: 6,
            mobile_app: true,
            route_planner: false,
            subscribable: false,
            profile: None,
        }
    }

    #[test]
    fn test_insert_statement_matches_procedure_signature() {
        let pm10 = quantity("pm10", SqlType::Real);
        let no2 = quantity("no2", SqlType::DoublePrecision);
        assert_eq!(
            PostgresStore::insert_statement(&[&pm10, &no2]),
            "SELECT * FROM insert_measurements(CAST($1 AS INTEGER), CAST($2 AS TIMESTAMP), \
             CAST($3 AS REAL), CAST($4 AS DOUBLE PRECISION), CAST($5 AS DOUBLE PRECISION), \
             pm10 => CAST($6 AS REAL), no2 => CAST($7 AS DOUBLE PRECISION))"
        );
    }

    #[test]
    fn test_insert_statement_without_quantities() {
        let sql = PostgresStore::insert_statement(&[]);
        assert!(sql.ends_with("CAST($5 AS DOUBLE PRECISION))"));
        assert!(!sql.contains("$6"));
        assert!(!sql.contains("sequence"));
    }
}
