//! Wire record parsing.
//!
//! A record is a space-delimited line. The first six fields are fixed (node,
//! sequence, date, time, latitude, longitude); the GPS error and every
//! quantity value sit at configured offsets further along the record.

use crate::quantity::Quantity;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use std::collections::BTreeMap;
use std::fmt;

const NODE_INDEX: usize = 0;
const SEQUENCE_INDEX: usize = 1;
const DATE_INDEX: usize = 2;
const TIME_INDEX: usize = 3;
const LATITUDE_INDEX: usize = 4;
const LONGITUDE_INDEX: usize = 5;

#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub node_id: i32,
    pub sequence: i64,
    pub timestamp: NaiveDateTime,
    pub latitude: f64,
    pub longitude: f64,
    pub gps_error: f64,
    /// Quantity id to value; `None` when the sensor reported a non-finite value.
    pub values: BTreeMap<String, Option<f64>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParseError {
    NotUtf8,
    TooShort { expected: usize, found: usize },
    InvalidField { field: String, value: String },
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::NotUtf8 => write!(f, "payload is not valid UTF-8"),
            ParseError::TooShort { expected, found } => {
                write!(f, "record has {} fields, expected at least {}", found, expected)
            }
            ParseError::InvalidField { field, value } => {
                write!(f, "invalid {} field: {:?}", field, value)
            }
        }
    }
}

impl std::error::Error for ParseError {}

#[derive(Debug, Clone)]
pub struct WireLayout {
    gps_error_index: usize,
    quantities: Vec<(String, usize)>,
    min_fields: usize,
}

impl WireLayout {
    pub fn new(gps_error_index: usize, quantities: &[Quantity]) -> Self {
        let quantities: Vec<(String, usize)> =
            quantities.iter().map(|q| (q.id.clone(), q.wire_index)).collect();
        let highest = quantities
            .iter()
            .map(|(_, index)| *index)
            .chain([gps_error_index, LONGITUDE_INDEX])
            .max()
            .unwrap_or(LONGITUDE_INDEX);
        Self { gps_error_index, quantities, min_fields: highest + 1 }
    }

    pub fn min_fields(&self) -> usize {
        self.min_fields
    }

    pub fn parse(&self, payload: &[u8]) -> Result<Measurement, ParseError> {
        let text = std::str::from_utf8(payload).map_err(|_| ParseError::NotUtf8)?;
        let fields: Vec<&str> = text.split_whitespace().collect();
        if fields.len() < self.min_fields {
            return Err(ParseError::TooShort { expected: self.min_fields, found: fields.len() });
        }

        let node_id = parse_field::<i32>("node", fields[NODE_INDEX])?;
        let sequence = parse_field::<i64>("sequence", fields[SEQUENCE_INDEX])?;
        let date = NaiveDate::parse_from_str(fields[DATE_INDEX], "%Y-%m-%d")
            .map_err(|_| invalid("date", fields[DATE_INDEX]))?;
        let time = parse_time(fields[TIME_INDEX])?;
        let latitude = parse_field::<f64>("latitude", fields[LATITUDE_INDEX])?;
        let longitude = parse_field::<f64>("longitude", fields[LONGITUDE_INDEX])?;
        let gps_error = parse_field::<f64>("gps_error", fields[self.gps_error_index])?;

        let mut values = BTreeMap::new();
        for (id, index) in &self.quantities {
            let value = parse_field::<f64>(id, fields[*index])?;
            values.insert(id.clone(), value.is_finite().then_some(value));
        }

        Ok(Measurement {
            node_id,
            sequence,
            timestamp: date.and_time(time),
            latitude,
            longitude,
            gps_error,
            values,
        })
    }
}

fn parse_time(value: &str) -> Result<NaiveTime, ParseError> {
    let format = if value.contains('.') { "%H:%M:%S%.f" } else { "%H:%M:%S" };
    NaiveTime::parse_from_str(value, format).map_err(|_| invalid("time", value))
}

fn parse_field<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ParseError> {
    value.parse::<T>().map_err(|_| invalid(name, value))
}

fn invalid(field: &str, value: &str) -> ParseError {
    ParseError::InvalidField { field: field.to_string(), value: value.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quantity::{LinearProfile, SqlType};

    fn quantity(id: &str, wire_index: usize) -> Quantity {
        Quantity {
            id: id.to_string(),
            description: String::new(),
            sql_type: SqlType::Real,
            wire_index,
            mobile_app: true,
            route_planner: id == "no2",
            subscribable: false,
            profile: (id == "no2").then(|| LinearProfile::new(1.0, 0.0)),
        }
    }

    fn layout() -> WireLayout {
        WireLayout::new(7, &[quantity("pm10", 6), quantity("no2", 8)])
    }

    #[test]
    fn test_parse_valid_record() {
        let m = layout()
            .parse(b"7 42 2024-03-10 12:30:15.250 40.2 -8.4 17.5 3.2 41.0")
            .expect("parse should succeed");
        assert_eq!(m.node_id, 7);
        assert_eq!(m.sequence, 42);
        assert_eq!(m.timestamp.to_string(), "2024-03-10 12:30:15.250");
        assert_eq!(m.latitude, 40.2);
        assert_eq!(m.longitude, -8.4);
        assert_eq!(m.gps_error, 3.2);
        assert_eq!(m.values["pm10"], Some(17.5));
        assert_eq!(m.values["no2"], Some(41.0));
    }

    #[test]
    fn test_time_without_fraction() {
        let m = layout()
            .parse(b"7 43 2024-03-10 12:30:15 40.2 -8.4 17.5 3.2 41.0\n")
            .expect("parse should succeed");
        assert_eq!(m.timestamp.to_string(), "2024-03-10 12:30:15");
    }

    #[test]
    fn test_short_record_is_parse_error() {
        let err = layout().parse(b"7 42 2024-03-10 12:30:15 40.2 -8.4").unwrap_err();
        assert_eq!(err, ParseError::TooShort { expected: 9, found: 6 });
    }

    #[test]
    fn test_bad_field_is_parse_error() {
        let err = layout()
            .parse(b"seven 42 2024-03-10 12:30:15 40.2 -8.4 17.5 3.2 41.0")
            .unwrap_err();
        assert!(matches!(err, ParseError::InvalidField { ref field, .. } if field == "node"));
        assert!(layout().parse(&[0xff, 0xfe]).is_err());
    }

    #[test]
    fn test_non_finite_value_is_null() {
        let m = layout()
            .parse(b"7 44 2024-03-10 12:30:15 40.2 -8.4 nan 3.2 41.0")
            .expect("parse should succeed");
        assert_eq!(m.values["pm10"], None);
    }

    #[test]
    fn test_min_fields_covers_gps_error_offset() {
        assert_eq!(WireLayout::new(19, &[quantity("pm10", 6)]).min_fields(), 20);
    }
}
