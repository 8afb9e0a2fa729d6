//! Result rows with typed column accessors.

use chrono::{DateTime, NaiveDateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::DatabaseValue;

const TIMESTAMP_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RowError {
    #[error("Column '{0}' not found")]
    MissingColumn(String),
    #[error("Column '{column}' could not be read as {target}: {value}")]
    Conversion {
        column: String,
        target: &'static str,
        value: String,
    },
}

/// One materialized row of a result cursor.
///
/// Column lookup by name ignores ASCII case, so dialects that upper-case
/// unquoted aliases still resolve camel-cased column names.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub columns: Vec<(String, DatabaseValue)>,
}

impl Row {
    #[must_use]
    pub fn get(&self, column_name: &str) -> Option<&DatabaseValue> {
        self.columns
            .iter()
            .find(|c| c.0.eq_ignore_ascii_case(column_name))
            .map(|c| &c.1)
    }

    #[must_use]
    pub fn get_index(&self, index: usize) -> Option<&DatabaseValue> {
        self.columns.get(index).map(|c| &c.1)
    }

    fn value(&self, column: &str) -> Result<&DatabaseValue, RowError> {
        self.get(column)
            .ok_or_else(|| RowError::MissingColumn(column.to_string()))
    }

    /// # Errors
    ///
    /// * If the column is absent, null or not an integer
    pub fn as_long(&self, column: &str) -> Result<i64, RowError> {
        to_long(column, self.value(column)?)
    }

    /// Reads the column at `index`, e.g. the result of `count(*)`.
    ///
    /// # Errors
    ///
    /// * If the row has no such column or it is not an integer
    pub fn as_long_at(&self, index: usize) -> Result<i64, RowError> {
        let column = index.to_string();
        let value = self
            .get_index(index)
            .ok_or_else(|| RowError::MissingColumn(column.clone()))?;
        to_long(&column, value)
    }

    /// # Errors
    ///
    /// * If the column is absent, null, not an integer or out of `i32` range
    pub fn as_int(&self, column: &str) -> Result<i32, RowError> {
        let value = self.as_long(column)?;
        i32::try_from(value).map_err(|_| conversion(column, "i32", &DatabaseValue::Int64(value)))
    }

    /// # Errors
    ///
    /// * If the column is absent, null or not numeric
    pub fn as_double(&self, column: &str) -> Result<f64, RowError> {
        match self.value(column)? {
            DatabaseValue::Real64(value) => Ok(*value),
            #[allow(clippy::cast_precision_loss)]
            DatabaseValue::Int64(value) => Ok(*value as f64),
            DatabaseValue::Int32(value) => Ok(f64::from(*value)),
            DatabaseValue::String(value) => value
                .trim()
                .parse()
                .map_err(|_| conversion(column, "f64", &DatabaseValue::String(value.clone()))),
            other => Err(conversion(column, "f64", other)),
        }
    }

    /// Reads a boolean stored as `1`/`0`, a native boolean or `"true"`/`"false"`.
    ///
    /// # Errors
    ///
    /// * If the column is absent, null or not a boolean representation
    pub fn as_bool(&self, column: &str) -> Result<bool, RowError> {
        match self.value(column)? {
            DatabaseValue::Bool(value) => Ok(*value),
            DatabaseValue::Int64(value) => Ok(*value != 0),
            DatabaseValue::Int32(value) => Ok(*value != 0),
            DatabaseValue::String(value) => match value.trim() {
                "1" | "true" | "TRUE" => Ok(true),
                "0" | "false" | "FALSE" => Ok(false),
                _ => Err(conversion(column, "bool", &DatabaseValue::String(value.clone()))),
            },
            other => Err(conversion(column, "bool", other)),
        }
    }

    /// # Errors
    ///
    /// * If the column is absent, null or not text
    pub fn as_string(&self, column: &str) -> Result<String, RowError> {
        self.as_optional_string(column)?
            .ok_or_else(|| conversion(column, "String", &DatabaseValue::Null))
    }

    /// # Errors
    ///
    /// * If the column is absent or holds a non-text value
    pub fn as_optional_string(&self, column: &str) -> Result<Option<String>, RowError> {
        match self.value(column)? {
            DatabaseValue::Null => Ok(None),
            DatabaseValue::String(value) | DatabaseValue::Enum(value) => Ok(Some(value.clone())),
            DatabaseValue::Uuid(value) => Ok(Some(value.to_string())),
            other => Err(conversion(column, "String", other)),
        }
    }

    /// # Errors
    ///
    /// * If the column is absent, null or not a valid UUID
    pub fn as_uuid(&self, column: &str) -> Result<Uuid, RowError> {
        match self.value(column)? {
            DatabaseValue::Uuid(value) => Ok(*value),
            DatabaseValue::String(value) => Uuid::parse_str(value.trim())
                .map_err(|_| conversion(column, "Uuid", &DatabaseValue::String(value.clone()))),
            other => Err(conversion(column, "Uuid", other)),
        }
    }

    /// # Errors
    ///
    /// * If the column is absent, null or not a timestamp
    pub fn as_instant(&self, column: &str) -> Result<DateTime<Utc>, RowError> {
        self.as_optional_instant(column)?
            .ok_or_else(|| conversion(column, "DateTime<Utc>", &DatabaseValue::Null))
    }

    /// # Errors
    ///
    /// * If the column is absent or holds a value that is not a timestamp
    pub fn as_optional_instant(&self, column: &str) -> Result<Option<DateTime<Utc>>, RowError> {
        match self.value(column)? {
            DatabaseValue::Null => Ok(None),
            DatabaseValue::Instant(value) => Ok(Some(*value)),
            DatabaseValue::String(value) => parse_timestamp(value)
                .map(Some)
                .ok_or_else(|| conversion(column, "DateTime<Utc>", &DatabaseValue::String(value.clone()))),
            other => Err(conversion(column, "DateTime<Utc>", other)),
        }
    }
}

fn to_long(column: &str, value: &DatabaseValue) -> Result<i64, RowError> {
    match value {
        DatabaseValue::Int64(value) => Ok(*value),
        DatabaseValue::Int32(value) => Ok(i64::from(*value)),
        #[allow(clippy::cast_possible_truncation)]
        DatabaseValue::Real64(real) if real.fract() == 0.0 => Ok(*real as i64),
        DatabaseValue::String(text) => {
            let trimmed = text.trim();
            trimmed
                .parse::<i64>()
                .ok()
                .or_else(|| {
                    // numeric columns of some dialects come back as decimal text
                    trimmed
                        .parse::<f64>()
                        .ok()
                        .filter(|x| x.fract() == 0.0)
                        .map(|x| {
                            #[allow(clippy::cast_possible_truncation)]
                            let x = x as i64;
                            x
                        })
                })
                .ok_or_else(|| conversion(column, "i64", value))
        }
        other => Err(conversion(column, "i64", other)),
    }
}

fn conversion(column: &str, target: &'static str, value: &DatabaseValue) -> RowError {
    RowError::Conversion {
        column: column.to_string(),
        target,
        value: format!("{value:?}"),
    }
}

/// Parses the timestamp text written by the engine, or RFC 3339.
#[must_use]
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();

    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }

    TIMESTAMP_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone as _;
    use pretty_assertions::assert_eq;

    use super::*;

    fn row() -> Row {
        Row {
            columns: vec![
                ("total".into(), DatabaseValue::Int64(12)),
                ("allTimeSucceeded".into(), DatabaseValue::String("40".into())),
                ("running".into(), DatabaseValue::Int64(1)),
                ("load".into(), DatabaseValue::Real64(0.5)),
                (
                    "updatedAt".into(),
                    DatabaseValue::String("2024-03-01 10:15:30.250000".into()),
                ),
                ("scheduledAt".into(), DatabaseValue::Null),
                ("name".into(), DatabaseValue::String("counter".into())),
            ],
        }
    }

    #[test_log::test]
    fn reads_typed_values_by_name() {
        let row = row();

        assert_eq!(row.as_long("total"), Ok(12));
        assert_eq!(row.as_int("total"), Ok(12));
        assert_eq!(row.as_bool("running"), Ok(true));
        assert_eq!(row.as_double("load"), Ok(0.5));
        assert_eq!(row.as_string("name"), Ok("counter".to_string()));
        assert_eq!(row.as_optional_instant("scheduledAt"), Ok(None));
        assert_eq!(
            row.as_instant("updatedAt"),
            Ok(Utc.with_ymd_and_hms(2024, 3, 1, 10, 15, 30).unwrap()
                + chrono::Duration::milliseconds(250))
        );
    }

    #[test_log::test]
    fn column_lookup_ignores_case() {
        let row = row();

        assert_eq!(row.as_long("ALLTIMESUCCEEDED"), Ok(40));
        assert_eq!(row.as_long("TOTAL"), Ok(12));
    }

    #[test_log::test]
    fn missing_column_is_a_hard_failure() {
        assert_eq!(
            row().as_long("deleted"),
            Err(RowError::MissingColumn("deleted".into()))
        );
    }

    #[test_log::test]
    fn non_coercible_values_fail() {
        let row = row();

        assert!(matches!(
            row.as_long("name"),
            Err(RowError::Conversion { target: "i64", .. })
        ));
        assert!(matches!(
            row.as_string("scheduledAt"),
            Err(RowError::Conversion { .. })
        ));
    }

    #[test_log::test]
    fn decimal_text_reads_as_long() {
        let row = Row {
            columns: vec![("value".into(), DatabaseValue::String("15.0".into()))],
        };

        assert_eq!(row.as_long("value"), Ok(15));
    }

    #[test_log::test]
    fn parses_rfc3339_timestamps() {
        assert_eq!(
            parse_timestamp("2024-03-01T10:15:30Z"),
            Some(Utc.with_ymd_and_hms(2024, 3, 1, 10, 15, 30).unwrap())
        );
        assert_eq!(parse_timestamp("not a date"), None);
    }
}
