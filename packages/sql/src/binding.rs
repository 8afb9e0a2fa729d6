//! Parameter resolution and bind-time coercion.
//!
//! A [`Parameters`] set maps placeholder names to values for one call. Each
//! name of a compiled statement resolves, in order, from an explicit value, a
//! derived function of the subject entity, a field of the entity exposed
//! through [`BindFields`], or the reserved `previousVersion` name.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::DatabaseValue;

/// Name resolved as the entity version minus one.
pub const PREVIOUS_VERSION: &str = "previousVersion";

/// Text layout of bound timestamps. Fixed-width so that text columns order
/// chronologically.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// A value coerced to one of the types every supported driver can bind.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Integer(i64),
    Real(f64),
    Text(String),
    /// A timestamp, also used for untyped nulls
    Timestamp(Option<DateTime<Utc>>),
}

impl SqlParam {
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Timestamp(None))
    }

    /// Timestamp rendered as [`TIMESTAMP_FORMAT`] text.
    #[must_use]
    pub fn timestamp_text(value: &DateTime<Utc>) -> String {
        value.format(TIMESTAMP_FORMAT).to_string()
    }
}

impl From<&DatabaseValue> for SqlParam {
    fn from(value: &DatabaseValue) -> Self {
        match value {
            DatabaseValue::Null => Self::Timestamp(None),
            DatabaseValue::String(value) | DatabaseValue::Enum(value) => Self::Text(value.clone()),
            DatabaseValue::Bool(value) => Self::Integer(i64::from(*value)),
            DatabaseValue::Int32(value) => Self::Integer(i64::from(*value)),
            DatabaseValue::Int64(value) => Self::Integer(*value),
            DatabaseValue::Real64(value) => Self::Real(*value),
            DatabaseValue::Instant(value) => Self::Timestamp(Some(*value)),
            DatabaseValue::Duration(value) => Self::Text(format_duration(*value)),
            DatabaseValue::Uuid(value) => Self::Text(value.to_string()),
        }
    }
}

impl From<DatabaseValue> for SqlParam {
    fn from(value: DatabaseValue) -> Self {
        (&value).into()
    }
}

/// Formats a duration in the ISO-8601 `PT#H#M#.#S` form, `PT0S` when zero.
#[must_use]
pub fn format_duration(duration: std::time::Duration) -> String {
    let total_seconds = duration.as_secs();
    let nanos = duration.subsec_nanos();

    if total_seconds == 0 && nanos == 0 {
        return "PT0S".to_string();
    }

    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    let mut text = String::from("PT");
    if hours != 0 {
        let _ = write!(text, "{hours}H");
    }
    if minutes != 0 {
        let _ = write!(text, "{minutes}M");
    }
    if seconds == 0 && nanos == 0 {
        return text;
    }
    let _ = write!(text, "{seconds}");
    if nanos > 0 {
        let fraction = format!("{nanos:09}");
        let _ = write!(text, ".{}", fraction.trim_end_matches('0'));
    }
    text.push('S');

    text
}

/// Exposes the bindable fields of an entity by parameter name.
///
/// Table accessors implement this for the entities they persist so templates
/// can reference entity fields directly, e.g. `:jobSignature`.
pub trait BindFields {
    /// Value of the field named `name`, or `None` when the entity has no
    /// such field.
    fn bind_field(&self, name: &str) -> Option<DatabaseValue>;
}

impl BindFields for () {
    fn bind_field(&self, _name: &str) -> Option<DatabaseValue> {
        None
    }
}

/// A placeholder name that no binding source could resolve.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Unknown parameter '{0}'")]
pub struct UnknownParameter(pub String);

type Derived<'a, T> = Box<dyn Fn(&T) -> DatabaseValue + Send + Sync + 'a>;
type Version<'a, T> = Box<dyn Fn(&T) -> i64 + Send + Sync + 'a>;

/// Bindings for one call. Discarded after the call completes.
pub struct Parameters<'a, T> {
    explicit: BTreeMap<String, DatabaseValue>,
    derived: BTreeMap<String, Derived<'a, T>>,
    version: Option<Version<'a, T>>,
}

impl<T> Default for Parameters<'_, T> {
    fn default() -> Self {
        Self {
            explicit: BTreeMap::new(),
            derived: BTreeMap::new(),
            version: None,
        }
    }
}

impl<T> std::fmt::Debug for Parameters<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Parameters")
            .field("explicit", &self.explicit)
            .field("derived", &self.derived.keys().collect::<Vec<_>>())
            .field("version", &self.version.is_some())
            .finish()
    }
}

impl<'a, T: BindFields> Parameters<'a, T> {
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<DatabaseValue>) {
        self.explicit.insert(name.into(), value.into());
    }

    pub fn set_fn(
        &mut self,
        name: impl Into<String>,
        derive: impl Fn(&T) -> DatabaseValue + Send + Sync + 'a,
    ) {
        self.derived.insert(name.into(), Box::new(derive));
    }

    pub fn set_version(&mut self, version: impl Fn(&T) -> i64 + Send + Sync + 'a) {
        self.version = Some(Box::new(version));
    }

    /// Resolves one name against the bindings and the optional entity.
    ///
    /// # Errors
    ///
    /// * If no binding source knows the name
    pub fn resolve(&self, name: &str, entity: Option<&T>) -> Result<DatabaseValue, UnknownParameter> {
        if let Some(value) = self.explicit.get(name) {
            return Ok(value.clone());
        }

        if let Some(entity) = entity {
            if let Some(derive) = self.derived.get(name) {
                return Ok(derive(entity));
            }
            if let Some(value) = entity.bind_field(name) {
                return Ok(value);
            }
            if name == PREVIOUS_VERSION {
                let version = match &self.version {
                    Some(version) => Some(version(entity)),
                    None => entity.bind_field("version").and_then(|x| x.as_i64()),
                };
                if let Some(version) = version {
                    return Ok(DatabaseValue::Int64(version - 1));
                }
            }
        }

        Err(UnknownParameter(name.to_string()))
    }

    /// Resolves every name in order and coerces the values for binding.
    /// Repeated names resolve to the same value at every position.
    ///
    /// # Errors
    ///
    /// * If any name is unknown
    pub fn bind(&self, names: &[String], entity: Option<&T>) -> Result<Vec<SqlParam>, UnknownParameter> {
        names
            .iter()
            .map(|name| self.resolve(name, entity).map(SqlParam::from))
            .collect()
    }
}
