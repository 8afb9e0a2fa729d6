//! Storage provider configuration.

use std::str::FromStr;
use std::time::Duration;

use strum_macros::{AsRefStr, EnumString};
use thiserror::Error;

pub const TABLE_PREFIX_ENV: &str = "JOBRUNR_TABLE_PREFIX";
pub const DATABASE_OPTIONS_ENV: &str = "JOBRUNR_DATABASE_OPTIONS";
pub const CHANGE_NOTIFICATION_INTERVAL_ENV: &str = "JOBRUNR_CHANGE_NOTIFICATION_INTERVAL_MS";

pub const DEFAULT_CHANGE_NOTIFICATION_INTERVAL: Duration = Duration::from_secs(1);

/// What to do with the schema when the provider starts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, EnumString, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum DatabaseOptions {
    /// Create missing tables, indexes and views
    #[default]
    Create,
    /// Only check that every managed table is reachable
    SkipCreate,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid {name} value '{value}'")]
    InvalidValue { name: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageProviderConfig {
    pub table_prefix: Option<String>,
    pub database_options: DatabaseOptions,
    /// Minimum time between two notifications of the same listener kind
    pub change_notification_interval: Duration,
}

impl Default for StorageProviderConfig {
    fn default() -> Self {
        Self {
            table_prefix: None,
            database_options: DatabaseOptions::default(),
            change_notification_interval: DEFAULT_CHANGE_NOTIFICATION_INTERVAL,
        }
    }
}

impl StorageProviderConfig {
    #[must_use]
    pub fn with_table_prefix(mut self, table_prefix: impl Into<String>) -> Self {
        let table_prefix = table_prefix.into();
        self.table_prefix = if table_prefix.is_empty() {
            None
        } else {
            Some(table_prefix)
        };
        self
    }

    #[must_use]
    pub const fn with_database_options(mut self, database_options: DatabaseOptions) -> Self {
        self.database_options = database_options;
        self
    }

    #[must_use]
    pub const fn with_change_notification_interval(mut self, interval: Duration) -> Self {
        self.change_notification_interval = interval;
        self
    }

    /// Reads the configuration from the process environment. Unset
    /// variables keep their defaults.
    ///
    /// # Errors
    ///
    /// * If a variable is set to an invalid value
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads the configuration through `lookup`, which maps a variable name
    /// to its value.
    ///
    /// # Errors
    ///
    /// * If a variable is set to an invalid value
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(prefix) = lookup(TABLE_PREFIX_ENV) {
            config = config.with_table_prefix(prefix.trim());
        }

        if let Some(value) = lookup(DATABASE_OPTIONS_ENV) {
            config.database_options = DatabaseOptions::from_str(&value.trim().to_lowercase())
                .map_err(|_| ConfigError::InvalidValue {
                    name: DATABASE_OPTIONS_ENV,
                    value: value.clone(),
                })?;
        }

        if let Some(value) = lookup(CHANGE_NOTIFICATION_INTERVAL_ENV) {
            let millis = value
                .trim()
                .parse::<u64>()
                .ok()
                .filter(|x| *x > 0)
                .ok_or_else(|| ConfigError::InvalidValue {
                    name: CHANGE_NOTIFICATION_INTERVAL_ENV,
                    value: value.clone(),
                })?;
            config.change_notification_interval = Duration::from_millis(millis);
        }

        log::debug!("from_lookup: {config:?}");

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use pretty_assertions::assert_eq;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect::<BTreeMap<_, _>>();
        move |name| vars.get(name).cloned()
    }

    #[test_log::test]
    fn unset_variables_keep_defaults() {
        assert_eq!(
            StorageProviderConfig::from_lookup(lookup(&[])).unwrap(),
            StorageProviderConfig::default()
        );
    }

    #[test_log::test]
    fn reads_every_variable() {
        let config = StorageProviderConfig::from_lookup(lookup(&[
            (TABLE_PREFIX_ENV, "myapp_"),
            (DATABASE_OPTIONS_ENV, "SKIP_CREATE"),
            (CHANGE_NOTIFICATION_INTERVAL_ENV, "250"),
        ]))
        .unwrap();

        assert_eq!(
            config,
            StorageProviderConfig::default()
                .with_table_prefix("myapp_")
                .with_database_options(DatabaseOptions::SkipCreate)
                .with_change_notification_interval(Duration::from_millis(250))
        );
    }

    #[test_log::test]
    fn empty_prefix_means_no_prefix() {
        let config =
            StorageProviderConfig::from_lookup(lookup(&[(TABLE_PREFIX_ENV, "")])).unwrap();

        assert_eq!(config.table_prefix, None);
    }

    #[test_log::test]
    fn rejects_invalid_values() {
        assert_eq!(
            StorageProviderConfig::from_lookup(lookup(&[(DATABASE_OPTIONS_ENV, "drop")])),
            Err(ConfigError::InvalidValue {
                name: DATABASE_OPTIONS_ENV,
                value: "drop".into(),
            })
        );
        assert!(
            StorageProviderConfig::from_lookup(lookup(&[(CHANGE_NOTIFICATION_INTERVAL_ENV, "0")]))
                .is_err()
        );
        assert!(
            StorageProviderConfig::from_lookup(lookup(&[(
                CHANGE_NOTIFICATION_INTERVAL_ENV,
                "soon"
            )]))
            .is_err()
        );
    }
}
