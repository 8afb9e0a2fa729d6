//! Schema bootstrap for the managed tables.

use jobrunr_sql::SqlEngine;

use crate::models::JobRunrMetadata;
use crate::tables::{MANAGED_TABLES, MetadataTable};
use crate::{SUCCEEDED_JOBS_COUNTER_ID, StorageError};

/// Tables, indexes and the stats view, without table prefix.
pub const CREATE_SCRIPT: &str = include_str!("schema/create.sql");

/// Applies `prefix` to every managed object name of `script`.
#[must_use]
pub fn prefixed(script: &str, prefix: &str) -> String {
    if prefix.is_empty() {
        return script.to_string();
    }
    script.replace("jobrunr_", &format!("{prefix}jobrunr_"))
}

/// Creates missing tables, indexes and the stats view, then seeds the
/// succeeded jobs counter.
///
/// # Errors
///
/// * If any DDL statement fails
/// * If the counter row cannot be written
pub fn create(engine: &SqlEngine) -> Result<(), StorageError> {
    log::debug!("create: creating schema with prefix '{}'", engine.table_prefix());
    engine.execute_script(&prefixed(CREATE_SCRIPT, engine.table_prefix()))?;

    let counter = JobRunrMetadata::new("succeeded-jobs-counter", "cluster", "0");
    debug_assert_eq!(counter.id(), SUCCEEDED_JOBS_COUNTER_ID);

    let metadata = MetadataTable::new(engine);
    match metadata.get(&counter.name, &counter.owner) {
        Ok(_) => Ok(()),
        Err(StorageError::MetadataNotFound { .. }) => match metadata.save(&counter) {
            // another provider seeded it first
            Err(e) if e.is_concurrent_modification() => Ok(()),
            result => result,
        },
        Err(e) => Err(e),
    }
}

/// Checks that every managed table answers a count query.
///
/// # Errors
///
/// * If a table is missing or unreadable
pub fn validate(engine: &SqlEngine) -> Result<(), StorageError> {
    for table in MANAGED_TABLES {
        if let Err(e) = engine
            .sql::<()>(table)
            .select_count(&format!("from {table}"))
        {
            log::error!("validate: table {table} is not usable: {e:?}");
            return Err(e.into());
        }
    }
    Ok(())
}
