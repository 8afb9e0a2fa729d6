//! Vendor specific SQL fragments.

use std::sync::Arc;

use crate::DriverSignal;

/// Error code DB2 reports for a duplicate key.
pub const DB2_DUPLICATE_KEY: i64 = -803;

/// Per-database string generation strategy.
pub trait Dialect: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// Pagination suffix for `order`. The suffix references the `:limit`
    /// and `:offset` parameters.
    fn limit_and_offset(&self, order: &str) -> String {
        format!(" ORDER BY {order} LIMIT :limit OFFSET :offset")
    }

    fn quote_identifier(&self, identifier: &str) -> String {
        format!("\"{}\"", identifier.replace('"', "\"\""))
    }

    /// Whether a failed insert or update signals a lost optimistic
    /// concurrency race rather than a storage failure.
    ///
    /// Best effort: vendors report duplicate keys with differing codes and
    /// wording.
    fn is_concurrency_conflict(&self, signal: &DriverSignal) -> bool {
        if signal.code == Some(DB2_DUPLICATE_KEY) {
            return true;
        }
        let message = signal.message.to_lowercase();
        message.contains("duplicate")
            || message.contains("primary key")
            || message.contains("unique constraint")
    }
}

/// `LIMIT`/`OFFSET` pagination with double-quoted identifiers.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnsiDialect;

impl Dialect for AnsiDialect {
    fn name(&self) -> &'static str {
        "ansi"
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlDialect;

impl Dialect for MySqlDialect {
    fn name(&self) -> &'static str {
        "mysql"
    }

    fn quote_identifier(&self, identifier: &str) -> String {
        format!("`{}`", identifier.replace('`', "``"))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OracleDialect;

impl Dialect for OracleDialect {
    fn name(&self) -> &'static str {
        "oracle"
    }

    fn limit_and_offset(&self, order: &str) -> String {
        offset_fetch(order)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SqlServerDialect;

impl Dialect for SqlServerDialect {
    fn name(&self) -> &'static str {
        "sqlserver"
    }

    fn limit_and_offset(&self, order: &str) -> String {
        offset_fetch(order)
    }

    fn quote_identifier(&self, identifier: &str) -> String {
        format!("[{}]", identifier.replace(']', "]]"))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Db2Dialect;

impl Dialect for Db2Dialect {
    fn name(&self) -> &'static str {
        "db2"
    }

    fn limit_and_offset(&self, order: &str) -> String {
        offset_fetch(order)
    }
}

fn offset_fetch(order: &str) -> String {
    format!(" ORDER BY {order} OFFSET :offset ROWS FETCH NEXT :limit ROWS ONLY")
}

/// Resolves a dialect from a vendor name such as `sqlite` or `postgres`.
#[must_use]
pub fn dialect_for_name(name: &str) -> Option<Arc<dyn Dialect>> {
    Some(match name.to_ascii_lowercase().as_str() {
        "ansi" | "sqlite" | "postgres" | "postgresql" | "h2" => Arc::new(AnsiDialect),
        "mysql" | "mariadb" => Arc::new(MySqlDialect),
        "oracle" => Arc::new(OracleDialect),
        "sqlserver" | "mssql" => Arc::new(SqlServerDialect),
        "db2" => Arc::new(Db2Dialect),
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test_log::test]
    fn ansi_pagination_uses_limit_offset() {
        assert_eq!(
            AnsiDialect.limit_and_offset("createdAt ASC"),
            " ORDER BY createdAt ASC LIMIT :limit OFFSET :offset"
        );
    }

    #[test_log::test]
    fn offset_fetch_dialects() {
        for dialect in [
            dialect_for_name("oracle").unwrap(),
            dialect_for_name("sqlserver").unwrap(),
            dialect_for_name("db2").unwrap(),
        ] {
            assert_eq!(
                dialect.limit_and_offset("updatedAt DESC"),
                " ORDER BY updatedAt DESC OFFSET :offset ROWS FETCH NEXT :limit ROWS ONLY"
            );
        }
    }

    #[test_log::test]
    fn quotes_identifiers_per_vendor() {
        assert_eq!(AnsiDialect.quote_identifier("value"), "\"value\"");
        assert_eq!(MySqlDialect.quote_identifier("value"), "`value`");
        assert_eq!(SqlServerDialect.quote_identifier("value"), "[value]");
    }

    #[test_log::test]
    fn resolves_dialect_by_vendor_name() {
        assert_eq!(dialect_for_name("MariaDB").unwrap().name(), "mysql");
        assert_eq!(dialect_for_name("sqlite").unwrap().name(), "ansi");
        assert!(dialect_for_name("cobol").is_none());
    }

    #[test_log::test]
    fn classifies_concurrency_conflicts() {
        let dialect = AnsiDialect;

        assert!(dialect.is_concurrency_conflict(&DriverSignal::new(
            Some(2067),
            "UNIQUE constraint failed: jobrunr_jobs.id"
        )));
        assert!(dialect.is_concurrency_conflict(&DriverSignal::new(
            None,
            "Duplicate entry 'x' for key 'PRIMARY'"
        )));
        assert!(dialect.is_concurrency_conflict(&DriverSignal::new(
            Some(DB2_DUPLICATE_KEY),
            "SQL0803N"
        )));
        assert!(!dialect.is_concurrency_conflict(&DriverSignal::new(
            Some(1),
            "no such table: jobrunr_jobs"
        )));
    }
}
