//! Table accessors: each owns the statements of one managed table.

pub mod background_job_server;
pub mod job;
pub mod metadata;
pub mod recurring_job;

pub use background_job_server::BackgroundJobServerTable;
pub use job::JobTable;
pub use metadata::MetadataTable;
pub use recurring_job::RecurringJobTable;

use crate::models::StateName;

pub const JOBS_TABLE: &str = "jobrunr_jobs";
pub const RECURRING_JOBS_TABLE: &str = "jobrunr_recurring_jobs";
pub const BACKGROUND_JOB_SERVERS_TABLE: &str = "jobrunr_backgroundjobservers";
pub const METADATA_TABLE: &str = "jobrunr_metadata";
pub const JOBS_STATS_VIEW: &str = "jobrunr_jobs_stats";

/// Every table the provider reads or writes.
pub const MANAGED_TABLES: [&str; 4] = [
    JOBS_TABLE,
    RECURRING_JOBS_TABLE,
    BACKGROUND_JOB_SERVERS_TABLE,
    METADATA_TABLE,
];

/// `'A','B'` list of state names for an `in (...)` clause. State names are
/// fixed identifiers, so they are inlined rather than bound.
fn state_in(states: &[StateName]) -> String {
    states
        .iter()
        .map(|x| format!("'{}'", x.as_ref()))
        .collect::<Vec<_>>()
        .join(",")
}
