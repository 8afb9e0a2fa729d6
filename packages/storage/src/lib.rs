//! SQL backed storage for background jobs.
//!
//! [`SqlStorageProvider`] composes one table accessor per managed table on
//! top of a shared [`SqlEngine`](jobrunr_sql::SqlEngine) and adds aggregate
//! reads, the cluster-wide succeeded-jobs counter and rate limited change
//! notifications.
//!
//! Writes to jobs are version checked. A save that lost a race with another
//! writer fails with [`StorageError::ConcurrentJobModification`] and is
//! never retried here.
//!
//! # Example
//!
//! ```rust,ignore
//! let source = RusqliteConnectionSource::open("jobrunr.db", 5, DEFAULT_BUSY_TIMEOUT)?;
//! let provider = SqlStorageProvider::new(
//!     Arc::new(source),
//!     Arc::new(AnsiDialect),
//!     StorageProviderConfig::from_env()?,
//! )?;
//!
//! let job = provider.save(Job::new(JobDetails::new("org.example.Mailer", "send")))?;
//! ```

#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

pub mod config;
pub mod listeners;
pub mod mapper;
pub mod models;
pub mod provider;
pub mod schema;
pub mod tables;

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use jobrunr_sql::{DatabaseError, RowError, SqlError};
use thiserror::Error;
use uuid::Uuid;

pub use config::{DatabaseOptions, StorageProviderConfig};
pub use listeners::{ChangeListener, JobStatsChangeListener, MetadataChangeListener};
pub use models::{
    BackgroundJobServerStatus, Job, JobDetails, JobRunrMetadata, JobStats, Page, PageRequest,
    RecurringJob, StateName,
};
pub use provider::SqlStorageProvider;

/// Metadata row holding the all-time succeeded jobs count of the cluster.
pub const SUCCEEDED_JOBS_COUNTER_ID: &str = "succeeded-jobs-counter-cluster";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Job {0} not found")]
    JobNotFound(Uuid),
    #[error("Metadata {name} of {owner} not found")]
    MetadataNotFound { name: String, owner: String },
    /// The jobs as they were before the failed save
    #[error("Concurrent modification of {} job(s)", .0.len())]
    ConcurrentJobModification(Vec<Job>),
    #[error("Concurrent modification: {0}")]
    ConcurrentModification(String),
    #[error("Background job server {0} timed out")]
    ServerTimedOut(Uuid),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Invalid page request: {0}")]
    InvalidPageRequest(String),
    /// A defect in a statement or its bindings
    #[error("Programmer error: {0}")]
    Programmer(String),
    #[error(transparent)]
    Row(#[from] RowError),
    #[error(transparent)]
    Sql(#[from] DatabaseError),
}

impl StorageError {
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::JobNotFound(_) | Self::MetadataNotFound { .. })
    }

    #[must_use]
    pub const fn is_concurrent_modification(&self) -> bool {
        matches!(
            self,
            Self::ConcurrentJobModification(_) | Self::ConcurrentModification(_)
        )
    }
}

impl<T: std::fmt::Debug> From<SqlError<T>> for StorageError {
    fn from(value: SqlError<T>) -> Self {
        match value {
            SqlError::UnknownParameter(name) => Self::Programmer(format!("Unknown parameter '{name}'")),
            SqlError::ResultSizeMismatch { expected, actual } => Self::Programmer(format!(
                "Could not insert or update all objects: expected {expected} results, got {actual}"
            )),
            SqlError::ConcurrentModification(conflict) => {
                log::debug!("Concurrent modification: {conflict:?}");
                Self::ConcurrentModification(conflict.to_string())
            }
            SqlError::Row(e) => Self::Row(e),
            SqlError::Database(e) => Self::Sql(e),
        }
    }
}

/// Persistence contract of the job scheduler.
#[allow(clippy::missing_errors_doc)]
pub trait StorageProvider: Send + Sync {
    fn add_change_listener(&self, listener: ChangeListener);

    /// Removes a listener previously added, compared by identity.
    fn remove_change_listener(&self, listener: &ChangeListener);

    fn announce_background_job_server(
        &self,
        status: &BackgroundJobServerStatus,
    ) -> Result<(), StorageError>;

    /// Records a heartbeat and returns whether the server should keep
    /// running.
    ///
    /// # Errors
    ///
    /// * [`StorageError::ServerTimedOut`] if the server was already removed
    fn signal_background_job_server_alive(
        &self,
        status: &BackgroundJobServerStatus,
    ) -> Result<bool, StorageError>;

    fn signal_background_job_server_stopped(
        &self,
        status: &BackgroundJobServerStatus,
    ) -> Result<(), StorageError>;

    /// Every announced server, oldest first.
    fn get_background_job_servers(&self) -> Result<Vec<BackgroundJobServerStatus>, StorageError>;

    fn get_longest_running_background_job_server_id(&self) -> Result<Option<Uuid>, StorageError>;

    fn remove_timed_out_background_job_servers(
        &self,
        heartbeat_older_than: DateTime<Utc>,
    ) -> Result<u64, StorageError>;

    fn save_metadata(&self, metadata: &JobRunrMetadata) -> Result<(), StorageError>;

    fn get_metadata(&self, name: &str) -> Result<Vec<JobRunrMetadata>, StorageError>;

    /// # Errors
    ///
    /// * [`StorageError::MetadataNotFound`] if no such record exists
    fn get_metadata_by_owner(&self, name: &str, owner: &str)
    -> Result<JobRunrMetadata, StorageError>;

    fn delete_metadata(&self, name: &str) -> Result<u64, StorageError>;

    /// # Errors
    ///
    /// * [`StorageError::JobNotFound`] if no such job exists
    fn get_job_by_id(&self, id: Uuid) -> Result<Job, StorageError>;

    /// Inserts a new job or updates an existing one, returning it with its
    /// new version.
    ///
    /// # Errors
    ///
    /// * [`StorageError::ConcurrentJobModification`] if another writer saved
    ///   the job first
    fn save(&self, job: Job) -> Result<Job, StorageError>;

    /// Saves every job, new and existing, in at most two batches.
    ///
    /// # Errors
    ///
    /// * [`StorageError::ConcurrentJobModification`] if any job of a batch
    ///   lost a race
    fn save_all(&self, jobs: Vec<Job>) -> Result<Vec<Job>, StorageError>;

    fn delete_permanently(&self, id: Uuid) -> Result<u64, StorageError>;

    fn get_jobs(&self, state: StateName, page: &PageRequest) -> Result<Vec<Job>, StorageError>;

    fn get_jobs_updated_before(
        &self,
        state: StateName,
        updated_before: DateTime<Utc>,
        page: &PageRequest,
    ) -> Result<Vec<Job>, StorageError>;

    fn get_scheduled_jobs(
        &self,
        scheduled_before: DateTime<Utc>,
        page: &PageRequest,
    ) -> Result<Vec<Job>, StorageError>;

    fn count_jobs(&self, state: StateName) -> Result<u64, StorageError>;

    /// Rows are only fetched when the state holds at least one job.
    fn get_job_page(&self, state: StateName, page: &PageRequest) -> Result<Page<Job>, StorageError>;

    fn delete_jobs_permanently(
        &self,
        state: StateName,
        updated_before: DateTime<Utc>,
    ) -> Result<u64, StorageError>;

    fn get_distinct_job_signatures(&self, states: &[StateName]) -> Result<BTreeSet<String>, StorageError>;

    fn exists(&self, details: &JobDetails, states: &[StateName]) -> Result<bool, StorageError>;

    fn recurring_job_exists(
        &self,
        recurring_job_id: &str,
        states: &[StateName],
    ) -> Result<bool, StorageError>;

    fn save_recurring_job(&self, job: RecurringJob) -> Result<RecurringJob, StorageError>;

    fn get_recurring_jobs(&self) -> Result<Vec<RecurringJob>, StorageError>;

    fn delete_recurring_job(&self, id: &str) -> Result<u64, StorageError>;

    /// The summary row of the stats view, or all zeros when there is none.
    fn get_job_stats(&self) -> Result<JobStats, StorageError>;

    /// Adds `amount` to the cluster-wide succeeded jobs counter.
    fn publish_total_amount_of_succeeded_jobs(&self, amount: i32) -> Result<(), StorageError>;
}
