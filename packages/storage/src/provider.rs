use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use jobrunr_sql::{ConnectionSource, Dialect, Row, RowError, SqlEngine};
use uuid::Uuid;

use crate::config::{DatabaseOptions, StorageProviderConfig};
use crate::listeners::{ChangeListener, ChangeNotifier};
use crate::mapper::JobMapper;
use crate::models::{
    BackgroundJobServerStatus, Job, JobDetails, JobRunrMetadata, JobStats, Page, PageRequest,
    RecurringJob, StateName,
};
use crate::tables::{
    BackgroundJobServerTable, JOBS_STATS_VIEW, JobTable, METADATA_TABLE, MetadataTable,
    RecurringJobTable,
};
use crate::{SUCCEEDED_JOBS_COUNTER_ID, StorageError, StorageProvider, schema};

const INCREMENT_SUCCEEDED_JOBS_COUNTER: &str = "jobrunr_metadata set value = cast((cast(cast(value as char(10)) as decimal) + :amount) as char(10)) where id = :id";

fn to_job_stats(row: &Row) -> Result<JobStats, RowError> {
    Ok(JobStats {
        time_stamp: Utc::now(),
        total: row.as_long("total")?,
        awaiting: row.as_long("awaiting")?,
        scheduled: row.as_long("scheduled")?,
        enqueued: row.as_long("enqueued")?,
        processing: row.as_long("processing")?,
        failed: row.as_long("failed")?,
        succeeded: row.as_long("succeeded")?,
        all_time_succeeded: row.as_long("allTimeSucceeded")?,
        deleted: row.as_long("deleted")?,
        recurring_jobs: row.as_int("nbrOfRecurringJobs")?,
        background_job_servers: row.as_int("nbrOfBackgroundJobServers")?,
    })
}

/// [`StorageProvider`] over any relational database reachable through a
/// [`ConnectionSource`].
#[derive(Debug)]
pub struct SqlStorageProvider {
    engine: SqlEngine,
    mapper: JobMapper,
    notifier: ChangeNotifier,
}

impl SqlStorageProvider {
    /// Builds the provider and prepares the schema according to
    /// `config.database_options`.
    ///
    /// # Errors
    ///
    /// * If the schema cannot be created
    /// * If a managed table is missing with [`DatabaseOptions::SkipCreate`]
    pub fn new(
        source: Arc<dyn ConnectionSource>,
        dialect: Arc<dyn Dialect>,
        config: StorageProviderConfig,
    ) -> Result<Self, StorageError> {
        log::debug!(
            "new: dialect={} table_prefix={:?} database_options={}",
            dialect.name(),
            config.table_prefix,
            config.database_options.as_ref(),
        );

        let engine = SqlEngine::new(source, dialect, config.table_prefix.as_deref());

        match config.database_options {
            DatabaseOptions::Create => schema::create(&engine)?,
            DatabaseOptions::SkipCreate => schema::validate(&engine)?,
        }

        Ok(Self {
            engine,
            mapper: JobMapper,
            notifier: ChangeNotifier::new(config.change_notification_interval),
        })
    }

    #[must_use]
    pub const fn engine(&self) -> &SqlEngine {
        &self.engine
    }

    #[must_use]
    pub const fn job_table(&self) -> JobTable<'_> {
        JobTable::new(&self.engine, self.mapper)
    }

    #[must_use]
    pub const fn recurring_job_table(&self) -> RecurringJobTable<'_> {
        RecurringJobTable::new(&self.engine, self.mapper)
    }

    #[must_use]
    pub const fn background_job_server_table(&self) -> BackgroundJobServerTable<'_> {
        BackgroundJobServerTable::new(&self.engine)
    }

    #[must_use]
    pub const fn metadata_table(&self) -> MetadataTable<'_> {
        MetadataTable::new(&self.engine)
    }

    fn notify_job_stats_listeners(&self) {
        self.notifier.notify_job_stats(|| self.get_job_stats());
    }

    fn notify_metadata_listeners(&self) {
        self.notifier
            .notify_metadata(|name| self.metadata_table().get_all(name));
    }
}

impl StorageProvider for SqlStorageProvider {
    fn add_change_listener(&self, listener: ChangeListener) {
        self.notifier.add(listener);
    }

    fn remove_change_listener(&self, listener: &ChangeListener) {
        self.notifier.remove(listener);
    }

    fn announce_background_job_server(
        &self,
        status: &BackgroundJobServerStatus,
    ) -> Result<(), StorageError> {
        self.background_job_server_table().announce(status)
    }

    fn signal_background_job_server_alive(
        &self,
        status: &BackgroundJobServerStatus,
    ) -> Result<bool, StorageError> {
        self.background_job_server_table().signal_server_alive(status)
    }

    fn signal_background_job_server_stopped(
        &self,
        status: &BackgroundJobServerStatus,
    ) -> Result<(), StorageError> {
        self.background_job_server_table().signal_server_stopped(status)
    }

    fn get_background_job_servers(&self) -> Result<Vec<BackgroundJobServerStatus>, StorageError> {
        self.background_job_server_table().get_all()
    }

    fn get_longest_running_background_job_server_id(&self) -> Result<Option<Uuid>, StorageError> {
        self.background_job_server_table()
            .get_longest_running_background_job_server_id()
    }

    fn remove_timed_out_background_job_servers(
        &self,
        heartbeat_older_than: DateTime<Utc>,
    ) -> Result<u64, StorageError> {
        self.background_job_server_table()
            .remove_all_with_last_heartbeat_older_than(heartbeat_older_than)
    }

    fn save_metadata(&self, metadata: &JobRunrMetadata) -> Result<(), StorageError> {
        self.metadata_table().save(metadata)?;
        self.notify_metadata_listeners();
        Ok(())
    }

    fn get_metadata(&self, name: &str) -> Result<Vec<JobRunrMetadata>, StorageError> {
        self.metadata_table().get_all(name)
    }

    fn get_metadata_by_owner(
        &self,
        name: &str,
        owner: &str,
    ) -> Result<JobRunrMetadata, StorageError> {
        self.metadata_table().get(name, owner)
    }

    fn delete_metadata(&self, name: &str) -> Result<u64, StorageError> {
        let deleted = self.metadata_table().delete_by_key(name)?;
        if deleted > 0 {
            self.notify_metadata_listeners();
        }
        Ok(deleted)
    }

    fn get_job_by_id(&self, id: Uuid) -> Result<Job, StorageError> {
        self.job_table()
            .select_job_by_id(id)?
            .ok_or(StorageError::JobNotFound(id))
    }

    fn save(&self, job: Job) -> Result<Job, StorageError> {
        let job = self.job_table().save(job)?;
        self.notify_job_stats_listeners();
        Ok(job)
    }

    fn save_all(&self, jobs: Vec<Job>) -> Result<Vec<Job>, StorageError> {
        if jobs.is_empty() {
            return Ok(jobs);
        }

        let jobs = self.job_table().save_all(jobs)?;
        self.notify_job_stats_listeners();
        Ok(jobs)
    }

    fn delete_permanently(&self, id: Uuid) -> Result<u64, StorageError> {
        let deleted = self.job_table().delete_permanently(id)?;
        if deleted > 0 {
            self.notify_job_stats_listeners();
        }
        Ok(deleted)
    }

    fn get_jobs(&self, state: StateName, page: &PageRequest) -> Result<Vec<Job>, StorageError> {
        self.job_table().select_jobs_by_state(state, page)
    }

    fn get_jobs_updated_before(
        &self,
        state: StateName,
        updated_before: DateTime<Utc>,
        page: &PageRequest,
    ) -> Result<Vec<Job>, StorageError> {
        self.job_table()
            .select_jobs_by_state_updated_before(state, updated_before, page)
    }

    fn get_scheduled_jobs(
        &self,
        scheduled_before: DateTime<Utc>,
        page: &PageRequest,
    ) -> Result<Vec<Job>, StorageError> {
        self.job_table()
            .select_jobs_scheduled_before(scheduled_before, page)
    }

    fn count_jobs(&self, state: StateName) -> Result<u64, StorageError> {
        self.job_table().count_jobs(state)
    }

    fn get_job_page(&self, state: StateName, page: &PageRequest) -> Result<Page<Job>, StorageError> {
        let total = self.count_jobs(state)?;
        if total == 0 {
            return Ok(Page::empty(page));
        }

        let jobs = self.get_jobs(state, page)?;
        Ok(Page::new(total, jobs, page))
    }

    fn delete_jobs_permanently(
        &self,
        state: StateName,
        updated_before: DateTime<Utc>,
    ) -> Result<u64, StorageError> {
        let deleted = self
            .job_table()
            .delete_jobs_by_state_and_updated_before(state, updated_before)?;
        if deleted > 0 {
            self.notify_job_stats_listeners();
        }
        Ok(deleted)
    }

    fn get_distinct_job_signatures(
        &self,
        states: &[StateName],
    ) -> Result<BTreeSet<String>, StorageError> {
        self.job_table().get_distinct_job_signatures(states)
    }

    fn exists(&self, details: &JobDetails, states: &[StateName]) -> Result<bool, StorageError> {
        self.job_table().exists(details, states)
    }

    fn recurring_job_exists(
        &self,
        recurring_job_id: &str,
        states: &[StateName],
    ) -> Result<bool, StorageError> {
        self.job_table()
            .recurring_job_exists(recurring_job_id, states)
    }

    fn save_recurring_job(&self, job: RecurringJob) -> Result<RecurringJob, StorageError> {
        self.recurring_job_table().save(job)
    }

    fn get_recurring_jobs(&self) -> Result<Vec<RecurringJob>, StorageError> {
        self.recurring_job_table().select_all()
    }

    fn delete_recurring_job(&self, id: &str) -> Result<u64, StorageError> {
        self.recurring_job_table().delete_by_id(id)
    }

    fn get_job_stats(&self) -> Result<JobStats, StorageError> {
        let stats = self
            .engine
            .sql::<()>(JOBS_STATS_VIEW)
            .with_order_limit_and_offset("total ASC", 1, 0)
            .select_first("* from jobrunr_jobs_stats", to_job_stats)?;

        Ok(stats.unwrap_or_else(JobStats::empty))
    }

    fn publish_total_amount_of_succeeded_jobs(&self, amount: i32) -> Result<(), StorageError> {
        self.engine
            .sql::<()>(METADATA_TABLE)
            .with("id", SUCCEEDED_JOBS_COUNTER_ID)
            .with("amount", amount)
            .update_without_entity(INCREMENT_SUCCEEDED_JOBS_COUNTER)?;
        Ok(())
    }
}
