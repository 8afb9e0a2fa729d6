use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use jobrunr_sql::{BindFields, DatabaseValue, Row, RowError, SqlEngine, SqlError};
use uuid::Uuid;

use super::{JOBS_TABLE, state_in};
use crate::StorageError;
use crate::mapper::JobMapper;
use crate::models::{Job, JobDetails, PageRequest, StateName};

const INSERT: &str = "into jobrunr_jobs (id, version, jobAsJson, jobSignature, state, createdAt, updatedAt, scheduledAt, recurringJobId) \
                      values (:id, :version, :jobAsJson, :jobSignature, :state, :createdAt, :updatedAt, :scheduledAt, :recurringJobId)";

const UPDATE: &str = "jobrunr_jobs SET version = :version, jobAsJson = :jobAsJson, state = :state, updatedAt = :updatedAt, scheduledAt = :scheduledAt \
                      WHERE id = :id and version = :previousVersion";

const SELECT_JOBS: &str = "jobAsJson, version from jobrunr_jobs";

impl BindFields for Job {
    fn bind_field(&self, name: &str) -> Option<DatabaseValue> {
        Some(match name {
            "id" => self.id.into(),
            "version" => self.version.into(),
            "jobSignature" => self.job_signature().into(),
            "state" => DatabaseValue::enumeration(self.state),
            "createdAt" => self.created_at.into(),
            "updatedAt" => self.updated_at.into(),
            "scheduledAt" => self.scheduled_at.into(),
            "recurringJobId" => self.recurring_job_id.clone().into(),
            _ => return None,
        })
    }
}

fn json_and_version(row: &Row) -> Result<(String, i32), RowError> {
    Ok((row.as_string("jobAsJson")?, row.as_int("version")?))
}

/// Version checked persistence of jobs.
#[derive(Debug, Clone, Copy)]
pub struct JobTable<'a> {
    engine: &'a SqlEngine,
    mapper: JobMapper,
}

impl<'a> JobTable<'a> {
    #[must_use]
    pub const fn new(engine: &'a SqlEngine, mapper: JobMapper) -> Self {
        Self { engine, mapper }
    }

    fn to_jobs(self, rows: Vec<(String, i32)>) -> Result<Vec<Job>, StorageError> {
        rows.into_iter()
            .map(|(json, version)| Ok(self.mapper.deserialize_job(&json, version)?))
            .collect()
    }

    /// # Errors
    ///
    /// * If the query fails or the stored job is malformed
    pub fn select_job_by_id(self, id: Uuid) -> Result<Option<Job>, StorageError> {
        let row = self
            .engine
            .sql::<()>(JOBS_TABLE)
            .with("id", id)
            .select_first(&format!("{SELECT_JOBS} where id = :id"), json_and_version)?;

        Ok(row
            .map(|(json, version)| self.mapper.deserialize_job(&json, version))
            .transpose()?)
    }

    /// Inserts a job at version 0, updates it otherwise. The returned job
    /// carries the incremented version.
    ///
    /// # Errors
    ///
    /// * [`StorageError::ConcurrentJobModification`] with the job as passed
    ///   in if another writer advanced its version
    pub fn save(self, job: Job) -> Result<Job, StorageError> {
        let original = job.clone();
        let mut job = job;
        let is_new = job.version == 0;
        job.increase_version();

        let sql = self
            .engine
            .sql::<Job>(JOBS_TABLE)
            .with("jobAsJson", self.mapper.serialize_job(&job)?);
        let result = if is_new {
            sql.insert(&job, INSERT)
        } else {
            sql.update(&job, UPDATE)
        };

        match result {
            Ok(()) => Ok(job),
            Err(SqlError::ConcurrentModification(conflict)) => {
                log::debug!("save: job {} lost a concurrent update: {conflict}", job.id);
                Err(StorageError::ConcurrentJobModification(vec![original]))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Saves new jobs as one batch insert and existing jobs as one batch
    /// update.
    ///
    /// # Errors
    ///
    /// * [`StorageError::ConcurrentJobModification`] with every job of the
    ///   conflicting batch, at the version passed in
    pub fn save_all(self, jobs: Vec<Job>) -> Result<Vec<Job>, StorageError> {
        let mut jobs = jobs;
        for job in &mut jobs {
            job.increase_version();
        }

        let json = jobs
            .iter()
            .map(|x| Ok((x.id, self.mapper.serialize_job(x)?)))
            .collect::<Result<BTreeMap<_, _>, serde_json::Error>>()?;
        let (new, existing): (Vec<_>, Vec<_>) = jobs.iter().cloned().partition(|x| x.version == 1);

        let sql = self
            .engine
            .sql::<Job>(JOBS_TABLE)
            .with_fn("jobAsJson", move |job| json.get(&job.id).cloned().into());

        sql.insert_all(&new, INSERT).map_err(job_conflict)?;
        sql.update_all(&existing, UPDATE).map_err(job_conflict)?;

        Ok(jobs)
    }

    /// # Errors
    ///
    /// * If the query fails or a stored job is malformed
    pub fn select_jobs_by_state(
        self,
        state: StateName,
        page: &PageRequest,
    ) -> Result<Vec<Job>, StorageError> {
        let rows = self
            .engine
            .sql::<()>(JOBS_TABLE)
            .with("state", DatabaseValue::enumeration(state))
            .with_order_limit_and_offset(&page.order_clause()?, page.limit, page.offset)
            .select_map(&format!("{SELECT_JOBS} where state = :state"), json_and_version)?;

        self.to_jobs(rows)
    }

    /// # Errors
    ///
    /// * If the query fails or a stored job is malformed
    pub fn select_jobs_by_state_updated_before(
        self,
        state: StateName,
        updated_before: DateTime<Utc>,
        page: &PageRequest,
    ) -> Result<Vec<Job>, StorageError> {
        let rows = self
            .engine
            .sql::<()>(JOBS_TABLE)
            .with("state", DatabaseValue::enumeration(state))
            .with("updatedBefore", updated_before)
            .with_order_limit_and_offset(&page.order_clause()?, page.limit, page.offset)
            .select_map(
                &format!("{SELECT_JOBS} where state = :state AND updatedAt <= :updatedBefore"),
                json_and_version,
            )?;

        self.to_jobs(rows)
    }

    /// # Errors
    ///
    /// * If the query fails or a stored job is malformed
    pub fn select_jobs_scheduled_before(
        self,
        scheduled_before: DateTime<Utc>,
        page: &PageRequest,
    ) -> Result<Vec<Job>, StorageError> {
        let rows = self
            .engine
            .sql::<()>(JOBS_TABLE)
            .with("state", DatabaseValue::enumeration(StateName::Scheduled))
            .with("scheduledBefore", scheduled_before)
            .with_order_limit_and_offset(&page.order_clause()?, page.limit, page.offset)
            .select_map(
                &format!("{SELECT_JOBS} where state = :state AND scheduledAt <= :scheduledBefore"),
                json_and_version,
            )?;

        self.to_jobs(rows)
    }

    /// # Errors
    ///
    /// * If the count fails
    pub fn count_jobs(self, state: StateName) -> Result<u64, StorageError> {
        Ok(self
            .engine
            .sql::<()>(JOBS_TABLE)
            .with("state", DatabaseValue::enumeration(state))
            .select_count("from jobrunr_jobs where state = :state")?)
    }

    /// # Errors
    ///
    /// * If the delete fails
    pub fn delete_permanently(self, id: Uuid) -> Result<u64, StorageError> {
        Ok(self
            .engine
            .sql::<()>(JOBS_TABLE)
            .with("id", id)
            .delete("from jobrunr_jobs where id = :id")?)
    }

    /// # Errors
    ///
    /// * If the delete fails
    pub fn delete_jobs_by_state_and_updated_before(
        self,
        state: StateName,
        updated_before: DateTime<Utc>,
    ) -> Result<u64, StorageError> {
        Ok(self
            .engine
            .sql::<()>(JOBS_TABLE)
            .with("state", DatabaseValue::enumeration(state))
            .with("updatedBefore", updated_before)
            .delete("from jobrunr_jobs where state = :state AND updatedAt <= :updatedBefore")?)
    }

    /// # Errors
    ///
    /// * If the query fails
    pub fn get_distinct_job_signatures(
        self,
        states: &[StateName],
    ) -> Result<BTreeSet<String>, StorageError> {
        if states.is_empty() {
            return Ok(BTreeSet::new());
        }

        let signatures = self.engine.sql::<()>(JOBS_TABLE).select_map(
            &format!(
                "distinct jobSignature from jobrunr_jobs where state in ({})",
                state_in(states)
            ),
            |row| row.as_string("jobSignature"),
        )?;

        Ok(signatures.into_iter().collect())
    }

    /// # Errors
    ///
    /// * If the count fails
    pub fn exists(self, details: &JobDetails, states: &[StateName]) -> Result<bool, StorageError> {
        if states.is_empty() {
            return Ok(false);
        }

        Ok(self
            .engine
            .sql::<()>(JOBS_TABLE)
            .with("jobSignature", details.signature())
            .select_exists(&format!(
                "from jobrunr_jobs where state in ({}) AND jobSignature = :jobSignature",
                state_in(states)
            ))?)
    }

    /// # Errors
    ///
    /// * If the count fails
    pub fn recurring_job_exists(
        self,
        recurring_job_id: &str,
        states: &[StateName],
    ) -> Result<bool, StorageError> {
        if states.is_empty() {
            return Ok(false);
        }

        Ok(self
            .engine
            .sql::<()>(JOBS_TABLE)
            .with("recurringJobId", recurring_job_id)
            .select_exists(&format!(
                "from jobrunr_jobs where state in ({}) AND recurringJobId = :recurringJobId",
                state_in(states)
            ))?)
    }
}

fn job_conflict(err: SqlError<Job>) -> StorageError {
    match err {
        SqlError::ConcurrentModification(conflict) => {
            log::debug!("save_all: {conflict}");
            StorageError::ConcurrentJobModification(
                conflict
                    .entities
                    .into_iter()
                    .map(|mut x| {
                        x.version -= 1;
                        x
                    })
                    .collect(),
            )
        }
        other => other.into(),
    }
}
