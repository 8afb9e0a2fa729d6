use jobrunr_sql::{BindFields, DatabaseValue, SqlEngine};

use super::RECURRING_JOBS_TABLE;
use crate::StorageError;
use crate::mapper::JobMapper;
use crate::models::RecurringJob;

impl BindFields for RecurringJob {
    fn bind_field(&self, name: &str) -> Option<DatabaseValue> {
        Some(match name {
            "id" => self.id.clone().into(),
            "version" => self.version.into(),
            "createdAt" => self.created_at.into(),
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RecurringJobTable<'a> {
    engine: &'a SqlEngine,
    mapper: JobMapper,
}

impl<'a> RecurringJobTable<'a> {
    #[must_use]
    pub const fn new(engine: &'a SqlEngine, mapper: JobMapper) -> Self {
        Self { engine, mapper }
    }

    /// Updates the recurring job if one with the same id exists, inserts it
    /// otherwise.
    ///
    /// # Errors
    ///
    /// * If the job fails to serialize or the write fails
    pub fn save(self, job: RecurringJob) -> Result<RecurringJob, StorageError> {
        let sql = self
            .engine
            .sql::<RecurringJob>(RECURRING_JOBS_TABLE)
            .with("id", job.id.as_str())
            .with("jobAsJson", self.mapper.serialize_recurring_job(&job)?);

        if sql.select_exists("from jobrunr_recurring_jobs where id = :id")? {
            sql.update(
                &job,
                "jobrunr_recurring_jobs SET version = :version, jobAsJson = :jobAsJson WHERE id = :id",
            )?;
        } else {
            sql.insert(
                &job,
                "into jobrunr_recurring_jobs (id, version, jobAsJson, createdAt) values (:id, :version, :jobAsJson, :createdAt)",
            )?;
        }

        Ok(job)
    }

    /// # Errors
    ///
    /// * If the query fails or a stored job is malformed
    pub fn select_all(self) -> Result<Vec<RecurringJob>, StorageError> {
        let rows = self.engine.sql::<()>(RECURRING_JOBS_TABLE).select_map(
            "jobAsJson, version from jobrunr_recurring_jobs order by createdAt",
            |row| Ok((row.as_string("jobAsJson")?, row.as_int("version")?)),
        )?;

        rows.into_iter()
            .map(|(json, version)| Ok(self.mapper.deserialize_recurring_job(&json, version)?))
            .collect()
    }

    /// # Errors
    ///
    /// * If the delete fails
    pub fn delete_by_id(self, id: &str) -> Result<u64, StorageError> {
        Ok(self
            .engine
            .sql::<()>(RECURRING_JOBS_TABLE)
            .with("id", id)
            .delete("from jobrunr_recurring_jobs where id = :id")?)
    }
}
