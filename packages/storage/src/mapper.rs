//! JSON form of jobs as stored in the `jobAsJson` column.

use crate::models::{Job, RecurringJob};

/// Serializes jobs to and from their stored JSON.
///
/// The version column is authoritative: on read it replaces whatever version
/// the JSON copy holds.
#[derive(Debug, Clone, Copy, Default)]
pub struct JobMapper;

impl JobMapper {
    /// # Errors
    ///
    /// * If the job fails to serialize
    pub fn serialize_job(self, job: &Job) -> Result<String, serde_json::Error> {
        serde_json::to_string(job)
    }

    /// # Errors
    ///
    /// * If `json` is not a valid job
    pub fn deserialize_job(self, json: &str, version: i32) -> Result<Job, serde_json::Error> {
        let mut job: Job = serde_json::from_str(json)?;
        job.version = version;
        Ok(job)
    }

    /// # Errors
    ///
    /// * If the recurring job fails to serialize
    pub fn serialize_recurring_job(self, job: &RecurringJob) -> Result<String, serde_json::Error> {
        serde_json::to_string(job)
    }

    /// # Errors
    ///
    /// * If `json` is not a valid recurring job
    pub fn deserialize_recurring_job(
        self,
        json: &str,
        version: i32,
    ) -> Result<RecurringJob, serde_json::Error> {
        let mut job: RecurringJob = serde_json::from_str(json)?;
        job.version = version;
        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::models::JobDetails;

    #[test_log::test]
    fn column_version_wins_over_json_copy() {
        let mut job = Job::new(JobDetails::new("org.example.Reports", "generate"));
        job.version = 2;
        let json = JobMapper.serialize_job(&job).unwrap();

        let read = JobMapper.deserialize_job(&json, 5).unwrap();

        assert_eq!(read.version, 5);
        assert_eq!(read.id, job.id);
        assert_eq!(read.job_details, job.job_details);
    }

    #[test_log::test]
    fn stores_state_by_symbolic_name() {
        let job = Job::new(JobDetails::new("org.example.Reports", "generate"));

        let json = JobMapper.serialize_job(&job).unwrap();

        assert!(json.contains("\"state\":\"ENQUEUED\""));
        assert!(json.contains("\"jobDetails\""));
    }

    #[test_log::test]
    fn rejects_malformed_json() {
        assert!(JobMapper.deserialize_job("{\"id\":", 1).is_err());
    }
}
