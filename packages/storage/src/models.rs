//! Records exchanged with the storage provider.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, EnumIter, EnumString, IntoStaticStr};
use uuid::Uuid;

use crate::StorageError;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    EnumString,
    EnumIter,
    AsRefStr,
    IntoStaticStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum StateName {
    Awaiting,
    Scheduled,
    Enqueued,
    Processing,
    Failed,
    Succeeded,
    Deleted,
}

impl std::fmt::Display for StateName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_ref())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobParameter {
    pub class_name: String,
    pub object: serde_json::Value,
}

/// What a job runs: a method on a class with its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDetails {
    pub class_name: String,
    pub method_name: String,
    #[serde(default)]
    pub job_parameters: Vec<JobParameter>,
}

impl JobDetails {
    #[must_use]
    pub fn new(class_name: impl Into<String>, method_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            method_name: method_name.into(),
            job_parameters: vec![],
        }
    }

    #[must_use]
    pub fn with_parameter(
        mut self,
        class_name: impl Into<String>,
        object: impl Into<serde_json::Value>,
    ) -> Self {
        self.job_parameters.push(JobParameter {
            class_name: class_name.into(),
            object: object.into(),
        });
        self
    }

    /// `class.method(parameter classes)`, used to find equivalent jobs.
    #[must_use]
    pub fn signature(&self) -> String {
        let parameters = self
            .job_parameters
            .iter()
            .map(|x| x.class_name.as_str())
            .collect::<Vec<_>>()
            .join(",");
        format!("{}.{}({parameters})", self.class_name, self.method_name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: Uuid,
    /// Optimistic concurrency version. Zero until first saved.
    pub version: i32,
    pub job_name: String,
    pub job_details: JobDetails,
    pub state: StateName,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub recurring_job_id: Option<String>,
}

impl Job {
    /// A new enqueued job.
    #[must_use]
    pub fn new(job_details: JobDetails) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            version: 0,
            job_name: job_details.signature(),
            job_details,
            state: StateName::Enqueued,
            created_at: now,
            updated_at: now,
            scheduled_at: None,
            recurring_job_id: None,
        }
    }

    #[must_use]
    pub fn scheduled(job_details: JobDetails, at: DateTime<Utc>) -> Self {
        Self {
            state: StateName::Scheduled,
            scheduled_at: Some(at),
            ..Self::new(job_details)
        }
    }

    #[must_use]
    pub fn with_recurring_job_id(mut self, recurring_job_id: impl Into<String>) -> Self {
        self.recurring_job_id = Some(recurring_job_id.into());
        self
    }

    /// Moves the job to `state` and stamps the update time.
    pub fn transition(&mut self, state: StateName) {
        self.state = state;
        self.updated_at = Utc::now();
    }

    #[must_use]
    pub fn job_signature(&self) -> String {
        self.job_details.signature()
    }

    /// Bumps the version ahead of a write and returns the new value.
    pub const fn increase_version(&mut self) -> i32 {
        self.version += 1;
        self.version
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecurringJob {
    pub id: String,
    pub version: i32,
    pub job_name: String,
    pub job_details: JobDetails,
    pub schedule_expression: String,
    pub zone_id: String,
    pub created_at: DateTime<Utc>,
}

impl RecurringJob {
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        job_details: JobDetails,
        schedule_expression: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            version: 0,
            job_name: job_details.signature(),
            job_details,
            schedule_expression: schedule_expression.into(),
            zone_id: "UTC".to_string(),
            created_at: Utc::now(),
        }
    }
}

/// Heartbeat record of one background job server.
#[derive(Debug, Clone, PartialEq)]
pub struct BackgroundJobServerStatus {
    pub id: Uuid,
    pub worker_pool_size: i32,
    pub poll_interval_in_seconds: i32,
    pub delete_succeeded_jobs_after: Duration,
    pub permanently_delete_deleted_jobs_after: Duration,
    pub first_heartbeat: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub running: bool,
    pub system_total_memory: i64,
    pub system_free_memory: i64,
    pub system_cpu_load: f64,
    pub process_max_memory: i64,
    pub process_free_memory: i64,
    pub process_allocated_memory: i64,
    pub process_cpu_load: f64,
}

impl BackgroundJobServerStatus {
    #[must_use]
    pub fn new(worker_pool_size: i32, poll_interval_in_seconds: i32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            worker_pool_size,
            poll_interval_in_seconds,
            delete_succeeded_jobs_after: Duration::from_secs(36 * 3600),
            permanently_delete_deleted_jobs_after: Duration::from_secs(72 * 3600),
            first_heartbeat: now,
            last_heartbeat: now,
            running: true,
            system_total_memory: 0,
            system_free_memory: 0,
            system_cpu_load: 0.0,
            process_max_memory: 0,
            process_free_memory: 0,
            process_allocated_memory: 0,
            process_cpu_load: 0.0,
        }
    }
}

/// Arbitrary named value owned by a cluster member. Identified by
/// `name-owner`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRunrMetadata {
    pub name: String,
    pub owner: String,
    pub value: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRunrMetadata {
    #[must_use]
    pub fn new(name: impl Into<String>, owner: impl Into<String>, value: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            owner: owner.into(),
            value: value.into(),
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn id(&self) -> String {
        metadata_id(&self.name, &self.owner)
    }
}

#[must_use]
pub fn metadata_id(name: &str, owner: &str) -> String {
    format!("{name}-{owner}")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStats {
    pub time_stamp: DateTime<Utc>,
    pub total: i64,
    pub awaiting: i64,
    pub scheduled: i64,
    pub enqueued: i64,
    pub processing: i64,
    pub failed: i64,
    pub succeeded: i64,
    pub all_time_succeeded: i64,
    pub deleted: i64,
    pub recurring_jobs: i32,
    pub background_job_servers: i32,
}

impl JobStats {
    /// All-zero statistics, returned when no summary row exists.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            time_stamp: Utc::now(),
            total: 0,
            awaiting: 0,
            scheduled: 0,
            enqueued: 0,
            processing: 0,
            failed: 0,
            succeeded: 0,
            all_time_succeeded: 0,
            deleted: 0,
            recurring_jobs: 0,
            background_job_servers: 0,
        }
    }
}

/// Columns a page may be ordered by.
pub const ORDER_FIELDS: [&str; 3] = ["createdAt", "updatedAt", "scheduledAt"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, AsRefStr)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum Direction {
    Asc,
    Desc,
}

/// Offset, limit and ordering of a paged read.
///
/// The order is serialized as `field:DIRECTION`, several orders separated
/// by `,`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageRequest {
    pub order: String,
    pub offset: u64,
    pub limit: u32,
}

impl PageRequest {
    pub const DEFAULT_LIMIT: u32 = 20;

    #[must_use]
    pub fn new(order: impl Into<String>, offset: u64, limit: u32) -> Self {
        Self {
            order: order.into(),
            offset,
            limit,
        }
    }

    #[must_use]
    pub fn ascending_on_created_at(offset: u64, limit: u32) -> Self {
        Self::new("createdAt:ASC", offset, limit)
    }

    #[must_use]
    pub fn descending_on_updated_at(offset: u64, limit: u32) -> Self {
        Self::new("updatedAt:DESC", offset, limit)
    }

    #[must_use]
    pub fn ascending_on_scheduled_at(limit: u32) -> Self {
        Self::new("scheduledAt:ASC", 0, limit)
    }

    /// SQL order clause for the requested order, e.g. `createdAt ASC`.
    ///
    /// # Errors
    ///
    /// * [`StorageError::InvalidPageRequest`] if a field is not orderable or
    ///   a direction is unknown
    pub fn order_clause(&self) -> Result<String, StorageError> {
        self.order
            .split(',')
            .map(|part| {
                let (field, direction) = part
                    .trim()
                    .split_once(':')
                    .unwrap_or((part.trim(), "ASC"));
                if !ORDER_FIELDS.contains(&field) {
                    return Err(StorageError::InvalidPageRequest(format!(
                        "Can not order by '{field}'"
                    )));
                }
                let direction = direction.parse::<Direction>().map_err(|_| {
                    StorageError::InvalidPageRequest(format!("Unknown direction '{direction}'"))
                })?;
                Ok(format!("{field} {}", direction.as_ref()))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(|x| x.join(", "))
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::ascending_on_created_at(0, Self::DEFAULT_LIMIT)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub total: u64,
    pub items: Vec<T>,
    pub offset: u64,
    pub limit: u32,
    pub has_more: bool,
}

impl<T> Page<T> {
    #[must_use]
    pub fn new(total: u64, items: Vec<T>, request: &PageRequest) -> Self {
        let has_more = request.offset + (items.len() as u64) < total;
        Self {
            total,
            items,
            offset: request.offset,
            limit: request.limit,
            has_more,
        }
    }

    #[must_use]
    pub fn empty(request: &PageRequest) -> Self {
        Self::new(0, vec![], request)
    }
}
