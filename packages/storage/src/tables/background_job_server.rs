use std::time::Duration;

use chrono::{DateTime, Utc};
use jobrunr_sql::{BindFields, DatabaseValue, Row, RowError, SqlEngine, SqlError};
use uuid::Uuid;

use super::BACKGROUND_JOB_SERVERS_TABLE;
use crate::StorageError;
use crate::models::BackgroundJobServerStatus;

const ANNOUNCE: &str = "into jobrunr_backgroundjobservers (id, workerPoolSize, pollIntervalInSeconds, deleteSucceededJobsAfter, permanentlyDeleteJobsAfter, \
                        firstHeartbeat, lastHeartbeat, running, systemTotalMemory, systemFreeMemory, systemCpuLoad, processMaxMemory, processFreeMemory, processAllocatedMemory, processCpuLoad) \
                        values (:id, :workerPoolSize, :pollIntervalInSeconds, :deleteSucceededJobsAfter, :permanentlyDeleteJobsAfter, \
                        :firstHeartbeat, :lastHeartbeat, :running, :systemTotalMemory, :systemFreeMemory, :systemCpuLoad, :processMaxMemory, :processFreeMemory, :processAllocatedMemory, :processCpuLoad)";

const HEARTBEAT: &str = "jobrunr_backgroundjobservers SET lastHeartbeat = :lastHeartbeat, systemFreeMemory = :systemFreeMemory, systemCpuLoad = :systemCpuLoad, \
                         processFreeMemory = :processFreeMemory, processAllocatedMemory = :processAllocatedMemory, processCpuLoad = :processCpuLoad \
                         WHERE id = :id";

impl BindFields for BackgroundJobServerStatus {
    fn bind_field(&self, name: &str) -> Option<DatabaseValue> {
        Some(match name {
            "id" => self.id.into(),
            "workerPoolSize" => self.worker_pool_size.into(),
            "pollIntervalInSeconds" => self.poll_interval_in_seconds.into(),
            "deleteSucceededJobsAfter" => self.delete_succeeded_jobs_after.into(),
            "permanentlyDeleteJobsAfter" => self.permanently_delete_deleted_jobs_after.into(),
            "firstHeartbeat" => self.first_heartbeat.into(),
            "lastHeartbeat" => self.last_heartbeat.into(),
            "running" => self.running.into(),
            "systemTotalMemory" => self.system_total_memory.into(),
            "systemFreeMemory" => self.system_free_memory.into(),
            "systemCpuLoad" => self.system_cpu_load.into(),
            "processMaxMemory" => self.process_max_memory.into(),
            "processFreeMemory" => self.process_free_memory.into(),
            "processAllocatedMemory" => self.process_allocated_memory.into(),
            "processCpuLoad" => self.process_cpu_load.into(),
            _ => return None,
        })
    }
}

/// Parses the `PT#H#M#.#S` text durations are stored as.
fn parse_duration(text: &str) -> Option<Duration> {
    let mut rest = text.trim().strip_prefix("PT")?;
    let mut seconds = 0.0_f64;

    while !rest.is_empty() {
        let end = rest.find(|c: char| c.is_ascii_alphabetic())?;
        let value = rest[..end].parse::<f64>().ok()?;
        seconds += match &rest[end..=end] {
            "H" => value * 3600.0,
            "M" => value * 60.0,
            "S" => value,
            _ => return None,
        };
        rest = &rest[end + 1..];
    }

    Duration::try_from_secs_f64(seconds).ok()
}

fn as_duration(row: &Row, column: &str) -> Result<Duration, RowError> {
    let text = row.as_string(column)?;
    parse_duration(&text).ok_or_else(|| RowError::Conversion {
        column: column.to_string(),
        target: "Duration",
        value: text,
    })
}

fn to_status(row: &Row) -> Result<BackgroundJobServerStatus, RowError> {
    Ok(BackgroundJobServerStatus {
        id: row.as_uuid("id")?,
        worker_pool_size: row.as_int("workerPoolSize")?,
        poll_interval_in_seconds: row.as_int("pollIntervalInSeconds")?,
        delete_succeeded_jobs_after: as_duration(row, "deleteSucceededJobsAfter")?,
        permanently_delete_deleted_jobs_after: as_duration(row, "permanentlyDeleteJobsAfter")?,
        first_heartbeat: row.as_instant("firstHeartbeat")?,
        last_heartbeat: row.as_instant("lastHeartbeat")?,
        running: row.as_bool("running")?,
        system_total_memory: row.as_long("systemTotalMemory")?,
        system_free_memory: row.as_long("systemFreeMemory")?,
        system_cpu_load: row.as_double("systemCpuLoad")?,
        process_max_memory: row.as_long("processMaxMemory")?,
        process_free_memory: row.as_long("processFreeMemory")?,
        process_allocated_memory: row.as_long("processAllocatedMemory")?,
        process_cpu_load: row.as_double("processCpuLoad")?,
    })
}

/// Heartbeats of the background job servers in the cluster.
#[derive(Debug, Clone, Copy)]
pub struct BackgroundJobServerTable<'a> {
    engine: &'a SqlEngine,
}

impl<'a> BackgroundJobServerTable<'a> {
    #[must_use]
    pub const fn new(engine: &'a SqlEngine) -> Self {
        Self { engine }
    }

    /// # Errors
    ///
    /// * If the server is already announced or the insert fails
    pub fn announce(self, status: &BackgroundJobServerStatus) -> Result<(), StorageError> {
        self.engine
            .sql::<BackgroundJobServerStatus>(BACKGROUND_JOB_SERVERS_TABLE)
            .insert(status, ANNOUNCE)?;
        Ok(())
    }

    /// Stores the heartbeat and returns the stored running flag.
    ///
    /// # Errors
    ///
    /// * [`StorageError::ServerTimedOut`] if the server row is gone
    pub fn signal_server_alive(self, status: &BackgroundJobServerStatus) -> Result<bool, StorageError> {
        let sql = self
            .engine
            .sql::<BackgroundJobServerStatus>(BACKGROUND_JOB_SERVERS_TABLE)
            .with("id", status.id);

        match sql.update(status, HEARTBEAT) {
            Ok(()) => {}
            Err(SqlError::ConcurrentModification(conflict)) => {
                log::debug!("signal_server_alive: server {} is gone: {conflict}", status.id);
                return Err(StorageError::ServerTimedOut(status.id));
            }
            Err(e) => return Err(e.into()),
        }

        sql.select_first("running from jobrunr_backgroundjobservers where id = :id", |row| {
            row.as_bool("running")
        })?
        .ok_or(StorageError::ServerTimedOut(status.id))
    }

    /// # Errors
    ///
    /// * If the delete fails
    pub fn signal_server_stopped(self, status: &BackgroundJobServerStatus) -> Result<(), StorageError> {
        self.engine
            .sql::<()>(BACKGROUND_JOB_SERVERS_TABLE)
            .with("id", status.id)
            .delete("from jobrunr_backgroundjobservers where id = :id")?;
        Ok(())
    }

    /// # Errors
    ///
    /// * If the query fails or a row is malformed
    pub fn get_all(self) -> Result<Vec<BackgroundJobServerStatus>, StorageError> {
        Ok(self
            .engine
            .sql::<()>(BACKGROUND_JOB_SERVERS_TABLE)
            .select_map("* from jobrunr_backgroundjobservers order by firstHeartbeat", to_status)?)
    }

    /// # Errors
    ///
    /// * If the query fails
    pub fn get_longest_running_background_job_server_id(self) -> Result<Option<Uuid>, StorageError> {
        Ok(self
            .engine
            .sql::<()>(BACKGROUND_JOB_SERVERS_TABLE)
            .select_first("id from jobrunr_backgroundjobservers order by firstHeartbeat", |row| {
                row.as_uuid("id")
            })?)
    }

    /// # Errors
    ///
    /// * If the delete fails
    pub fn remove_all_with_last_heartbeat_older_than(
        self,
        heartbeat_older_than: DateTime<Utc>,
    ) -> Result<u64, StorageError> {
        Ok(self
            .engine
            .sql::<()>(BACKGROUND_JOB_SERVERS_TABLE)
            .with("heartbeatOlderThan", heartbeat_older_than)
            .delete("from jobrunr_backgroundjobservers where lastHeartbeat < :heartbeatOlderThan")?)
    }
}
