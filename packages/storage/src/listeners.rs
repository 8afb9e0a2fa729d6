//! Change listeners and their rate limited notification.

use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use throttle::Throttle;

use crate::StorageError;
use crate::models::{JobRunrMetadata, JobStats};

pub trait JobStatsChangeListener: Send + Sync {
    fn on_change(&self, job_stats: &JobStats);
}

/// Listens to the records of one metadata name.
pub trait MetadataChangeListener: Send + Sync {
    fn listen_for_changes_of_metadata_name(&self) -> &str;

    fn on_change(&self, metadata: &[JobRunrMetadata]);
}

#[derive(Clone)]
pub enum ChangeListener {
    JobStats(Arc<dyn JobStatsChangeListener>),
    Metadata(Arc<dyn MetadataChangeListener>),
}

impl std::fmt::Debug for ChangeListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::JobStats(_) => f.write_str("ChangeListener::JobStats"),
            Self::Metadata(x) => write!(
                f,
                "ChangeListener::Metadata({})",
                x.listen_for_changes_of_metadata_name()
            ),
        }
    }
}

/// Registered listeners with one throttle per listener kind.
///
/// Notifications beyond one per interval are dropped, so a burst of writes
/// produces a single notification. Listeners see fresh data computed at
/// notification time.
pub struct ChangeNotifier {
    job_stats_listeners: RwLock<Vec<Arc<dyn JobStatsChangeListener>>>,
    metadata_listeners: RwLock<Vec<Arc<dyn MetadataChangeListener>>>,
    job_stats_throttle: Mutex<Throttle>,
    metadata_throttle: Mutex<Throttle>,
}

impl std::fmt::Debug for ChangeNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeNotifier")
            .field("job_stats_listeners", &read(&self.job_stats_listeners).len())
            .field("metadata_listeners", &read(&self.metadata_listeners).len())
            .finish_non_exhaustive()
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

fn accept(throttle: &Mutex<Throttle>) -> bool {
    throttle
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .accept()
        .is_ok()
}

impl ChangeNotifier {
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            job_stats_listeners: RwLock::new(vec![]),
            metadata_listeners: RwLock::new(vec![]),
            job_stats_throttle: Mutex::new(Throttle::new(interval, 1)),
            metadata_throttle: Mutex::new(Throttle::new(interval, 1)),
        }
    }

    pub fn add(&self, listener: ChangeListener) {
        match listener {
            ChangeListener::JobStats(x) => write(&self.job_stats_listeners).push(x),
            ChangeListener::Metadata(x) => write(&self.metadata_listeners).push(x),
        }
    }

    pub fn remove(&self, listener: &ChangeListener) {
        match listener {
            ChangeListener::JobStats(x) => {
                write(&self.job_stats_listeners).retain(|y| !Arc::ptr_eq(x, y));
            }
            ChangeListener::Metadata(x) => {
                write(&self.metadata_listeners).retain(|y| !Arc::ptr_eq(x, y));
            }
        }
    }

    /// Notifies job stats listeners unless throttled. A failure to compute
    /// the stats is logged and dropped.
    pub fn notify_job_stats(&self, job_stats: impl FnOnce() -> Result<JobStats, StorageError>) {
        let listeners = read(&self.job_stats_listeners).clone();
        if listeners.is_empty() || !accept(&self.job_stats_throttle) {
            return;
        }

        match job_stats() {
            Ok(job_stats) => {
                for listener in &listeners {
                    listener.on_change(&job_stats);
                }
            }
            Err(e) => log::error!("Failed to notify job stats listeners: {e:?}"),
        }
    }

    /// Notifies metadata listeners unless throttled, each with the current
    /// records of its metadata name.
    pub fn notify_metadata(
        &self,
        metadata: impl Fn(&str) -> Result<Vec<JobRunrMetadata>, StorageError>,
    ) {
        let listeners = read(&self.metadata_listeners).clone();
        if listeners.is_empty() || !accept(&self.metadata_throttle) {
            return;
        }

        for listener in &listeners {
            match metadata(listener.listen_for_changes_of_metadata_name()) {
                Ok(records) => listener.on_change(&records),
                Err(e) => log::error!(
                    "Failed to notify metadata listener of '{}': {e:?}",
                    listener.listen_for_changes_of_metadata_name()
                ),
            }
        }
    }
}
