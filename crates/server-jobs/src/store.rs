// crates/server-jobs/src/store.rs
//! Job table with per-job push subscribers and a retention sweeper.
//!
//! Every mutation, its snapshot and the delivery attempts happen under the
//! table's write lock, so all observers see mutations in one order. Delivery
//! uses `try_send` on small bounded channels: a subscriber whose buffer is
//! full misses that snapshot instead of stalling the mutating task.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

use crate::types::{FileResult, Job, JobStatus};

/// Tunables for a [`JobStore`].
#[derive(Debug, Clone)]
pub struct JobStoreConfig {
    /// How long a finished job without subscribers is kept.
    pub retention: Duration,
    /// Period of the background sweep.
    pub sweep_interval: Duration,
    /// Buffered snapshots per subscriber before updates are dropped.
    pub subscriber_capacity: usize,
}

impl Default for JobStoreConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(60),
            subscriber_capacity: 10,
        }
    }
}

struct Watcher {
    id: u64,
    tx: mpsc::Sender<Arc<Job>>,
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<String, Job>,
    watchers: HashMap<String, Vec<Watcher>>,
}

/// Registry of batch jobs.
///
/// Shared as `Arc<JobStore>`; subscriptions hold a weak handle back to it.
pub struct JobStore {
    config: JobStoreConfig,
    inner: RwLock<Inner>,
    next_watcher_id: AtomicU64,
    dropped_updates: AtomicU64,
}

impl JobStore {
    pub fn new(config: JobStoreConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            inner: RwLock::new(Inner::default()),
            next_watcher_id: AtomicU64::new(1),
            dropped_updates: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &JobStoreConfig {
        &self.config
    }

    // -- Lifecycle ------------------------------------------------------------

    /// Insert a fresh `pending` job, replacing any job with the same id.
    pub fn create(&self, id: &str) -> Job {
        let job = Job::new(Utc::now());
        let mut inner = self.write_inner();
        inner.jobs.insert(id.to_string(), job.clone());
        inner.watchers.insert(id.to_string(), Vec::new());
        tracing::debug!(job_id = id, "Job created");
        job
    }

    /// Snapshot of a job, `None` if it does not exist.
    pub fn get(&self, id: &str) -> Option<Job> {
        self.read_inner().jobs.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.read_inner().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replace status and message, and `data` when given.
    ///
    /// Returns `false` if the job is unknown or the update would leave a
    /// terminal status.
    pub fn update(
        &self,
        id: &str,
        status: JobStatus,
        message: impl Into<String>,
        data: Option<HashMap<String, String>>,
    ) -> bool {
        let message = message.into();
        self.mutate(id, |job| apply_status(id, job, status, message, data, None))
    }

    /// Like [`update`](Self::update), also replacing the operation tag.
    pub fn update_with_operation(
        &self,
        id: &str,
        status: JobStatus,
        message: impl Into<String>,
        data: Option<HashMap<String, String>>,
        operation: impl Into<String>,
    ) -> bool {
        let message = message.into();
        let operation = operation.into();
        self.mutate(id, |job| apply_status(id, job, status, message, data, Some(operation)))
    }

    /// Set progress, clamped to 0..=100.
    pub fn update_progress(&self, id: &str, percent: i64) -> bool {
        let p = percent.clamp(0, 100) as u8;
        self.mutate(id, |job| {
            job.progress = p;
            true
        })
    }

    /// Record where the job's outputs live. Not visible to observers, so
    /// nothing is broadcast.
    pub fn set_output_dir(&self, id: &str, output_dir: impl Into<PathBuf>) -> bool {
        match self.write_inner().jobs.get_mut(id) {
            Some(job) => {
                job.output_dir = Some(output_dir.into());
                true
            }
            None => false,
        }
    }

    /// Announce how many files the batch will process.
    pub fn set_file_count(&self, id: &str, count: usize) -> bool {
        self.mutate(id, |job| {
            job.file_count = count;
            true
        })
    }

    /// Replace all file results.
    pub fn set_files(&self, id: &str, files: Vec<FileResult>) -> bool {
        self.mutate(id, |job| {
            job.file_count = files.len();
            job.files = files;
            true
        })
    }

    /// Append one file result. The count never drops below the size
    /// announced with [`set_file_count`](Self::set_file_count).
    pub fn add_file(&self, id: &str, file: FileResult) -> bool {
        self.mutate(id, |job| {
            job.files.push(file);
            job.file_count = job.file_count.max(job.files.len());
            true
        })
    }

    // -- Subscribers ----------------------------------------------------------

    /// Subscribe to snapshots of job `id`.
    ///
    /// The current state is queued immediately, followed by one snapshot
    /// per later mutation. `None` if the job does not exist.
    pub fn subscribe(self: &Arc<Self>, id: &str) -> Option<Subscription> {
        let (tx, rx) = mpsc::channel(self.config.subscriber_capacity.max(1));
        let watcher_id = self.next_watcher_id.fetch_add(1, Ordering::Relaxed);

        let mut inner = self.write_inner();
        let snapshot = Arc::new(inner.jobs.get(id)?.clone());
        // Fresh channel with capacity >= 1: cannot be full.
        let _ = tx.try_send(snapshot);
        inner
            .watchers
            .entry(id.to_string())
            .or_default()
            .push(Watcher { id: watcher_id, tx });
        drop(inner);

        tracing::debug!(job_id = id, watcher_id, "Subscribed to job");
        Some(Subscription {
            store: Arc::downgrade(self),
            job_id: id.to_string(),
            watcher_id,
            rx,
        })
    }

    /// Number of live subscribers on job `id`.
    pub fn subscriber_count(&self, id: &str) -> usize {
        self.read_inner().watchers.get(id).map_or(0, Vec::len)
    }

    /// Snapshots dropped so far because a subscriber's buffer was full.
    pub fn dropped_updates(&self) -> u64 {
        self.dropped_updates.load(Ordering::Relaxed)
    }

    fn unsubscribe(&self, id: &str, watcher_id: u64) {
        let mut inner = self.write_inner();
        if let Some(watchers) = inner.watchers.get_mut(id) {
            watchers.retain(|w| w.id != watcher_id);
        }
    }

    // -- Removal --------------------------------------------------------------

    /// Remove job `id` now and close all of its subscriber channels.
    /// Returns the removed job.
    pub fn cleanup(&self, id: &str) -> Option<Job> {
        let mut inner = self.write_inner();
        // Dropping the senders closes the channels.
        inner.watchers.remove(id);
        let job = inner.jobs.remove(id);
        if job.is_some() {
            tracing::debug!(job_id = id, "Job cleaned up");
        }
        job
    }

    /// Remove finished jobs older than the retention window that nobody is
    /// watching, and return them. Their output directories are left alone.
    pub fn sweep(&self, now: DateTime<Utc>) -> Vec<Job> {
        let retention = self.config.retention;
        let mut inner = self.write_inner();
        let Inner { jobs, watchers } = &mut *inner;

        let expired: Vec<String> = jobs
            .iter()
            .filter(|(id, job)| {
                let old = job.completed_at.is_some_and(|done| {
                    now.signed_duration_since(done)
                        .to_std()
                        .is_ok_and(|age| age > retention)
                });
                old && !watchers.get(*id).is_some_and(|w| !w.is_empty())
            })
            .map(|(id, _)| id.clone())
            .collect();

        expired
            .iter()
            .filter_map(|id| {
                watchers.remove(id);
                jobs.remove(id)
            })
            .collect()
    }

    /// [`sweep`](Self::sweep), then delete the output directory of every
    /// removed job. Returns how many jobs were removed.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let removed = self.sweep(now);
        for dir in removed.iter().filter_map(|job| job.output_dir.as_deref()) {
            remove_output_dir(dir).await;
        }
        removed.len()
    }

    /// Run [`purge_expired`](Self::purge_expired) every `sweep_interval`
    /// until the store is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let store = Arc::downgrade(self);
        let period = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                let removed = store.purge_expired(Utc::now()).await;
                if removed > 0 {
                    tracing::info!(removed, remaining = store.len(), "Swept expired jobs");
                }
            }
        })
    }

    // -- Internals ------------------------------------------------------------

    /// Apply `f` to job `id`; if it reports a change, broadcast a snapshot.
    fn mutate<F>(&self, id: &str, f: F) -> bool
    where
        F: FnOnce(&mut Job) -> bool,
    {
        let mut inner = self.write_inner();
        let Inner { jobs, watchers } = &mut *inner;
        let Some(job) = jobs.get_mut(id) else {
            tracing::debug!(job_id = id, "Update for unknown job ignored");
            return false;
        };
        if !f(job) {
            return false;
        }

        let Some(watchers) = watchers.get_mut(id) else {
            return true;
        };
        if watchers.is_empty() {
            return true;
        }

        let snapshot = Arc::new(job.clone());
        watchers.retain(|w| match w.tx.try_send(Arc::clone(&snapshot)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                let count = self.dropped_updates.fetch_add(1, Ordering::Relaxed) + 1;
                if count == 1 || count % 100 == 0 {
                    tracing::warn!(
                        job_id = id,
                        watcher_id = w.id,
                        dropped_total = count,
                        "Subscriber buffer full, job update dropped"
                    );
                }
                true
            }
            // Receiver went away without unsubscribing.
            Err(TrySendError::Closed(_)) => false,
        });
        true
    }

    fn read_inner(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| {
            tracing::error!("RwLock poisoned reading job table: {e}");
            e.into_inner()
        })
    }

    fn write_inner(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| {
            tracing::error!("RwLock poisoned writing job table: {e}");
            e.into_inner()
        })
    }
}

/// Delete a job's output directory. A directory that is already gone is
/// not an error.
pub async fn remove_output_dir(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => tracing::debug!(path = %dir.display(), "Removed output directory"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %dir.display(), error = %e, "Failed to remove output directory"),
    }
}

fn apply_status(
    id: &str,
    job: &mut Job,
    status: JobStatus,
    message: String,
    data: Option<HashMap<String, String>>,
    operation: Option<String>,
) -> bool {
    if job.status.is_terminal() && !status.is_terminal() {
        tracing::warn!(job_id = id, from = %job.status, to = %status, "Ignoring transition out of terminal status");
        return false;
    }

    job.status = status;
    job.message = message;
    if let Some(data) = data {
        job.data = data;
    }
    if let Some(operation) = operation {
        job.operation = Some(operation);
    }
    if status.is_terminal() && job.completed_at.is_none() {
        job.completed_at = Some(Utc::now());
    }
    true
}

/// Push channel for one job's snapshots.
///
/// Yields `None` once the subscription is closed: after the job is cleaned
/// up or swept. Dropping it unsubscribes.
pub struct Subscription {
    store: Weak<JobStore>,
    job_id: String,
    watcher_id: u64,
    rx: mpsc::Receiver<Arc<Job>>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Arc<Job>> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Result<Arc<Job>, mpsc::error::TryRecvError> {
        self.rx.try_recv()
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Remove this subscriber and close its channel.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(store) = self.store.upgrade() {
            store.unsubscribe(&self.job_id, self.watcher_id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("job_id", &self.job_id)
            .field("watcher_id", &self.watcher_id)
            .finish()
    }
}
