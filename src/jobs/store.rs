//! Durable job table.
//!
//! The store owns the canonical copy of every job. Updates are merged
//! field-by-field and flushed to disk on a short debounce so progress ticks
//! coalesce into one write instead of hitting the disk each time.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{info, warn};

use crate::jobs::{Job, JobPatch, JobStatus, RESTART_FAILURE_REASON};

pub struct JobStore {
    jobs: Mutex<HashMap<String, Job>>,
    dirty: Notify,
    path: PathBuf,
}

impl JobStore {
    /// Load the persisted table, rewriting any job that was still in flight
    /// when the previous process died. In-flight work cannot be resumed across
    /// a restart (the scheduler and its controllers are purely in-memory), so
    /// a non-terminal status on disk means the render was lost.
    pub fn load(path: PathBuf) -> Self {
        let mut jobs = HashMap::new();
        let mut recovered = 0usize;

        match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<Vec<Job>>(&bytes) {
                Ok(records) => {
                    for mut job in records {
                        if !job.status.is_terminal() {
                            job.status = JobStatus::Failed;
                            job.error = Some(RESTART_FAILURE_REASON.to_string());
                            recovered += 1;
                        }
                        jobs.insert(job.job_id.clone(), job);
                    }
                }
                Err(e) => {
                    warn!("job table at {} is unreadable, starting empty: {}", path.display(), e);
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!("could not read job table at {}: {}", path.display(), e);
            }
        }

        if recovered > 0 {
            info!("marked {} interrupted job(s) as failed after restart", recovered);
        }

        let store = Self {
            jobs: Mutex::new(jobs),
            dirty: Notify::new(),
            path,
        };
        if recovered > 0 {
            if let Err(e) = store.persist_blocking() {
                warn!("could not persist recovered job table: {}", e);
            }
        }
        store
    }

    pub fn create(&self, job: Job) {
        self.jobs
            .lock()
            .unwrap()
            .insert(job.job_id.clone(), job);
        self.dirty.notify_one();
    }

    /// Merge a patch into an existing job. Returns false when the id is
    /// unknown (e.g. a late progress tick after a forced cache clear).
    pub fn update(&self, job_id: &str, patch: JobPatch) -> bool {
        let mut jobs = self.jobs.lock().unwrap();
        let Some(job) = jobs.get_mut(job_id) else {
            return false;
        };
        patch.apply(job);
        drop(jobs);
        self.dirty.notify_one();
        true
    }

    pub fn get(&self, job_id: &str) -> Option<Job> {
        self.jobs.lock().unwrap().get(job_id).cloned()
    }

    /// All jobs, newest first.
    pub fn list(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.jobs.lock().unwrap().values().cloned().collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    /// True when any job is outside a terminal state.
    pub fn has_live_jobs(&self) -> bool {
        self.jobs
            .lock()
            .unwrap()
            .values()
            .any(|job| !job.status.is_terminal())
    }

    /// Drop every record. Used only by the cache administration wipe.
    pub fn clear(&self) {
        self.jobs.lock().unwrap().clear();
        self.dirty.notify_one();
    }

    fn snapshot(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.jobs.lock().unwrap().values().cloned().collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        jobs
    }

    /// Serialize the table to `<path>.tmp` and rename into place, so a crash
    /// mid-write never leaves a truncated table behind.
    async fn persist(&self) -> std::io::Result<()> {
        let bytes = serde_json::to_vec_pretty(&self.snapshot())?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    fn persist_blocking(&self) -> std::io::Result<()> {
        let bytes = serde_json::to_vec_pretty(&self.snapshot())?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Debounced writer: waits for a dirty signal, sleeps out the debounce
    /// window so rapid successive updates coalesce, then writes once.
    /// Persistence failures are logged and never fatal.
    pub fn spawn_persist_task(self: &Arc<Self>, debounce: Duration) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                store.dirty.notified().await;
                tokio::time::sleep(debounce).await;
                if let Err(e) = store.persist().await {
                    warn!("failed to persist job table to {}: {}", store.path.display(), e);
                }
            }
        })
    }
}
