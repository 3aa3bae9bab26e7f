//! Async job manager for long-running RPC operations
//!
//! Profile imports (and anything else that outlives an RPC deadline) run as
//! jobs: `create` hands back a slot the worker thread updates, the RPC
//! surface polls `status`, `cancel` flips pending/running jobs into the
//! canceled error state, and `commit` consumes a finished result
//! transactionally - the slot is only destroyed when the apply function
//! succeeds.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info};

use lfc_error::{LfcError, Result};
use lfc_protocol::{JobState, JobStatus, Profile};

struct JobInner {
    state: JobState,
    progress: u8,
    message: String,
    error: String,
    result: Option<Profile>,
}

/// One job's shared slot. Workers hold the `Arc` and update it; the manager
/// keeps it addressable by id.
pub struct JobSlot {
    id: String,
    cancel: AtomicBool,
    inner: Mutex<JobInner>,
}

impl JobSlot {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Workers check this at suspend points and between stages.
    pub fn canceled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    /// Move to running and report progress. Terminal states are not
    /// overwritten (a canceled job stays canceled).
    pub fn set_progress(&self, progress: u8, message: &str) {
        let mut inner = self.inner.lock();
        if matches!(inner.state, JobState::Done | JobState::Error) {
            return;
        }
        inner.state = JobState::Running;
        inner.progress = progress.min(100);
        inner.message = message.to_string();
    }

    pub fn fail(&self, error: impl Into<String>) {
        let mut inner = self.inner.lock();
        if matches!(inner.state, JobState::Done | JobState::Error) {
            return;
        }
        inner.state = JobState::Error;
        inner.error = error.into();
        inner.progress = 0;
    }

    pub fn finish(&self, profile: Profile) {
        let mut inner = self.inner.lock();
        if matches!(inner.state, JobState::Done | JobState::Error) {
            return;
        }
        inner.state = JobState::Done;
        inner.progress = 100;
        inner.message = "done".to_string();
        inner.result = Some(profile);
    }

    pub fn status(&self) -> JobStatus {
        let inner = self.inner.lock();
        JobStatus {
            job_id: self.id.clone(),
            state: inner.state,
            progress: inner.progress,
            message: inner.message.clone(),
            error: inner.error.clone(),
            profile_name: inner
                .result
                .as_ref()
                .map(|p| p.name.clone())
                .unwrap_or_default(),
        }
    }
}

/// Owner of all job slots. Ids are unique within the process lifetime.
#[derive(Default)]
pub struct JobManager {
    jobs: Mutex<BTreeMap<String, Arc<JobSlot>>>,
    next_id: AtomicU64,
}

impl JobManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a pending job slot.
    pub fn create(&self) -> Arc<JobSlot> {
        let id = format!("job-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let slot = Arc::new(JobSlot {
            id: id.clone(),
            cancel: AtomicBool::new(false),
            inner: Mutex::new(JobInner {
                state: JobState::Pending,
                progress: 0,
                message: String::new(),
                error: String::new(),
                result: None,
            }),
        });
        self.jobs.lock().insert(id.clone(), slot.clone());
        debug!(job = %id, "job created");
        slot
    }

    fn get(&self, id: &str) -> Result<Arc<JobSlot>> {
        self.jobs
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| LfcError::not_found(format!("job '{}'", id)))
    }

    pub fn status(&self, id: &str) -> Result<JobStatus> {
        Ok(self.get(id)?.status())
    }

    pub fn list(&self) -> Vec<JobStatus> {
        self.jobs.lock().values().map(|s| s.status()).collect()
    }

    /// Cancel a pending or running job. Finished jobs are not cancelable.
    pub fn cancel(&self, id: &str) -> Result<()> {
        let slot = self.get(id)?;
        let mut inner = slot.inner.lock();
        match inner.state {
            JobState::Pending | JobState::Running => {
                slot.cancel.store(true, Ordering::Release);
                inner.state = JobState::Error;
                inner.error = "canceled".to_string();
                info!(job = %id, "job canceled");
                Ok(())
            }
            JobState::Done | JobState::Error => {
                Err(LfcError::busy(format!("job '{}' not cancelable", id)))
            }
        }
    }

    /// Take a finished job's result, apply it, and destroy the slot. The
    /// slot survives a failing apply so the commit can be retried.
    pub fn commit<F>(&self, id: &str, apply: F) -> Result<Value>
    where
        F: FnOnce(Profile) -> Result<Value>,
    {
        let slot = self.get(id)?;
        let profile = {
            let inner = slot.inner.lock();
            match inner.state {
                JobState::Done => inner.result.clone().ok_or_else(|| {
                    LfcError::internal(format!("job '{}' done without result", id))
                })?,
                JobState::Error => {
                    return Err(LfcError::invalid(format!(
                        "job '{}' failed: {}",
                        id, inner.error
                    )))
                }
                _ => return Err(LfcError::busy(format!("job '{}' not finished", id))),
            }
        };

        let out = apply(profile)?;
        self.jobs.lock().remove(id);
        info!(job = %id, "job committed");
        Ok(out)
    }
}
