//! In-process supervisor for archive jobs.
//!
//! Each job runs on its own worker thread and reports progress lines over a
//! channel. At most one job may be running against a given target directory;
//! jobs against different directories share nothing and run in parallel.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, anyhow, bail};
use log::{info, warn};

use crate::progress::{CancelToken, ProgressSink};

pub type JobId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Running,
    Completed,
    Failed(String),
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSnapshot {
    pub id: JobId,
    pub target: PathBuf,
    pub status: JobStatus,
    pub started_at: u64,
    pub finished_at: Option<u64>,
    pub output: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    Progress { id: JobId, line: String },
    Finished { id: JobId, status: JobStatus },
}

struct JobRecord {
    target: PathBuf,
    status: JobStatus,
    started_at: u64,
    finished_at: Option<u64>,
    output: Vec<String>,
    cancel: CancelToken,
    handle: Option<JoinHandle<()>>,
}

impl JobRecord {
    fn snapshot(&self, id: JobId) -> JobSnapshot {
        JobSnapshot {
            id,
            target: self.target.clone(),
            status: self.status.clone(),
            started_at: self.started_at,
            finished_at: self.finished_at,
            output: self.output.clone(),
        }
    }
}

#[derive(Default)]
struct Registry {
    next_id: JobId,
    jobs: BTreeMap<JobId, JobRecord>,
}

#[derive(Clone, Default)]
pub struct JobManager {
    inner: Arc<Mutex<Registry>>,
}

/// Progress sink handed to a job's work function.
struct JobProgress {
    id: JobId,
    sender: Sender<JobEvent>,
    registry: Arc<Mutex<Registry>>,
}

impl ProgressSink for JobProgress {
    fn report(&self, message: &str) {
        if let Ok(mut registry) = self.registry.lock()
            && let Some(record) = registry.jobs.get_mut(&self.id)
        {
            record.output.push(message.to_string());
        }
        // The receiver may already be gone; output is still captured above.
        let _ = self.sender.send(JobEvent::Progress {
            id: self.id,
            line: message.to_string(),
        });
    }
}

impl JobManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts `work` on a new worker thread.
    ///
    /// Refused while another job is running against the same target.
    pub fn start<F>(&self, target: &Path, work: F) -> Result<(JobId, Receiver<JobEvent>)>
    where
        F: FnOnce(&dyn ProgressSink, &CancelToken) -> Result<()> + Send + 'static,
    {
        let target = normalize_target(target)?;
        let cancel = CancelToken::new();
        let (sender, receiver) = mpsc::channel();
        let id = {
            let mut registry = self.lock()?;
            if let Some((running, _)) = registry
                .jobs
                .iter()
                .find(|(_, record)| record.target == target && record.status == JobStatus::Running)
            {
                bail!(
                    "job {running} is already running against {}",
                    target.display()
                );
            }
            registry.next_id += 1;
            let id = registry.next_id;
            registry.jobs.insert(
                id,
                JobRecord {
                    target: target.clone(),
                    status: JobStatus::Running,
                    started_at: unix_timestamp()?,
                    finished_at: None,
                    output: Vec::new(),
                    cancel: cancel.clone(),
                    handle: None,
                },
            );
            id
        };
        info!(
            "event=job_started module=jobs id={id} target={}",
            target.display()
        );

        let registry = Arc::clone(&self.inner);
        let spawned = thread::Builder::new()
            .name(format!("wdarchive-job-{id}"))
            .spawn(move || {
                let progress = JobProgress {
                    id,
                    sender: sender.clone(),
                    registry: Arc::clone(&registry),
                };
                let status = match work(&progress, &cancel) {
                    Ok(()) if cancel.is_cancelled() => JobStatus::Cancelled,
                    Ok(()) => JobStatus::Completed,
                    Err(error) => JobStatus::Failed(format!("{error:#}")),
                };
                finish(&registry, id, &status);
                let _ = sender.send(JobEvent::Finished { id, status });
            });

        let mut registry = self.lock()?;
        match spawned {
            Ok(handle) => {
                if let Some(record) = registry.jobs.get_mut(&id) {
                    record.handle = Some(handle);
                }
                Ok((id, receiver))
            }
            Err(error) => {
                registry.jobs.remove(&id);
                Err(error).context("failed to spawn job worker thread")
            }
        }
    }

    /// Raises the job's cancel token; returns whether it was still running.
    pub fn cancel(&self, id: JobId) -> Result<bool> {
        let registry = self.lock()?;
        let record = registry
            .jobs
            .get(&id)
            .ok_or_else(|| anyhow!("unknown job {id}"))?;
        if record.status != JobStatus::Running {
            return Ok(false);
        }
        record.cancel.cancel();
        info!("event=job_cancel_requested module=jobs id={id}");
        Ok(true)
    }

    pub fn status(&self, id: JobId) -> Result<Option<JobSnapshot>> {
        let registry = self.lock()?;
        Ok(registry.jobs.get(&id).map(|record| record.snapshot(id)))
    }

    pub fn list(&self) -> Result<Vec<JobSnapshot>> {
        let registry = self.lock()?;
        Ok(registry
            .jobs
            .iter()
            .map(|(id, record)| record.snapshot(*id))
            .collect())
    }

    /// Blocks until the job's worker exits and returns its final snapshot.
    pub fn wait(&self, id: JobId) -> Result<JobSnapshot> {
        let handle = {
            let mut registry = self.lock()?;
            let record = registry
                .jobs
                .get_mut(&id)
                .ok_or_else(|| anyhow!("unknown job {id}"))?;
            record.handle.take()
        };
        if let Some(handle) = handle
            && handle.join().is_err()
        {
            warn!("event=job_panicked module=jobs id={id}");
            finish(&self.inner, id, &JobStatus::Failed("worker panicked".to_string()));
        }
        self.status(id)?
            .ok_or_else(|| anyhow!("job {id} vanished from the registry"))
    }

    fn lock(&self) -> Result<MutexGuard<'_, Registry>> {
        self.inner
            .lock()
            .map_err(|_| anyhow!("job registry lock poisoned"))
    }
}

fn finish(registry: &Mutex<Registry>, id: JobId, status: &JobStatus) {
    let Ok(mut registry) = registry.lock() else {
        warn!("event=job_finish_unrecorded module=jobs id={id}");
        return;
    };
    if let Some(record) = registry.jobs.get_mut(&id)
        && record.status == JobStatus::Running
    {
        record.status = status.clone();
        record.finished_at = unix_timestamp().ok();
        info!("event=job_finished module=jobs id={id} status={status:?}");
    }
}

/// Creates the target first so every spelling of it resolves to one path.
fn normalize_target(target: &Path) -> Result<PathBuf> {
    fs::create_dir_all(target)
        .with_context(|| format!("failed to create {}", target.display()))?;
    fs::canonicalize(target).with_context(|| format!("failed to resolve {}", target.display()))
}

fn unix_timestamp() -> Result<u64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock is before UNIX_EPOCH")
        .map(|duration| duration.as_secs())
}
