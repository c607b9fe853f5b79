/// In-process job queue: named queues served by tokio worker tasks, with
/// per-job timeouts and single-parent dependencies.
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;

use crate::config::defs::{PipelineError, Stage, Tool};
use crate::pipelines::orchestrator::StageJob;


#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{:06}", self.0)
    }
}

impl Serialize for JobId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub id: JobId,
    pub queue: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Waiting on another job
    Deferred,
    Queued,
    Started,
    Finished,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Finished | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Deferred => "deferred",
            JobState::Queued => "queued",
            JobState::Started => "started",
            JobState::Finished => "finished",
            JobState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Descriptive fields carried by every job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobMeta {
    pub description: String,
    pub stage: Stage,
    pub tool: Tool,
    pub collection: String,
    pub subcollection: Option<String>,
}

/// Snapshot of a job as reported to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobInfo {
    pub id: JobId,
    pub description: String,
    pub status: JobState,
    pub stage_type: Stage,
    pub tool_name: Tool,
    pub collection: String,
    pub subcollection: Option<String>,
    pub is_queued: bool,
    pub is_started: bool,
    pub is_finished: bool,
    pub is_failed: bool,
    pub created_at: DateTime<Utc>,
    pub enqueued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub estimated_stage_seconds: u64,
    pub queue_name: String,
    pub queue_position: usize,
    pub estimated_queue_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<JobId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobInfo {
    pub fn to_json(&self) -> Result<String, PipelineError> {
        serde_json::to_string_pretty(self).map_err(|e| PipelineError::IOError(e.to_string()))
    }
}


struct JobRecord {
    id: JobId,
    queue: String,
    meta: JobMeta,
    command: Vec<String>,
    state: JobState,
    error: Option<String>,
    created_at: DateTime<Utc>,
    enqueued_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    timeout: Duration,
    depends_on: Option<JobId>,
    dependents: Vec<JobId>,
    /// Taken when the job starts or is abandoned
    job: Option<StageJob>,
}

#[derive(Default)]
struct QueueState {
    waiting: VecDeque<JobId>,
    notify: Arc<Notify>,
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<JobId, JobRecord>,
    queues: HashMap<String, QueueState>,
    next_id: u64,
}

impl Inner {
    fn queue_mut(&mut self, name: &str) -> &mut QueueState {
        self.queues.entry(name.to_string()).or_default()
    }

    fn push_waiting(&mut self, id: JobId) {
        let now = Utc::now();
        let Some(record) = self.jobs.get_mut(&id) else { return };
        record.state = JobState::Queued;
        record.enqueued_at = Some(now);
        let queue = record.queue.clone();
        let q = self.queue_mut(&queue);
        q.waiting.push_back(id);
        q.notify.notify_one();
    }

    /// Marks `id` and everything downstream of it as failed without running.
    fn fail_unstarted(&mut self, id: JobId, error: PipelineError) {
        let now = Utc::now();
        let mut pending = vec![(id, error)];
        while let Some((id, error)) = pending.pop() {
            let Some(record) = self.jobs.get_mut(&id) else { continue };
            warn!("{} will not run: {}", id, error);
            record.state = JobState::Failed;
            record.error = Some(error.to_string());
            record.ended_at = Some(now);
            record.job = None;
            for dependent in std::mem::take(&mut record.dependents) {
                pending.push((dependent, PipelineError::DependencyFailed {
                    job: dependent.to_string(),
                    dependency: id.to_string(),
                }));
            }
        }
    }

    fn info(&self, record: &JobRecord) -> JobInfo {
        let waiting = self.queues.get(&record.queue).map(|q| &q.waiting);
        let index = waiting.and_then(|w| w.iter().position(|&j| j == record.id));
        let (queue_position, estimated_queue_seconds) = match (waiting, index) {
            (Some(w), Some(i)) => {
                let ahead = w
                    .iter()
                    .take(i)
                    .filter_map(|j| self.jobs.get(j))
                    .map(|r| r.meta.stage.estimated_seconds())
                    .sum();
                (i, ahead)
            }
            (Some(w), None) => (w.len(), 0),
            (None, _) => (0, 0),
        };

        JobInfo {
            id: record.id,
            description: record.meta.description.clone(),
            status: record.state,
            stage_type: record.meta.stage,
            tool_name: record.meta.tool,
            collection: record.meta.collection.clone(),
            subcollection: record.meta.subcollection.clone(),
            is_queued: record.state == JobState::Queued,
            is_started: record.state == JobState::Started,
            is_finished: record.state == JobState::Finished,
            is_failed: record.state == JobState::Failed,
            created_at: record.created_at,
            enqueued_at: record.enqueued_at,
            started_at: record.started_at,
            ended_at: record.ended_at,
            estimated_stage_seconds: record.meta.stage.estimated_seconds(),
            queue_name: record.queue.clone(),
            queue_position,
            estimated_queue_seconds,
            depends_on: record.depends_on,
            error: record.error.clone(),
        }
    }
}


pub struct JobQueue {
    inner: Mutex<Inner>,
    changes: watch::Sender<u64>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        JobQueue {
            inner: Mutex::new(Inner::default()),
            changes,
            workers: Mutex::new(Vec::new()),
        }
    }

    fn bump(&self) {
        self.changes.send_modify(|v| *v = v.wrapping_add(1));
    }

    /// Spawns `workers` tasks serving each of `queues`. Must be called from
    /// within a tokio runtime.
    pub async fn start(self: &Arc<Self>, queues: &[&str], workers: usize) {
        let mut handles = self.workers.lock().await;
        for &name in queues {
            for n in 0..workers {
                debug!("Starting worker {} on queue {}", n, name);
                let queue = Arc::clone(self);
                let name = name.to_string();
                handles.push(tokio::spawn(async move { queue.worker(name).await }));
            }
        }
    }

    /// Aborts every worker. A job in progress is dropped, which kills its
    /// child process.
    pub async fn shutdown(&self) {
        for handle in self.workers.lock().await.drain(..) {
            handle.abort();
        }
    }

    async fn worker(self: Arc<Self>, name: String) {
        loop {
            let (next, notify) = {
                let mut inner = self.inner.lock().await;
                let q = inner.queue_mut(&name);
                let notify = Arc::clone(&q.notify);
                let next = q.waiting.pop_front();
                if !q.waiting.is_empty() {
                    notify.notify_one();
                }
                let next = next.and_then(|id| {
                    let record = inner.jobs.get_mut(&id)?;
                    record.state = JobState::Started;
                    record.started_at = Some(Utc::now());
                    Some((id, record.job.take()?, record.timeout))
                });
                (next, notify)
            };
            match next {
                Some((id, job, timeout)) => {
                    self.bump();
                    self.run_job(id, job, timeout).await;
                }
                None => notify.notified().await,
            }
        }
    }

    async fn run_job(&self, id: JobId, job: StageJob, timeout: Duration) {
        info!("{} started: {}", id, job.meta().description);
        let result = tokio::time::timeout(timeout, job.execute()).await;
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(_) => {
                if let Err(e) = job.record_timeout() {
                    error!("{}: could not record timeout: {}", id, e);
                }
                Err(PipelineError::Timeout { job: id.to_string(), seconds: timeout.as_secs() })
            }
        };
        drop(job);
        self.finish(id, outcome).await;
    }

    async fn finish(&self, id: JobId, outcome: Result<(), PipelineError>) {
        {
            let mut inner = self.inner.lock().await;
            let Some(record) = inner.jobs.get_mut(&id) else { return };
            record.ended_at = Some(Utc::now());
            let dependents = std::mem::take(&mut record.dependents);
            match outcome {
                Ok(()) => {
                    info!("{} finished", id);
                    record.state = JobState::Finished;
                    for dependent in dependents {
                        inner.push_waiting(dependent);
                    }
                }
                Err(e) => {
                    error!("{} failed: {}", id, e);
                    record.state = JobState::Failed;
                    record.error = Some(e.to_string());
                    for dependent in dependents {
                        inner.fail_unstarted(dependent, PipelineError::DependencyFailed {
                            job: dependent.to_string(),
                            dependency: id.to_string(),
                        });
                    }
                }
            }
        }
        self.bump();
    }

    /// Adds a job to `queue`. With `depends_on`, the job is held back until
    /// that job finishes successfully and is failed unrun if it does not.
    ///
    /// # Returns
    /// Handle of the new job; NotFound if `depends_on` is unknown.
    pub async fn enqueue(
        &self,
        queue: &str,
        job: StageJob,
        timeout: Duration,
        depends_on: Option<JobId>,
    ) -> Result<JobHandle, PipelineError> {
        let mut inner = self.inner.lock().await;
        let dependency_state = match depends_on {
            Some(dep) => Some(
                inner
                    .jobs
                    .get(&dep)
                    .map(|r| r.state)
                    .ok_or_else(|| PipelineError::NotFound(format!("Job {}", dep)))?,
            ),
            None => None,
        };

        inner.next_id += 1;
        let id = JobId(inner.next_id);
        let meta = job.meta();
        let command = job.run.command.clone();
        info!("Queueing {} on {}: {}", id, queue, meta.description);
        inner.jobs.insert(id, JobRecord {
            id,
            queue: queue.to_string(),
            meta,
            command,
            state: JobState::Deferred,
            error: None,
            created_at: Utc::now(),
            enqueued_at: None,
            started_at: None,
            ended_at: None,
            timeout,
            depends_on,
            dependents: Vec::new(),
            job: Some(job),
        });
        inner.queue_mut(queue);

        match (depends_on, dependency_state) {
            (Some(dep), Some(JobState::Failed)) => {
                inner.fail_unstarted(id, PipelineError::DependencyFailed {
                    job: id.to_string(),
                    dependency: dep.to_string(),
                });
            }
            (Some(dep), Some(state)) if !state.is_terminal() => {
                debug!("{} deferred until {} finishes", id, dep);
                if let Some(parent) = inner.jobs.get_mut(&dep) {
                    parent.dependents.push(id);
                }
            }
            _ => inner.push_waiting(id),
        }
        drop(inner);
        self.bump();
        Ok(JobHandle { id, queue: queue.to_string() })
    }

    pub async fn info(&self, id: JobId) -> Option<JobInfo> {
        let inner = self.inner.lock().await;
        inner.jobs.get(&id).map(|record| inner.info(record))
    }

    /// Index of the job among those waiting in its queue, or the number of
    /// waiting jobs if it is not waiting.
    pub async fn position(&self, id: JobId) -> Option<usize> {
        self.info(id).await.map(|info| info.queue_position)
    }

    /// Command line a job was queued with.
    pub async fn command(&self, id: JobId) -> Option<Vec<String>> {
        self.inner.lock().await.jobs.get(&id).map(|r| r.command.clone())
    }

    /// Every job ever queued, oldest first.
    pub async fn jobs(&self) -> Vec<JobInfo> {
        let inner = self.inner.lock().await;
        let mut ids: Vec<&JobId> = inner.jobs.keys().collect();
        ids.sort();
        ids.into_iter().filter_map(|id| inner.jobs.get(id)).map(|r| inner.info(r)).collect()
    }

    /// Resolves once the job has finished or failed.
    pub async fn wait(&self, id: JobId) -> Result<JobInfo, PipelineError> {
        let mut changes = self.changes.subscribe();
        loop {
            match self.info(id).await {
                None => return Err(PipelineError::NotFound(format!("Job {}", id))),
                Some(info) if info.status.is_terminal() => return Ok(info),
                Some(_) => {}
            }
            changes
                .changed()
                .await
                .map_err(|e| PipelineError::IOError(format!("Job queue closed: {}", e)))?;
        }
    }

    /// Resolves once no job is deferred, queued or running.
    pub async fn join_idle(&self) -> Result<(), PipelineError> {
        let mut changes = self.changes.subscribe();
        loop {
            let busy = {
                let inner = self.inner.lock().await;
                inner.jobs.values().any(|r| !r.state.is_terminal())
            };
            if !busy {
                return Ok(());
            }
            changes
                .changed()
                .await
                .map_err(|e| PipelineError::IOError(format!("Job queue closed: {}", e)))?;
        }
    }
}
