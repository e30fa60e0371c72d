//! Background task queue
//!
//! Work is submitted with a stage and a document id and runs on the tokio
//! runtime, bounded by a semaphore. Callers poll [`TaskQueue::status`] or
//! await [`TaskQueue::wait`]. Finished results are kept for a retention
//! window and then purged.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{DocumentId, PipelineStage};

pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_HARD_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_SOFT_TIMEOUT_SECS: u64 = 240;
pub const DEFAULT_RETENTION_SECS: u64 = 3600;

/// Worker pool sizing and per-task deadlines
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskConfig {
    pub workers: usize,
    /// Tasks running longer than this fail with a timeout
    pub hard_timeout_secs: u64,
    /// Tasks running longer than this log a warning
    pub soft_timeout_secs: u64,
    /// How long finished results stay queryable
    pub retention_secs: u64,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            hard_timeout_secs: DEFAULT_HARD_TIMEOUT_SECS,
            soft_timeout_secs: DEFAULT_SOFT_TIMEOUT_SECS,
            retention_secs: DEFAULT_RETENTION_SECS,
        }
    }
}

impl TaskConfig {
    pub fn hard_timeout(&self) -> Duration {
        Duration::from_secs(self.hard_timeout_secs)
    }

    pub fn soft_timeout(&self) -> Duration {
        Duration::from_secs(self.soft_timeout_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

/// Opaque task identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| format!("Invalid task id '{}': {}", s, e))
    }
}

/// Observable status of a submitted task
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "result", rename_all = "snake_case")]
pub enum TaskStatus<T> {
    Pending,
    Running,
    Succeeded(T),
    Failed(String),
}

impl<T> TaskStatus<T> {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded(_) | Self::Failed(_))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded(_) => "succeeded",
            Self::Failed(_) => "failed",
        }
    }
}

struct TaskRecord<T> {
    stage: PipelineStage,
    document_id: DocumentId,
    status: Arc<watch::Sender<TaskStatus<T>>>,
    finished_at: Option<Instant>,
}

type TaskMap<T> = Arc<Mutex<HashMap<TaskId, TaskRecord<T>>>>;

fn lock_tasks<T>(
    tasks: &Mutex<HashMap<TaskId, TaskRecord<T>>>,
) -> MutexGuard<'_, HashMap<TaskId, TaskRecord<T>>> {
    tasks.lock().unwrap_or_else(|poisoned| {
        warn!("Recovering poisoned task table lock");
        poisoned.into_inner()
    })
}

/// Bounded worker pool with cached results
pub struct TaskQueue<T> {
    permits: Arc<Semaphore>,
    retention: Duration,
    tasks: TaskMap<T>,
}

impl<T> TaskQueue<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(workers: usize, retention: Duration) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(workers.max(1))),
            retention,
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_config(config: &TaskConfig) -> Self {
        Self::new(config.workers, config.retention())
    }

    /// Queue `work` and return its id immediately.
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit<F>(&self, stage: PipelineStage, document_id: DocumentId, work: F) -> TaskId
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        self.purge_expired();

        let task_id = TaskId::new();
        let (tx, _rx) = watch::channel(TaskStatus::Pending);
        let status = Arc::new(tx);
        lock_tasks(&self.tasks).insert(
            task_id,
            TaskRecord {
                stage,
                document_id,
                status: Arc::clone(&status),
                finished_at: None,
            },
        );
        debug!(task_id = %task_id, document_id = %document_id, stage = %stage, "Task submitted");

        let permits = Arc::clone(&self.permits);
        let tasks = Arc::clone(&self.tasks);
        tokio::spawn(async move {
            let final_status = match permits.acquire_owned().await {
                Ok(_permit) => {
                    status.send_replace(TaskStatus::Running);
                    let started = Instant::now();
                    match work.await {
                        Ok(output) => {
                            info!(
                                task_id = %task_id,
                                stage = %stage,
                                elapsed_ms = started.elapsed().as_millis() as u64,
                                "Task succeeded"
                            );
                            TaskStatus::Succeeded(output)
                        }
                        Err(e) => {
                            error!(task_id = %task_id, stage = %stage, error = %e, "Task failed");
                            TaskStatus::Failed(e.to_string())
                        }
                    }
                }
                Err(_) => TaskStatus::Failed("worker pool is shut down".to_string()),
            };
            status.send_replace(final_status);
            if let Some(record) = lock_tasks(&tasks).get_mut(&task_id) {
                record.finished_at = Some(Instant::now());
            }
        });

        task_id
    }

    /// Current status. Unknown and expired ids are NotFound.
    pub fn status(&self, task_id: TaskId) -> Result<TaskStatus<T>> {
        self.purge_expired();
        let tasks = lock_tasks(&self.tasks);
        let record = tasks
            .get(&task_id)
            .ok_or_else(|| Error::NotFound(format!("task {}", task_id)))?;
        let status = record.status.borrow().clone();
        Ok(status)
    }

    /// Stage and document a task was submitted for
    pub fn describe(&self, task_id: TaskId) -> Result<(PipelineStage, DocumentId)> {
        let tasks = lock_tasks(&self.tasks);
        tasks
            .get(&task_id)
            .map(|r| (r.stage, r.document_id))
            .ok_or_else(|| Error::NotFound(format!("task {}", task_id)))
    }

    /// Wait until the task succeeds or fails
    pub async fn wait(&self, task_id: TaskId) -> Result<TaskStatus<T>> {
        let mut rx = {
            self.purge_expired();
            let tasks = lock_tasks(&self.tasks);
            tasks
                .get(&task_id)
                .map(|r| r.status.subscribe())
                .ok_or_else(|| Error::NotFound(format!("task {}", task_id)))?
        };
        let status = rx
            .wait_for(|s| s.is_terminal())
            .await
            .map_err(|_| Error::NotFound(format!("task {}", task_id)))?;
        Ok(status.clone())
    }

    /// Number of tasks still tracked (running or within retention)
    pub fn len(&self) -> usize {
        lock_tasks(&self.tasks).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn purge_expired(&self) {
        let retention = self.retention;
        let mut tasks = lock_tasks(&self.tasks);
        let before = tasks.len();
        tasks.retain(|_, record| match record.finished_at {
            Some(finished) => finished.elapsed() < retention,
            None => true,
        });
        let purged = before - tasks.len();
        if purged > 0 {
            debug!(purged, "Purged expired task results");
        }
    }
}

/// Run `work` under a soft and a hard deadline.
///
/// Passing the soft deadline logs a warning and keeps waiting; passing the
/// hard deadline drops the work and returns [`Error::TaskTimeout`].
pub async fn run_with_deadlines<T, F>(
    stage: PipelineStage,
    document_id: DocumentId,
    soft: Duration,
    hard: Duration,
    work: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let started = Instant::now();
    let hard_deadline = started + hard;
    tokio::pin!(work);

    if soft < hard {
        tokio::select! {
            result = &mut work => return result,
            _ = tokio::time::sleep_until(started + soft) => {
                warn!(
                    document_id = %document_id,
                    stage = %stage,
                    soft_timeout_secs = soft.as_secs_f64(),
                    "Task passed soft timeout, still running"
                );
            }
        }
    }

    match tokio::time::timeout_at(hard_deadline, work).await {
        Ok(result) => result,
        Err(_) => {
            error!(document_id = %document_id, stage = %stage, "Task hit hard timeout");
            Err(Error::TaskTimeout {
                stage: stage.as_str(),
                secs: hard.as_secs(),
            })
        }
    }
}
