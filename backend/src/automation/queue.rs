// Execution Queue - Worker pool that serializes executions per entity
//
// Each entity owns a FIFO lane. A lane is handed to at most one worker at a
// time, so two executions for the same entity never overlap while different
// entities run in parallel.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::{AutomationRule, TriggerEvent};

/// Work item for one execution
#[derive(Debug, Clone)]
pub struct QueuedExecution {
    pub execution_id: Uuid,
    pub entity_id: Uuid,
    pub rule: Arc<AutomationRule>,
    pub event: TriggerEvent,
}

#[async_trait]
pub trait ExecutionRunner: Send + Sync {
    async fn run(&self, job: QueuedExecution);

    /// Called when `run` panicked for `execution_id`.
    async fn abort(&self, _execution_id: Uuid, _reason: &str) {}
}

#[derive(Error, Debug, PartialEq)]
pub enum QueueError {
    #[error("Execution {0} is already scheduled")]
    AlreadyScheduled(Uuid),
    #[error("Execution queue is closed")]
    Closed,
}

#[derive(Default)]
struct Lane {
    pending: VecDeque<QueuedExecution>,
    active: Option<Uuid>,
}

#[derive(Default)]
struct State {
    lanes: HashMap<Uuid, Lane>,
    scheduled: HashSet<Uuid>,
    outstanding: usize,
}

pub struct ExecutionQueue {
    state: Mutex<State>,
    ready_tx: mpsc::UnboundedSender<Uuid>,
    ready_rx: Mutex<mpsc::UnboundedReceiver<Uuid>>,
    idle: Notify,
}

impl ExecutionQueue {
    pub fn new() -> Arc<Self> {
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            state: Mutex::new(State::default()),
            ready_tx,
            ready_rx: Mutex::new(ready_rx),
            idle: Notify::new(),
        })
    }

    /// Queue `job` behind any pending work for the same entity.
    pub async fn enqueue(&self, job: QueuedExecution) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        if !state.scheduled.insert(job.execution_id) {
            return Err(QueueError::AlreadyScheduled(job.execution_id));
        }

        let entity_id = job.entity_id;
        let new_lane = !state.lanes.contains_key(&entity_id);
        state.lanes.entry(entity_id).or_default().pending.push_back(job);

        if new_lane && self.ready_tx.send(entity_id).is_err() {
            if let Some(lane) = state.lanes.remove(&entity_id) {
                for job in lane.pending {
                    state.scheduled.remove(&job.execution_id);
                }
            }
            return Err(QueueError::Closed);
        }

        state.outstanding += 1;
        debug!("Queued execution for entity {} ({} outstanding)", entity_id, state.outstanding);
        Ok(())
    }

    /// Remove a pending execution. Returns `None` once a worker has taken it.
    pub async fn cancel(&self, execution_id: Uuid) -> Option<QueuedExecution> {
        let mut state = self.state.lock().await;
        let (entity_id, position) = state.lanes.iter().find_map(|(entity_id, lane)| {
            lane.pending
                .iter()
                .position(|job| job.execution_id == execution_id)
                .map(|position| (*entity_id, position))
        })?;

        let job = state.lanes.get_mut(&entity_id)?.pending.remove(position)?;
        state.scheduled.remove(&execution_id);
        state.outstanding -= 1;
        if state.outstanding == 0 {
            self.idle.notify_waiters();
        }
        Some(job)
    }

    pub async fn outstanding(&self) -> usize {
        self.state.lock().await.outstanding
    }

    /// Entities with queued or running work.
    pub async fn active_entities(&self) -> usize {
        self.state.lock().await.lanes.len()
    }

    /// Resolve once nothing is queued or running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.outstanding().await == 0 {
                return;
            }
            notified.await;
        }
    }

    pub fn spawn_workers(self: &Arc<Self>, count: usize, runner: Arc<dyn ExecutionRunner>) -> Vec<JoinHandle<()>> {
        let count = count.max(1);
        info!("Starting {} automation workers", count);
        (0..count)
            .map(|worker| {
                let queue = self.clone();
                let runner = runner.clone();
                tokio::spawn(async move { queue.worker_loop(worker, runner).await })
            })
            .collect()
    }

    async fn worker_loop(self: Arc<Self>, worker: usize, runner: Arc<dyn ExecutionRunner>) {
        loop {
            let entity_id = {
                let mut rx = self.ready_rx.lock().await;
                match rx.recv().await {
                    Some(entity_id) => entity_id,
                    None => break,
                }
            };

            let job = {
                let mut state = self.state.lock().await;
                match state.lanes.get_mut(&entity_id) {
                    Some(lane) => {
                        let job = lane.pending.pop_front();
                        lane.active = job.as_ref().map(|j| j.execution_id);
                        job
                    }
                    None => None,
                }
            };

            if let Some(job) = job {
                let execution_id = job.execution_id;
                debug!("Worker {} running execution {} for entity {}", worker, execution_id, entity_id);

                let task_runner = runner.clone();
                if let Err(e) = tokio::spawn(async move { task_runner.run(job).await }).await {
                    error!("Execution {} aborted: {}", execution_id, e);
                    runner.abort(execution_id, &format!("Execution aborted: {}", e)).await;
                }
                self.complete(entity_id, Some(execution_id)).await;
            } else {
                self.complete(entity_id, None).await;
            }
        }
        debug!("Worker {} stopped", worker);
    }

    async fn complete(&self, entity_id: Uuid, execution_id: Option<Uuid>) {
        let mut state = self.state.lock().await;
        if let Some(id) = execution_id {
            state.scheduled.remove(&id);
            state.outstanding = state.outstanding.saturating_sub(1);
        }

        let more = match state.lanes.get_mut(&entity_id) {
            Some(lane) => {
                lane.active = None;
                !lane.pending.is_empty()
            }
            None => false,
        };

        if more {
            if self.ready_tx.send(entity_id).is_err() {
                error!("Execution queue closed with work pending for entity {}", entity_id);
            }
        } else {
            state.lanes.remove(&entity_id);
        }

        if state.outstanding == 0 {
            self.idle.notify_waiters();
        }
    }
}
