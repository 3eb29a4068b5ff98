//! Single-flight task queue. Tasks run one after another in enqueue order.

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::Result;
use crate::progress::{ProgressReporter, QueueEvent, UnitCounters};
use crate::store::SessionStore;

pub type TaskId = u64;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Track,
    Video,
    Album,
}

impl TaskKind {
    /// Units known before the work function starts. Albums learn their
    /// track count at run time.
    fn initial_units(self) -> u64 {
        match self {
            Self::Track | Self::Video => 1,
            Self::Album => 0,
        }
    }
}

pub struct TaskContext {
    pub id: TaskId,
    pub token: CancellationToken,
    pub reporter: ProgressReporter,
}

type WorkFn = Box<dyn FnOnce(TaskContext) -> BoxFuture<'static, Result<()>> + Send>;

pub struct TaskSpec {
    name: String,
    kind: TaskKind,
    work: WorkFn,
}

impl TaskSpec {
    pub fn new<F, Fut>(name: impl Into<String>, kind: TaskKind, work: F) -> Self
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            kind,
            work: Box::new(move |ctx| work(ctx).boxed()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    pub id: TaskId,
    pub name: String,
    pub kind: TaskKind,
    pub total_units: u64,
    pub completed_units: u64,
}

#[derive(Debug, Clone, Default)]
pub struct QueueSnapshot {
    pub active: Option<TaskInfo>,
    pub pending: Vec<TaskInfo>,
}

struct PendingTask {
    id: TaskId,
    spec: TaskSpec,
}

struct ActiveTask {
    id: TaskId,
    name: String,
    kind: TaskKind,
    token: CancellationToken,
    units: Arc<UnitCounters>,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<PendingTask>,
    active: Option<ActiveTask>,
    driving: bool,
    next_id: TaskId,
}

struct Inner {
    state: Mutex<QueueState>,
    events: broadcast::Sender<QueueEvent>,
    idle: watch::Sender<bool>,
    store: Arc<dyn SessionStore>,
    progress_interval: Duration,
}

impl Inner {
    fn emit(&self, event: QueueEvent) {
        let _ = self.events.send(event);
    }
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn SessionStore>, event_capacity: usize, progress_interval: Duration) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(16));
        let (idle, _) = watch::channel(true);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState {
                    next_id: 1,
                    ..Default::default()
                }),
                events,
                idle,
                store,
                progress_interval,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    /// Append a task; it starts right away when nothing else is running.
    /// Must be called from within a tokio runtime.
    pub fn enqueue(&self, spec: TaskSpec) -> TaskId {
        let mut state = self.inner.state.lock();
        let id = state.next_id;
        state.next_id += 1;

        info!(id, name = spec.name(), kind = ?spec.kind(), "Task queued");
        self.inner.emit(QueueEvent::Enqueued {
            id,
            name: spec.name.clone(),
            kind: spec.kind,
        });
        state.pending.push_back(PendingTask { id, spec });

        if !state.driving {
            state.driving = true;
            self.inner.idle.send_replace(false);
            tokio::spawn(drive(self.inner.clone()));
        }
        id
    }

    /// Cancel the running task only. Returns whether one was running.
    pub fn cancel_current(&self) -> bool {
        let state = self.inner.state.lock();
        match &state.active {
            Some(active) => {
                info!(id = active.id, name = %active.name, "Cancelling current task");
                active.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Drop a task that has not started yet. The running task and the order
    /// of the others are left alone.
    pub fn cancel_pending(&self, id: TaskId) -> bool {
        let mut state = self.inner.state.lock();
        let Some(position) = state.pending.iter().position(|p| p.id == id) else {
            return false;
        };
        if let Some(removed) = state.pending.remove(position) {
            info!(id, name = removed.spec.name(), "Removed pending task");
            self.inner.emit(QueueEvent::Removed { id });
        }
        true
    }

    /// Clear the pending queue, then cancel the running task.
    pub fn cancel_all(&self) {
        let mut state = self.inner.state.lock();
        for removed in state.pending.drain(..) {
            self.inner.emit(QueueEvent::Removed { id: removed.id });
        }
        if let Some(active) = &state.active {
            active.token.cancel();
        }
        info!("Cancelled all tasks");
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let state = self.inner.state.lock();
        QueueSnapshot {
            active: state.active.as_ref().map(|a| TaskInfo {
                id: a.id,
                name: a.name.clone(),
                kind: a.kind,
                total_units: a.units.total(),
                completed_units: a.units.completed(),
            }),
            pending: state
                .pending
                .iter()
                .map(|p| TaskInfo {
                    id: p.id,
                    name: p.spec.name.clone(),
                    kind: p.spec.kind,
                    total_units: p.spec.kind.initial_units(),
                    completed_units: 0,
                })
                .collect(),
        }
    }

    pub fn is_idle(&self) -> bool {
        *self.inner.idle.borrow()
    }

    pub async fn wait_idle(&self) {
        let mut idle = self.inner.idle.subscribe();
        let _ = idle.wait_for(|idle| *idle).await;
    }
}

async fn drive(inner: Arc<Inner>) {
    loop {
        let next = {
            let mut state = inner.state.lock();
            state.pending.pop_front().map(|task| {
                let token = CancellationToken::new();
                let units = Arc::new(UnitCounters::new(task.spec.kind.initial_units()));
                state.active = Some(ActiveTask {
                    id: task.id,
                    name: task.spec.name.clone(),
                    kind: task.spec.kind,
                    token: token.clone(),
                    units: units.clone(),
                });
                inner.emit(QueueEvent::Started {
                    id: task.id,
                    name: task.spec.name.clone(),
                });
                (task, token, units)
            })
        };

        let Some((task, token, units)) = next else {
            // Release the per-run store state before declaring the queue idle;
            // anything enqueued meanwhile keeps this driver going.
            inner.store.end_run().await;
            let mut state = inner.state.lock();
            if !state.pending.is_empty() {
                continue;
            }
            state.driving = false;
            inner.emit(QueueEvent::Drained);
            inner.idle.send_replace(true);
            info!("Queue drained");
            return;
        };

        let id = task.id;
        let name = task.spec.name;
        info!(id, name = %name, "Task started");

        let ctx = TaskContext {
            id,
            token: token.clone(),
            reporter: ProgressReporter::new(id, inner.events.clone(), units, inner.progress_interval),
        };
        let outcome = tokio::spawn((task.spec.work)(ctx)).await;

        let event = match outcome {
            Ok(Ok(())) => {
                info!(id, name = %name, "Task completed");
                QueueEvent::Completed { id }
            }
            Ok(Err(e)) if e.is_cancelled() || token.is_cancelled() => {
                info!(id, name = %name, "Task cancelled");
                QueueEvent::Cancelled { id }
            }
            Ok(Err(e)) => {
                warn!(id, name = %name, error = %e, "Task failed");
                QueueEvent::Failed {
                    id,
                    error: e.to_string(),
                }
            }
            Err(join_error) => {
                error!(id, name = %name, error = %join_error, "Task panicked");
                QueueEvent::Failed {
                    id,
                    error: format!("task panicked: {}", join_error),
                }
            }
        };

        let mut state = inner.state.lock();
        state.active = None;
        inner.emit(event);
    }
}
