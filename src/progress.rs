use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use indicatif::HumanBytes;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::scheduler::{TaskId, TaskKind};

#[derive(Debug, Clone)]
pub enum QueueEvent {
    Enqueued { id: TaskId, name: String, kind: TaskKind },
    Started { id: TaskId, name: String },
    Status { id: TaskId, text: String },
    Progress { id: TaskId, progress: TaskProgress },
    Completed { id: TaskId },
    Failed { id: TaskId, error: String },
    Cancelled { id: TaskId },
    Removed { id: TaskId },
    /// The queue ran dry and the scheduler went idle.
    Drained,
}

impl QueueEvent {
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            Self::Enqueued { id, .. }
            | Self::Started { id, .. }
            | Self::Status { id, .. }
            | Self::Progress { id, .. }
            | Self::Completed { id }
            | Self::Failed { id, .. }
            | Self::Cancelled { id }
            | Self::Removed { id } => Some(*id),
            Self::Drained => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskProgress {
    pub completed_units: u64,
    pub total_units: u64,
    pub unit_percent: f64,
    pub overall_percent: f64,
    pub bytes_per_sec: Option<f64>,
}

/// Unit counters of one task. Shared between the scheduler's bookkeeping and
/// the reporter handed to the work function.
#[derive(Debug, Default)]
pub struct UnitCounters {
    total: AtomicU64,
    completed: AtomicU64,
}

impl UnitCounters {
    pub fn new(total: u64) -> Self {
        Self {
            total: AtomicU64::new(total),
            completed: AtomicU64::new(0),
        }
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }
}

#[derive(Clone)]
pub struct ProgressReporter {
    id: TaskId,
    events: broadcast::Sender<QueueEvent>,
    units: Arc<UnitCounters>,
    interval: Duration,
}

impl ProgressReporter {
    pub fn new(
        id: TaskId,
        events: broadcast::Sender<QueueEvent>,
        units: Arc<UnitCounters>,
        interval: Duration,
    ) -> Self {
        Self {
            id,
            events,
            units,
            interval,
        }
    }

    pub fn detached() -> Self {
        let (events, _) = broadcast::channel(16);
        Self::new(0, events, Arc::new(UnitCounters::new(1)), Duration::from_secs(1))
    }

    pub fn task_id(&self) -> TaskId {
        self.id
    }

    pub fn status(&self, text: impl Into<String>) {
        self.emit(QueueEvent::Status {
            id: self.id,
            text: text.into(),
        });
    }

    pub fn set_total_units(&self, total: u64) {
        self.units.total.store(total, Ordering::Relaxed);
        self.report(0.0, None);
    }

    pub fn complete_unit(&self) {
        self.units.completed.fetch_add(1, Ordering::Relaxed);
        self.report(0.0, None);
    }

    pub fn meter(&self, label: impl Into<String>, unit: MeterUnit, total: Option<u64>) -> TransferMeter {
        TransferMeter {
            reporter: self.clone(),
            label: label.into(),
            unit,
            total,
            last_at: Instant::now(),
            last_done: 0,
        }
    }

    fn report(&self, unit_percent: f64, bytes_per_sec: Option<f64>) {
        let total_units = self.units.total();
        let completed_units = self.units.completed();
        let overall_percent = if total_units > 0 {
            ((completed_units as f64 + unit_percent / 100.0) / total_units as f64 * 100.0).min(100.0)
        } else {
            0.0
        };
        self.emit(QueueEvent::Progress {
            id: self.id,
            progress: TaskProgress {
                completed_units,
                total_units,
                unit_percent,
                overall_percent,
                bytes_per_sec,
            },
        });
    }

    fn emit(&self, event: QueueEvent) {
        // No subscribers is a normal state, not an error.
        let _ = self.events.send(event);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeterUnit {
    Bytes,
    Segments,
}

/// Measures one transfer and reports through its task's reporter, at most
/// once per interval plus once on [`TransferMeter::finish`].
pub struct TransferMeter {
    reporter: ProgressReporter,
    label: String,
    unit: MeterUnit,
    total: Option<u64>,
    last_at: Instant,
    last_done: u64,
}

impl TransferMeter {
    /// Start measuring from an already reached position (resumed bytes or
    /// cached segments) so throughput only counts this session.
    pub fn resume_from(&mut self, done: u64) {
        self.last_done = done;
    }

    /// Returns true when an update was actually emitted.
    pub fn update(&mut self, done: u64) -> bool {
        let now = Instant::now();
        if now.duration_since(self.last_at) < self.reporter.interval {
            return false;
        }
        self.emit(now, done);
        true
    }

    pub fn finish(&mut self, done: u64) {
        self.emit(Instant::now(), done);
    }

    fn emit(&mut self, now: Instant, done: u64) {
        let elapsed = now.duration_since(self.last_at).as_secs_f64();
        let speed = match self.unit {
            MeterUnit::Bytes if elapsed > 0.0 => {
                Some(done.saturating_sub(self.last_done) as f64 / elapsed)
            }
            _ => None,
        };
        let percent = match self.total {
            Some(total) if total > 0 => (done as f64 / total as f64 * 100.0).min(100.0),
            _ => 0.0,
        };

        let text = match (self.unit, self.total) {
            (MeterUnit::Segments, Some(total)) => format!("{} ({}/{})", self.label, done, total),
            (MeterUnit::Segments, None) => format!("{} ({})", self.label, done),
            (MeterUnit::Bytes, Some(total)) if total > 0 => format!(
                "{} ({:.0}%) {}/s",
                self.label,
                percent.floor(),
                HumanBytes(speed.unwrap_or(0.0) as u64)
            ),
            (MeterUnit::Bytes, _) => {
                format!("{} {}/s", self.label, HumanBytes(speed.unwrap_or(0.0) as u64))
            }
        };
        self.reporter.status(text);
        self.reporter.report(percent, speed);

        self.last_at = now;
        self.last_done = done;
    }
}
