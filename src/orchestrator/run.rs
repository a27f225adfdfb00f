//! A single execution of a task.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
    time::Instant,
};

use derive_more::Display;
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{messages::TaskRequest, registry::TaskKind, utils::lock};

/// The phase of a [`TaskRun`]. Phases are ordered and a run only ever moves forward.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum TaskPhase {
    #[display(fmt = "NotStarted")]
    NotStarted,
    #[display(fmt = "BroadcastingStart")]
    BroadcastingStart,
    #[display(fmt = "Accumulating")]
    Accumulating,
    #[display(fmt = "ComputingStats")]
    ComputingStats,
    #[display(fmt = "BroadcastingResults")]
    BroadcastingResults,
    #[display(fmt = "Done")]
    Done,
    #[display(fmt = "Failed")]
    Failed,
}

impl TaskPhase {
    /// Whether the run is over.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskPhase::Done | TaskPhase::Failed)
    }
}

/// A running (or finished) task.
#[derive(Debug)]
pub struct TaskRun {
    id: Uuid,
    request: TaskRequest,
    started: Instant,
    barrier: AtomicBool,
    phase: Mutex<watch::Sender<TaskPhase>>,
    // keeps the channel open and serves the current phase
    phase_rx: watch::Receiver<TaskPhase>,
}

impl TaskRun {
    pub(crate) fn new(request: TaskRequest) -> Self {
        let (tx, rx) = watch::channel(TaskPhase::NotStarted);
        Self {
            id: Uuid::new_v4(),
            request,
            started: Instant::now(),
            barrier: AtomicBool::new(false),
            phase: Mutex::new(tx),
            phase_rx: rx,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn request(&self) -> TaskRequest {
        self.request
    }

    pub fn kind(&self) -> TaskKind {
        self.request.kind()
    }

    /// The instant the run was created.
    pub fn started(&self) -> Instant {
        self.started
    }

    /// The current phase.
    pub fn phase(&self) -> TaskPhase {
        *self.phase_rx.borrow()
    }

    /// Whether the run still accepts messages.
    pub fn is_active(&self) -> bool {
        !self.phase().is_terminal()
    }

    /// Listens to the phase changes of the run.
    pub fn subscribe(&self) -> watch::Receiver<TaskPhase> {
        self.phase_rx.clone()
    }

    /// Moves the run to `phase`.
    ///
    /// Returns `false` and leaves the run untouched if the run already is in `phase` or past it.
    pub(crate) fn advance(&self, phase: TaskPhase) -> bool {
        let tx = lock(&self.phase);
        let current = *self.phase_rx.borrow();
        if phase <= current || current.is_terminal() {
            if phase != current {
                warn!(
                    "task {} cannot move back from {} to {}",
                    self.id, current, phase
                );
            }
            return false;
        }
        debug!("task {}: {} -> {}", self.id, current, phase);
        // the run holds a receiver, so the channel is never closed
        let _ = tx.send(phase);
        true
    }

    /// Claims the completion of the run. Only the first caller gets `true`.
    pub(crate) fn try_fire(&self) -> bool {
        self.barrier
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Whether the completion of the run was claimed.
    pub fn barrier_fired(&self) -> bool {
        self.barrier.load(Ordering::SeqCst)
    }
}
