//! Fixed-size pool of worker slots.
//!
//! Slots are created once and live as long as the daemon. Each assignment runs
//! in its own spawned task; the slot keeps the task handle so a stuck execution
//! can be aborted. The pool never holds a reference to an event, only its
//! sequence number.

use std::fmt;
use std::sync::Arc;

use hotplug_core::{Execution, SeqNum};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::runner::{Job, RuleRunner};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct WorkerId(pub usize);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Idle,
    Busy,
}

/// Completion signal sent by a worker task to the dispatch loop.
#[derive(Debug)]
pub struct WorkerCompletion {
    pub worker: WorkerId,
    pub seq: SeqNum,
    pub execution: Execution,
}

#[derive(Debug)]
struct WorkerSlot {
    id: WorkerId,
    state: WorkerState,
    current_event: Option<SeqNum>,
    task: Option<JoinHandle<()>>,
    assignments: u64,
}

impl WorkerSlot {
    fn new(id: WorkerId) -> Self {
        Self {
            id,
            state: WorkerState::Idle,
            current_event: None,
            task: None,
            assignments: 0,
        }
    }

    fn reset(&mut self) -> Option<JoinHandle<()>> {
        self.state = WorkerState::Idle;
        self.current_event = None;
        self.task.take()
    }
}

#[derive(Debug)]
pub struct WorkerPool {
    slots: Vec<WorkerSlot>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        Self {
            slots: (0..size).map(|i| WorkerSlot::new(WorkerId(i))).collect(),
        }
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    pub fn busy_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.state == WorkerState::Busy)
            .count()
    }

    /// First idle slot, if any.
    pub fn acquire_idle(&self) -> Option<WorkerId> {
        self.slots
            .iter()
            .find(|s| s.state == WorkerState::Idle)
            .map(|s| s.id)
    }

    pub fn state(&self, id: WorkerId) -> Option<WorkerState> {
        self.slots.get(id.0).map(|s| s.state)
    }

    /// Event the worker is running, `None` while idle.
    pub fn current(&self, id: WorkerId) -> Option<SeqNum> {
        self.slots.get(id.0).and_then(|s| s.current_event)
    }

    pub fn assignments(&self, id: WorkerId) -> u64 {
        self.slots.get(id.0).map(|s| s.assignments).unwrap_or(0)
    }

    /// Run `job` on the idle worker `id`; the result comes back on `completions`.
    ///
    /// Returns `false` without spawning anything if the slot is not idle.
    pub fn start<R: RuleRunner>(
        &mut self,
        id: WorkerId,
        job: Job,
        runner: Arc<R>,
        completions: mpsc::UnboundedSender<WorkerCompletion>,
    ) -> bool {
        let Some(slot) = self.slots.get_mut(id.0) else {
            return false;
        };
        if slot.state != WorkerState::Idle {
            tracing::error!(worker = %id, seq = %job.seq, "refusing to assign a busy worker");
            return false;
        }

        let seq = job.seq;
        let task = tokio::spawn(async move {
            let execution = runner.run(job).await;
            let _ = completions.send(WorkerCompletion {
                worker: id,
                seq,
                execution,
            });
        });

        slot.state = WorkerState::Busy;
        slot.current_event = Some(seq);
        slot.task = Some(task);
        slot.assignments += 1;
        true
    }

    /// Busy → Idle after a completion for `seq`. `false` if the worker was not
    /// running `seq` (a stale completion).
    pub fn release(&mut self, id: WorkerId, seq: SeqNum) -> bool {
        match self.slots.get_mut(id.0) {
            Some(slot) if slot.current_event == Some(seq) => {
                slot.reset();
                true
            }
            _ => false,
        }
    }

    /// Abort the execution of `seq` on worker `id` and mark the slot idle.
    pub fn kill(&mut self, id: WorkerId, seq: SeqNum) -> bool {
        match self.slots.get_mut(id.0) {
            Some(slot) if slot.current_event == Some(seq) => {
                if let Some(task) = slot.reset() {
                    task.abort();
                }
                true
            }
            _ => false,
        }
    }

    /// Abort every running execution; returns what was running where.
    pub fn kill_all(&mut self) -> Vec<(WorkerId, SeqNum)> {
        let mut killed = Vec::new();
        for slot in &mut self.slots {
            if let Some(seq) = slot.current_event {
                if let Some(task) = slot.reset() {
                    task.abort();
                }
                killed.push((slot.id, seq));
            }
        }
        killed
    }

    pub fn busy(&self) -> impl Iterator<Item = (WorkerId, SeqNum)> + '_ {
        self.slots
            .iter()
            .filter_map(|s| s.current_event.map(|seq| (s.id, seq)))
    }
}
