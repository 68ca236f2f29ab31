//! The dispatch loop.
//!
//! One task owns the queue, the worker pool and every timer. It wakes on a new
//! device, a worker completion, a timer, a control message or shutdown, applies
//! that input, and then scans the queue to start whatever became ready. The
//! scan stops as soon as no worker is idle; nothing polls.

use std::sync::Arc;
use std::time::Duration;

use hotplug_core::{DaemonConfig, Device, Execution, FailureKind, Outcome, SeqNum, Terminal};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;

use crate::finalizer::Finalized;
use crate::pool::{WorkerCompletion, WorkerId, WorkerPool};
use crate::queue::{DependencyResolver, DevpathResolver, EventQueue, Ready};
use crate::retry::{self, RetryPolicy};
use crate::runner::{Job, RuleRunner};
use crate::source::EventSource;
use crate::timers::{TimerKind, TimerSet};

/// Limits the dispatch loop runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    pub workers: usize,
    pub event_timeout: Duration,
    pub timeout_warning: Duration,
    pub retry: RetryPolicy,
    pub shutdown_timeout: Duration,
}

impl From<&DaemonConfig> for EngineSettings {
    fn from(config: &DaemonConfig) -> Self {
        Self {
            workers: config.children_max,
            event_timeout: config.event_timeout(),
            timeout_warning: config.timeout_warning(),
            retry: RetryPolicy::from(config),
            shutdown_timeout: config.shutdown_timeout(),
        }
    }
}

/// Requests the control socket sends into the loop.
///
/// Control messages are read after pending devices, so a `Settle` covers every
/// device sent before it.
#[derive(Debug)]
pub enum ControlMessage {
    Status(oneshot::Sender<EngineStatus>),
    SetPaused {
        paused: bool,
        respond_to: oneshot::Sender<bool>,
    },
    /// Answered once the queue is empty.
    Settle(oneshot::Sender<()>),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub received: u64,
    pub dispatched: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub deferred: u64,
    pub forced: u64,
    pub timed_out: u64,
    pub timeout_warnings: u64,
    pub dependency_check_failures: u64,
    pub stale_completions: u64,
    pub discarded: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineStatus {
    pub queued: usize,
    pub running: usize,
    pub deferred: usize,
    pub workers: usize,
    pub busy_workers: usize,
    pub paused: bool,
    pub stats: EngineStats,
}

pub struct Engine<R, Dr = DevpathResolver> {
    settings: EngineSettings,
    queue: EventQueue<Dr>,
    pool: WorkerPool,
    timers: TimerSet,
    runner: Arc<R>,
    completions_tx: mpsc::UnboundedSender<WorkerCompletion>,
    completions_rx: mpsc::UnboundedReceiver<WorkerCompletion>,
    finalized: mpsc::UnboundedSender<Finalized>,
    settle_waiters: Vec<oneshot::Sender<()>>,
    paused: bool,
    draining: bool,
    stats: EngineStats,
}

impl<R: RuleRunner> Engine<R, DevpathResolver> {
    pub fn new(
        settings: EngineSettings,
        runner: Arc<R>,
        finalized: mpsc::UnboundedSender<Finalized>,
    ) -> Self {
        Self::with_resolver(settings, runner, finalized, DevpathResolver)
    }
}

impl<R: RuleRunner, Dr: DependencyResolver> Engine<R, Dr> {
    pub fn with_resolver(
        settings: EngineSettings,
        runner: Arc<R>,
        finalized: mpsc::UnboundedSender<Finalized>,
        resolver: Dr,
    ) -> Self {
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        Self {
            settings,
            queue: EventQueue::new(resolver),
            pool: WorkerPool::new(settings.workers),
            timers: TimerSet::new(),
            runner,
            completions_tx,
            completions_rx,
            finalized,
            settle_waiters: Vec::new(),
            paused: false,
            draining: false,
            stats: EngineStats::default(),
        }
    }

    /// Run until `shutdown` fires, then drain. Returns the final counters.
    ///
    /// A closed `source` or `control` channel only disables that input.
    pub async fn run<S: EventSource>(
        mut self,
        mut source: S,
        mut control: mpsc::Receiver<ControlMessage>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> EngineStats {
        let mut source_open = true;
        let mut control_open = true;
        tracing::info!(workers = self.pool.size(), "dispatch loop started");

        loop {
            self.dispatch_ready();
            self.notify_settled();

            tokio::select! {
                biased;
                _ = shutdown.recv() => break,
                Some(done) = self.completions_rx.recv() => self.on_completion(done),
                Some(kind) = self.timers.next_expired(), if !self.timers.is_empty() => {
                    self.on_timer(kind);
                }
                device = source.receive_next_event(), if source_open => match device {
                    Some(device) => self.on_device(device),
                    None => {
                        tracing::info!("event source closed");
                        source_open = false;
                    }
                },
                message = control.recv(), if control_open => match message {
                    Some(message) => self.on_control(message),
                    None => control_open = false,
                },
            }
        }

        drop(source);
        self.drain().await;
        tracing::info!(stats = ?self.stats, "dispatch loop stopped");
        self.stats
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            queued: self.queue.len(),
            running: self.queue.running_count(),
            deferred: self.queue.deferred_count(),
            workers: self.pool.size(),
            busy_workers: self.pool.busy_count(),
            paused: self.paused,
            stats: self.stats.clone(),
        }
    }

    fn on_device(&mut self, device: Device) {
        self.stats.received += 1;
        let devpath = device.devpath.clone();
        let action = device.action;
        let seq = self.queue.enqueue(device, Instant::now());
        tracing::debug!(seq = %seq, %action, devpath = %devpath, "event queued");
    }

    /// Start ready events while a worker is idle.
    fn dispatch_ready(&mut self) {
        if self.paused || self.draining {
            return;
        }
        let now = Instant::now();
        while let Some(worker) = self.pool.acquire_idle() {
            let Some(ready) = self.queue.next_ready(now) else {
                break;
            };
            if !self.start(worker, ready, now) {
                break;
            }
        }
    }

    fn start(&mut self, worker: WorkerId, ready: Ready, now: Instant) -> bool {
        let seq = ready.seq;
        let Some(event) = self.queue.get(seq) else {
            return false;
        };
        let job = Job {
            seq,
            action: event.action(),
            device: event.device().clone(),
            ignore_lock: ready.forced,
        };
        let waited = now.saturating_duration_since(event.received_at);
        if !self
            .pool
            .start(worker, job, self.runner.clone(), self.completions_tx.clone())
        {
            return false;
        }

        let Some(event) = self.queue.get_mut(seq) else {
            return false;
        };
        retry::resume_event(event, &mut self.timers);
        event.assigned_worker = Some(worker);
        event.lock_forced = ready.forced;
        event.timeout_warning_timer = Some(
            self.timers
                .arm(TimerKind::TimeoutWarning(seq), self.settings.timeout_warning),
        );
        event.timeout_kill_timer = Some(
            self.timers
                .arm(TimerKind::TimeoutKill(seq), self.settings.event_timeout),
        );

        self.stats.dispatched += 1;
        if let Some(err) = &ready.degraded {
            self.stats.dependency_check_failures += 1;
            tracing::warn!(seq = %seq, error = %err, "dependency check failed, dispatching unordered");
        }
        if ready.forced {
            self.stats.forced += 1;
            tracing::warn!(seq = %seq, "device still locked at retry ceiling, running with lock ignored");
        }
        tracing::debug!(seq = %seq, %worker, waited_ms = waited.as_millis() as u64, "event dispatched");
        true
    }

    fn on_completion(&mut self, done: WorkerCompletion) {
        let WorkerCompletion {
            worker,
            seq,
            execution,
        } = done;
        if !self.pool.release(worker, seq) {
            self.stats.stale_completions += 1;
            tracing::debug!(seq = %seq, %worker, "ignoring stale completion");
            return;
        }

        let Some(event) = self.queue.get_mut(seq) else {
            self.stats.stale_completions += 1;
            return;
        };
        for key in [
            event.timeout_warning_timer.take(),
            event.timeout_kill_timer.take(),
        ]
        .into_iter()
        .flatten()
        {
            self.timers.disarm(key);
        }
        event.assigned_worker = None;
        let forced = std::mem::take(&mut event.lock_forced);

        let Execution { device, outcome } = execution;
        let terminal = match outcome {
            Outcome::Success => Terminal::Succeeded,
            Outcome::RuleEngineFailure(reason) => {
                tracing::warn!(seq = %seq, devpath = %device.devpath, %reason, "rules failed");
                Terminal::Failed(FailureKind::RuleEngine(reason))
            }
            Outcome::DeviceLocked if forced => {
                tracing::error!(seq = %seq, devpath = %device.devpath, "device stayed locked after forced run");
                Terminal::Failed(FailureKind::LockTimeout)
            }
            Outcome::DeviceLocked if self.draining => Terminal::Failed(FailureKind::Shutdown),
            Outcome::DeviceLocked => {
                retry::defer_event(event, &mut self.timers, &self.settings.retry, Instant::now());
                self.stats.deferred += 1;
                tracing::debug!(seq = %seq, devpath = %device.devpath, "device locked, event deferred");
                return;
            }
        };
        self.finish(seq, terminal, Some(device));
    }

    fn on_timer(&mut self, kind: TimerKind) {
        let seq = kind.seq();
        let Some(event) = self.queue.get_mut(seq) else {
            return;
        };
        match kind {
            TimerKind::Retry(_) => {
                // The key died with the expiry; the scan that follows does the work.
                event.retry_timer = None;
                retry::rearm_if_waiting(event, &mut self.timers, Instant::now());
            }
            TimerKind::TimeoutWarning(_) => {
                event.timeout_warning_timer = None;
                if let Some(worker) = event.assigned_worker {
                    self.stats.timeout_warnings += 1;
                    tracing::warn!(
                        seq = %seq,
                        %worker,
                        devpath = %event.devpath(),
                        elapsed_secs = event.received_at.elapsed().as_secs(),
                        "event is taking long",
                    );
                }
            }
            TimerKind::TimeoutKill(_) => {
                event.timeout_kill_timer = None;
                let Some(worker) = event.assigned_worker.take() else {
                    return;
                };
                tracing::error!(seq = %seq, %worker, devpath = %event.devpath(), "event timed out, killing worker");
                self.pool.kill(worker, seq);
                self.stats.timed_out += 1;
                self.finish(seq, Terminal::Failed(FailureKind::WorkerTimeout), None);
            }
        }
    }

    fn on_control(&mut self, message: ControlMessage) {
        match message {
            ControlMessage::Status(respond_to) => {
                let _ = respond_to.send(self.status());
            }
            ControlMessage::SetPaused { paused, respond_to } => {
                if self.paused != paused {
                    tracing::info!(paused, "queue execution toggled");
                }
                self.paused = paused;
                let _ = respond_to.send(paused);
            }
            ControlMessage::Settle(respond_to) => self.settle_waiters.push(respond_to),
        }
    }

    fn notify_settled(&mut self) {
        if !self.queue.is_empty() || self.settle_waiters.is_empty() {
            return;
        }
        for waiter in self.settle_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    /// Remove `seq` from the queue and hand its terminal state to the
    /// finalizer. Without a `device`, the original snapshot is used.
    fn finish(&mut self, seq: SeqNum, terminal: Terminal, device: Option<Device>) {
        let Some(mut event) = self.queue.remove(seq) else {
            return;
        };
        for key in event.take_timers() {
            self.timers.disarm(key);
        }
        let device = device.unwrap_or_else(|| event.into_device());

        if terminal.is_success() {
            self.stats.succeeded += 1;
        } else {
            self.stats.failed += 1;
        }
        tracing::info!(seq = %seq, action = %device.action, devpath = %device.devpath, success = terminal.is_success(), "event finished");

        let finalized = Finalized {
            seq,
            terminal,
            device,
        };
        if self.finalized.send(finalized).is_err() {
            tracing::error!(seq = %seq, "finalizer is gone, terminal state dropped");
        }
    }

    /// Stop taking work: discard unstarted events, give running ones until
    /// the shutdown timeout, then kill the rest.
    async fn drain(&mut self) {
        self.draining = true;

        let unstarted = self.queue.unstarted();
        for seq in &unstarted {
            if let Some(mut event) = self.queue.remove(*seq) {
                for key in event.take_timers() {
                    self.timers.disarm(key);
                }
            }
        }
        if !unstarted.is_empty() {
            self.stats.discarded += unstarted.len() as u64;
            tracing::warn!(count = unstarted.len(), "discarding events that never started");
        }

        let deadline = Instant::now() + self.settings.shutdown_timeout;
        while self.pool.busy_count() > 0 {
            tokio::select! {
                Some(done) = self.completions_rx.recv() => self.on_completion(done),
                Some(kind) = self.timers.next_expired(), if !self.timers.is_empty() => {
                    self.on_timer(kind);
                }
                _ = tokio::time::sleep_until(deadline) => break,
            }
        }

        for (worker, seq) in self.pool.kill_all() {
            tracing::warn!(seq = %seq, %worker, "killing worker at shutdown");
            self.finish(seq, Terminal::Failed(FailureKind::Shutdown), None);
        }
        self.timers.clear();
        self.notify_settled();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::PassthroughRunner;
    use hotplug_core::Action;

    fn settings(workers: usize) -> EngineSettings {
        EngineSettings {
            workers,
            event_timeout: Duration::from_secs(180),
            timeout_warning: Duration::from_secs(60),
            retry: RetryPolicy {
                interval: Duration::from_secs(1),
                timeout: Duration::from_secs(10),
            },
            shutdown_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn settings_follow_config() {
        let config = DaemonConfig {
            children_max: 3,
            event_timeout_secs: 90,
            ..DaemonConfig::default()
        };
        let settings = EngineSettings::from(&config);
        assert_eq!(settings.workers, 3);
        assert_eq!(settings.event_timeout, Duration::from_secs(90));
        assert_eq!(settings.timeout_warning, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn scan_fills_idle_workers_only() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut engine = Engine::new(settings(2), Arc::new(PassthroughRunner), tx);
        for path in ["/devices/a", "/devices/b", "/devices/c"] {
            engine.on_device(Device::new(path, Action::Add, "x"));
        }
        engine.dispatch_ready();

        let status = engine.status();
        assert_eq!(status.queued, 3);
        assert_eq!(status.running, 2);
        assert_eq!(status.busy_workers, 2);
        assert_eq!(status.stats.dispatched, 2);
    }

    #[tokio::test]
    async fn paused_engine_starts_nothing() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut engine = Engine::new(settings(2), Arc::new(PassthroughRunner), tx);
        let (respond_to, answer) = oneshot::channel();
        engine.on_control(ControlMessage::SetPaused {
            paused: true,
            respond_to,
        });
        assert_eq!(answer.await, Ok(true));

        engine.on_device(Device::new("/devices/a", Action::Add, "x"));
        engine.dispatch_ready();
        assert_eq!(engine.status().running, 0);
    }

    struct LockedRunner;

    impl RuleRunner for LockedRunner {
        fn run(&self, job: Job) -> impl std::future::Future<Output = Execution> + Send {
            std::future::ready(Execution::locked(job.device))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retry_timer_lives_only_while_deferred() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut engine = Engine::new(settings(1), Arc::new(LockedRunner), tx);
        engine.on_device(Device::new("/devices/block/sda", Action::Change, "block"));
        engine.dispatch_ready();

        let done = engine.completions_rx.recv().await.expect("completion");
        engine.on_completion(done);
        let event = engine.queue.get(SeqNum(1)).expect("deferred event");
        assert!(event.is_deferred());
        assert!(event.has_retry_timer());

        tokio::time::advance(Duration::from_secs(10)).await;
        engine.dispatch_ready();
        let event = engine.queue.get(SeqNum(1)).expect("forced event");
        assert!(event.is_running());
        assert!(event.lock_forced);
        assert!(!event.has_retry_timer(), "forced run disarms the retry timer");
        assert_eq!(engine.stats.forced, 1);
    }

    #[tokio::test]
    async fn completion_finalizes_once_and_frees_worker() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut engine = Engine::new(settings(1), Arc::new(PassthroughRunner), tx);
        engine.on_device(Device::new("/devices/a", Action::Add, "x"));
        engine.dispatch_ready();

        let done = engine.completions_rx.recv().await.expect("completion");
        engine.on_completion(done);

        assert!(engine.queue.is_empty());
        assert!(engine.timers.is_empty(), "timeout timers disarmed");
        assert_eq!(engine.pool.busy_count(), 0);
        let finalized = rx.try_recv().expect("finalized");
        assert_eq!(finalized.seq, SeqNum(1));
        assert_eq!(finalized.terminal, Terminal::Succeeded);
        assert!(rx.try_recv().is_err());
    }
}
