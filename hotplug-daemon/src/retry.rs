//! Deferral of events whose device is locked by another program.
//!
//! An event is either runnable or deferred. A deferred event carries a
//! `next_retry_at` and a standing retry timer. The timer does nothing when it
//! fires except wake the dispatch loop; the loop's scan then finds the event
//! due and runs it again. Once `timeout_deadline` has passed the event runs
//! with the lock ignored.

use std::time::Duration;

use hotplug_core::DaemonConfig;
use tokio::time::Instant;

use crate::queue::Event;
use crate::timers::{TimerKind, TimerSet};

/// Retry interval and ceiling for lock deferral.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub timeout: Duration,
}

impl From<&DaemonConfig> for RetryPolicy {
    fn from(config: &DaemonConfig) -> Self {
        Self {
            interval: config.retry_interval(),
            timeout: config.lock_timeout(),
        }
    }
}

impl RetryPolicy {
    /// Runnable → Deferred.
    ///
    /// `next_retry_at` and `timeout_deadline` are only filled when unset, so a
    /// repeated deferral never pushes the ceiling further out.
    pub fn defer(&self, state: Option<RetryState>, now: Instant) -> RetryState {
        let mut state = state.unwrap_or(RetryState {
            next_retry_at: None,
            timeout_deadline: now + self.timeout,
        });
        if state.next_retry_at.is_none() {
            state.next_retry_at = Some(now + self.interval);
        }
        state
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    /// Set only while deferred.
    pub next_retry_at: Option<Instant>,
    pub timeout_deadline: Instant,
}

/// Whether a queued event may be tried at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Never deferred, or already resumed.
    Runnable,
    /// Deferred and the retry time has not come.
    Waiting,
    /// Deferred and due for another attempt.
    Retry,
    /// Past the ceiling; run regardless of the lock.
    Expired,
}

impl RetryState {
    pub fn is_deferred(&self) -> bool {
        self.next_retry_at.is_some()
    }

    pub fn readiness(&self, now: Instant) -> Readiness {
        if now >= self.timeout_deadline {
            return Readiness::Expired;
        }
        match self.next_retry_at {
            Some(at) if now < at => Readiness::Waiting,
            Some(_) => Readiness::Retry,
            None => Readiness::Runnable,
        }
    }
}

/// Defer `event` and arm its retry timer, replacing any previous one.
pub(crate) fn defer_event(
    event: &mut Event,
    timers: &mut TimerSet,
    policy: &RetryPolicy,
    now: Instant,
) {
    event.retry_state = Some(policy.defer(event.retry_state.take(), now));
    if let Some(previous) = event.retry_timer.take() {
        timers.disarm(previous);
    }
    event.retry_timer = Some(timers.arm(TimerKind::Retry(event.seq), policy.interval));
}

/// Deferred → Runnable: clear `next_retry_at` and release the retry timer.
pub(crate) fn resume_event(event: &mut Event, timers: &mut TimerSet) {
    if let Some(state) = event.retry_state.as_mut() {
        state.next_retry_at = None;
    }
    if let Some(key) = event.retry_timer.take() {
        timers.disarm(key);
    }
}

/// Re-arm the retry timer of an event that woke before it was due.
pub(crate) fn rearm_if_waiting(event: &mut Event, timers: &mut TimerSet, now: Instant) {
    if event.retry_timer.is_some() {
        return;
    }
    if let Some(RetryState {
        next_retry_at: Some(at),
        ..
    }) = event.retry_state
    {
        if at > now {
            event.retry_timer = Some(timers.arm(TimerKind::Retry(event.seq), at - now));
        }
    }
}
