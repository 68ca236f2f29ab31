//! Timers owned by the dispatch loop.
//!
//! All event timers live in one `DelayQueue`; the loop awaits
//! [`TimerSet::next_expired`] alongside its other inputs, so a timer firing is
//! just another wake-up. Each armed timer is represented by a [`TimerKey`]
//! held by exactly one event; disarming consumes the key.

use std::time::Duration;

use hotplug_core::SeqNum;
use tokio_util::time::{delay_queue, DelayQueue};

/// What a timer is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Wake the loop to reconsider a deferred event.
    Retry(SeqNum),
    /// Soft deadline of a running event.
    TimeoutWarning(SeqNum),
    /// Hard deadline of a running event.
    TimeoutKill(SeqNum),
}

impl TimerKind {
    pub fn seq(&self) -> SeqNum {
        match self {
            TimerKind::Retry(seq) | TimerKind::TimeoutWarning(seq) | TimerKind::TimeoutKill(seq) => {
                *seq
            }
        }
    }
}

/// Handle of an armed timer. Not `Clone`: one owner per timer.
#[derive(Debug, PartialEq, Eq)]
pub struct TimerKey(delay_queue::Key);

#[derive(Debug, Default)]
pub struct TimerSet {
    queue: DelayQueue<TimerKind>,
}

impl TimerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&mut self, kind: TimerKind, after: Duration) -> TimerKey {
        TimerKey(self.queue.insert(kind, after))
    }

    /// Cancel a timer. Returns what it was for, or `None` if it already fired.
    pub fn disarm(&mut self, key: TimerKey) -> Option<TimerKind> {
        self.queue.try_remove(&key.0).map(|expired| expired.into_inner())
    }

    /// Wait for the next timer to fire. Cancel safe.
    ///
    /// Resolves to `None` immediately when nothing is armed; callers guard
    /// with [`TimerSet::is_empty`].
    pub async fn next_expired(&mut self) -> Option<TimerKind> {
        std::future::poll_fn(|cx| self.queue.poll_expired(cx))
            .await
            .map(|expired| expired.into_inner())
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn fires_in_deadline_order() {
        let mut timers = TimerSet::new();
        let _late = timers.arm(TimerKind::TimeoutKill(SeqNum(1)), Duration::from_secs(3));
        let _early = timers.arm(TimerKind::Retry(SeqNum(2)), Duration::from_secs(1));
        let start = Instant::now();

        assert_eq!(timers.next_expired().await, Some(TimerKind::Retry(SeqNum(2))));
        let elapsed = start.elapsed();
        assert!(
            elapsed >= Duration::from_secs(1) && elapsed < Duration::from_millis(1100),
            "fired after {elapsed:?}"
        );
        assert_eq!(
            timers.next_expired().await,
            Some(TimerKind::TimeoutKill(SeqNum(1)))
        );
        assert!(timers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn disarmed_timer_never_fires() {
        let mut timers = TimerSet::new();
        let key = timers.arm(TimerKind::Retry(SeqNum(5)), Duration::from_millis(200));
        let _other = timers.arm(TimerKind::TimeoutWarning(SeqNum(6)), Duration::from_secs(1));

        assert_eq!(timers.disarm(key), Some(TimerKind::Retry(SeqNum(5))));
        assert_eq!(timers.len(), 1);
        assert_eq!(
            timers.next_expired().await,
            Some(TimerKind::TimeoutWarning(SeqNum(6)))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn disarm_after_fire_is_none() {
        let mut timers = TimerSet::new();
        let key = timers.arm(TimerKind::Retry(SeqNum(1)), Duration::from_millis(10));
        assert!(timers.next_expired().await.is_some());
        assert_eq!(timers.disarm(key), None);
    }

    #[test]
    fn kind_carries_seq() {
        assert_eq!(TimerKind::TimeoutKill(SeqNum(9)).seq(), SeqNum(9));
    }
}
