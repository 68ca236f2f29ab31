//! Ordered queue of pending events and the dependency-blocking check.
//!
//! Events are keyed by [`SeqNum`] in a `BTreeMap`, so iteration is always in
//! arrival order. An event stays in the queue while it waits, while it is
//! deferred by a device lock and while a worker runs it; it leaves exactly once,
//! through [`EventQueue::remove`].

use std::collections::BTreeMap;

use hotplug_core::{Action, DevPath, Device, SeqNum};
use tokio::time::Instant;

use crate::error::DependencyError;
use crate::pool::WorkerId;
use crate::retry::{Readiness, RetryState};
use crate::timers::TimerKey;

/// One in-flight device change.
#[derive(Debug)]
pub struct Event {
    pub(crate) seq: SeqNum,
    // Timer handles come before the device: fields drop in declaration order.
    pub(crate) retry_timer: Option<TimerKey>,
    pub(crate) timeout_warning_timer: Option<TimerKey>,
    pub(crate) timeout_kill_timer: Option<TimerKey>,
    pub(crate) action: Action,
    /// First earlier event found related to this one, if any.
    pub(crate) blocker: Option<SeqNum>,
    pub(crate) retry_state: Option<RetryState>,
    pub(crate) assigned_worker: Option<WorkerId>,
    /// Set when the current run was started past the lock ceiling.
    pub(crate) lock_forced: bool,
    pub(crate) received_at: Instant,
    pub(crate) device: Device,
}

impl Event {
    fn new(seq: SeqNum, device: Device, now: Instant) -> Self {
        Self {
            seq,
            retry_timer: None,
            timeout_warning_timer: None,
            timeout_kill_timer: None,
            action: device.action,
            blocker: None,
            retry_state: None,
            assigned_worker: None,
            lock_forced: false,
            received_at: now,
            device,
        }
    }

    pub fn seq(&self) -> SeqNum {
        self.seq
    }

    pub fn action(&self) -> Action {
        self.action
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn devpath(&self) -> &DevPath {
        &self.device.devpath
    }

    pub fn blocker(&self) -> Option<SeqNum> {
        self.blocker
    }

    pub fn assigned_worker(&self) -> Option<WorkerId> {
        self.assigned_worker
    }

    pub fn is_running(&self) -> bool {
        self.assigned_worker.is_some()
    }

    pub fn is_deferred(&self) -> bool {
        self.retry_state
            .as_ref()
            .map(RetryState::is_deferred)
            .unwrap_or(false)
    }

    pub fn retry_state(&self) -> Option<&RetryState> {
        self.retry_state.as_ref()
    }

    pub fn has_retry_timer(&self) -> bool {
        self.retry_timer.is_some()
    }

    /// Take every armed timer handle so the caller can disarm them.
    pub(crate) fn take_timers(&mut self) -> Vec<TimerKey> {
        [
            self.retry_timer.take(),
            self.timeout_warning_timer.take(),
            self.timeout_kill_timer.take(),
        ]
        .into_iter()
        .flatten()
        .collect()
    }

    pub(crate) fn into_device(self) -> Device {
        self.device
    }
}

/// Result of the dependency check for one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockState {
    Clear,
    BlockedBy(SeqNum),
    /// The check could not be completed; the event is treated as clear.
    DependencyCheckFailed(DependencyError),
}

/// An event that may start now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ready {
    pub seq: SeqNum,
    /// Present when the dependency check failed open.
    pub degraded: Option<DependencyError>,
    /// The lock ceiling elapsed; run regardless of the lock.
    pub forced: bool,
}

/// Decides whether two devices are causally related.
pub trait DependencyResolver: Send + 'static {
    fn related(&self, earlier: &Device, later: &Device) -> Result<bool, DependencyError>;
}

/// Relates devices through their sysfs paths, device numbers and interface
/// indexes.
#[derive(Debug, Clone, Copy, Default)]
pub struct DevpathResolver;

impl DependencyResolver for DevpathResolver {
    fn related(&self, earlier: &Device, later: &Device) -> Result<bool, DependencyError> {
        check_devpath(&earlier.devpath)?;
        check_devpath(&later.devpath)?;

        if earlier.devpath == later.devpath {
            return Ok(true);
        }
        if later.devpath_old.as_ref() == Some(&earlier.devpath)
            || earlier.devpath_old.as_ref() == Some(&later.devpath)
        {
            return Ok(true);
        }
        if later.devpath.is_descendant_of(&earlier.devpath)
            || earlier.devpath.is_descendant_of(&later.devpath)
        {
            return Ok(true);
        }
        if later.parent.as_ref() == Some(&earlier.devpath)
            || earlier.parent.as_ref() == Some(&later.devpath)
        {
            return Ok(true);
        }
        if let (Some(a), Some(b)) = (earlier.devnum, later.devnum) {
            if a == b {
                return Ok(true);
            }
        }
        if let (Some(a), Some(b)) = (earlier.ifindex, later.ifindex) {
            if a == b && a > 0 {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

fn check_devpath(devpath: &DevPath) -> Result<(), DependencyError> {
    if devpath.as_str().len() < 2 || !devpath.as_str().starts_with('/') {
        return Err(DependencyError::MalformedDevpath(devpath.to_string()));
    }
    Ok(())
}

/// Pending events in sequence order.
#[derive(Debug)]
pub struct EventQueue<Dr = DevpathResolver> {
    events: BTreeMap<SeqNum, Event>,
    last_seq: u64,
    resolver: Dr,
}

impl Default for EventQueue<DevpathResolver> {
    fn default() -> Self {
        Self::new(DevpathResolver)
    }
}

impl<Dr: DependencyResolver> EventQueue<Dr> {
    pub fn new(resolver: Dr) -> Self {
        Self {
            events: BTreeMap::new(),
            last_seq: 0,
            resolver,
        }
    }

    /// Create an event for `device` and append it; returns its sequence number.
    pub fn enqueue(&mut self, device: Device, now: Instant) -> SeqNum {
        self.last_seq += 1;
        let seq = SeqNum(self.last_seq);
        self.events.insert(seq, Event::new(seq, device, now));
        seq
    }

    /// Whether `seq` must wait for an earlier related event.
    ///
    /// Scans earlier events in ascending order and stops at the first related
    /// one, which is cached on the event. While the cached blocker is still
    /// queued it is returned without rescanning; once it is gone, scanning
    /// resumes from it, since everything before it was already unrelated.
    ///
    /// A comparison that errors does not end the scan: a related event found
    /// later still blocks. The check fails open only when no earlier event is
    /// known to be related.
    pub fn is_blocked(&mut self, seq: SeqNum) -> BlockState {
        let Some(event) = self.events.get(&seq) else {
            return BlockState::Clear;
        };

        if let Some(blocker) = event.blocker {
            if self.events.contains_key(&blocker) {
                return BlockState::BlockedBy(blocker);
            }
        }

        let start = event.blocker.unwrap_or(SeqNum(0));
        let mut found = None;
        let mut failure = None;
        for (other_seq, other) in self.events.range(start..seq) {
            match self.resolver.related(&other.device, &event.device) {
                Ok(true) => {
                    found = Some(*other_seq);
                    break;
                }
                Ok(false) => {}
                Err(err) => {
                    failure.get_or_insert(err);
                }
            }
        }

        // Only a scan with no unresolved comparison may become the resume point.
        if failure.is_none() {
            if let Some(event) = self.events.get_mut(&seq) {
                event.blocker = found.or(event.blocker);
            }
        }
        match (found, failure) {
            (Some(blocker), _) => BlockState::BlockedBy(blocker),
            (None, Some(err)) => BlockState::DependencyCheckFailed(err),
            (None, None) => BlockState::Clear,
        }
    }

    /// Lowest-sequence event that may start now. Does not remove it.
    ///
    /// Skips running events, events blocked by an earlier related event, and
    /// deferred events whose retry time has not come yet.
    pub fn next_ready(&mut self, now: Instant) -> Option<Ready> {
        let candidates: Vec<(SeqNum, Readiness)> = self
            .events
            .values()
            .filter(|e| !e.is_running())
            .map(|e| {
                let readiness = e
                    .retry_state
                    .as_ref()
                    .map(|state| state.readiness(now))
                    .unwrap_or(Readiness::Runnable);
                (e.seq, readiness)
            })
            .collect();

        for (seq, readiness) in candidates {
            if readiness == Readiness::Waiting {
                continue;
            }
            let degraded = match self.is_blocked(seq) {
                BlockState::BlockedBy(_) => continue,
                BlockState::Clear => None,
                BlockState::DependencyCheckFailed(err) => Some(err),
            };
            return Some(Ready {
                seq,
                degraded,
                forced: readiness == Readiness::Expired,
            });
        }
        None
    }

    pub fn remove(&mut self, seq: SeqNum) -> Option<Event> {
        self.events.remove(&seq)
    }

    pub fn get(&self, seq: SeqNum) -> Option<&Event> {
        self.events.get(&seq)
    }

    pub(crate) fn get_mut(&mut self, seq: SeqNum) -> Option<&mut Event> {
        self.events.get_mut(&seq)
    }

    pub fn contains(&self, seq: SeqNum) -> bool {
        self.events.contains_key(&seq)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.events.values()
    }

    pub fn running_count(&self) -> usize {
        self.events.values().filter(|e| e.is_running()).count()
    }

    pub fn deferred_count(&self) -> usize {
        self.events.values().filter(|e| e.is_deferred()).count()
    }

    /// Sequence numbers of events no worker has picked up.
    pub fn unstarted(&self) -> Vec<SeqNum> {
        self.events
            .values()
            .filter(|e| !e.is_running())
            .map(|e| e.seq)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hotplug_core::DevNumKind;
    use std::time::Duration;

    fn dev(path: &str) -> Device {
        Device::new(path, Action::Add, "usb")
    }

    fn queue_with(paths: &[&str]) -> (EventQueue, Instant) {
        let now = Instant::now();
        let mut queue = EventQueue::default();
        for path in paths {
            queue.enqueue(dev(path), now);
        }
        (queue, now)
    }

    #[test]
    fn sequence_numbers_increase_from_one() {
        let (queue, _) = queue_with(&["/devices/a", "/devices/b"]);
        let seqs: Vec<_> = queue.iter().map(Event::seq).collect();
        assert_eq!(seqs, vec![SeqNum(1), SeqNum(2)]);
    }

    #[test]
    fn child_is_blocked_by_parent() {
        let (mut queue, _) = queue_with(&["/devices/usb1", "/devices/usb1/1-1"]);
        assert_eq!(queue.is_blocked(SeqNum(1)), BlockState::Clear);
        assert_eq!(queue.is_blocked(SeqNum(2)), BlockState::BlockedBy(SeqNum(1)));
    }

    #[test]
    fn parent_is_blocked_by_earlier_child() {
        let (mut queue, _) = queue_with(&["/devices/usb1/1-1", "/devices/usb1"]);
        assert_eq!(queue.is_blocked(SeqNum(2)), BlockState::BlockedBy(SeqNum(1)));
    }

    #[test]
    fn sibling_prefix_is_not_related() {
        let (mut queue, _) = queue_with(&["/devices/usb1", "/devices/usb10"]);
        assert_eq!(queue.is_blocked(SeqNum(2)), BlockState::Clear);
    }

    #[test]
    fn same_devnum_blocks_and_kinds_are_distinct() {
        let now = Instant::now();
        let mut queue = EventQueue::default();
        queue.enqueue(
            Device::new("/devices/a/sda", Action::Add, "block").with_devnum(DevNumKind::Block, 8, 0),
            now,
        );
        queue.enqueue(
            Device::new("/devices/b/tty", Action::Add, "tty").with_devnum(DevNumKind::Char, 8, 0),
            now,
        );
        queue.enqueue(
            Device::new("/devices/c/sda", Action::Change, "block")
                .with_devnum(DevNumKind::Block, 8, 0),
            now,
        );
        assert_eq!(queue.is_blocked(SeqNum(2)), BlockState::Clear);
        assert_eq!(queue.is_blocked(SeqNum(3)), BlockState::BlockedBy(SeqNum(1)));
    }

    #[test]
    fn move_blocks_on_old_path() {
        let now = Instant::now();
        let mut queue = EventQueue::default();
        queue.enqueue(dev("/devices/net/eth0"), now);
        queue.enqueue(
            Device::new("/devices/net/lan0", Action::Move, "net").with_devpath_old("/devices/net/eth0"),
            now,
        );
        assert_eq!(queue.is_blocked(SeqNum(2)), BlockState::BlockedBy(SeqNum(1)));
    }

    #[test]
    fn blocker_is_cached_and_refreshed_after_removal() {
        let (mut queue, _) =
            queue_with(&["/devices/usb1", "/devices/usb1/1-1", "/devices/usb1/1-1/1-1:1.0"]);
        assert_eq!(queue.is_blocked(SeqNum(3)), BlockState::BlockedBy(SeqNum(1)));
        assert_eq!(queue.get(SeqNum(3)).and_then(Event::blocker), Some(SeqNum(1)));

        queue.remove(SeqNum(1));
        assert_eq!(queue.is_blocked(SeqNum(3)), BlockState::BlockedBy(SeqNum(2)));

        queue.remove(SeqNum(2));
        assert_eq!(queue.is_blocked(SeqNum(3)), BlockState::Clear);
    }

    #[test]
    fn later_events_never_block_earlier_ones() {
        let (mut queue, _) = queue_with(&["/devices/usb1/1-1", "/devices/usb1/1-1"]);
        assert_eq!(queue.is_blocked(SeqNum(1)), BlockState::Clear);
    }

    #[test]
    fn malformed_devpath_fails_open() {
        let (mut queue, _) = queue_with(&["/devices/usb1", "usb1/1-1"]);
        assert!(matches!(
            queue.is_blocked(SeqNum(2)),
            BlockState::DependencyCheckFailed(DependencyError::MalformedDevpath(_))
        ));
        let ready: Vec<_> = std::iter::from_fn(|| {
            let next = queue.next_ready(Instant::now())?;
            queue.get_mut(next.seq)?.assigned_worker = Some(WorkerId(0));
            Some(next)
        })
        .collect();
        assert_eq!(ready.len(), 2, "both events are runnable");
        assert!(ready[1].degraded.is_some());
    }

    #[test]
    fn malformed_earlier_event_does_not_unblock_a_child() {
        let (mut queue, now) = queue_with(&["usb-bad", "/devices/usb1", "/devices/usb1/1-1"]);
        queue.get_mut(SeqNum(1)).expect("event").assigned_worker = Some(WorkerId(0));
        queue.get_mut(SeqNum(2)).expect("event").assigned_worker = Some(WorkerId(1));

        assert_eq!(queue.is_blocked(SeqNum(3)), BlockState::BlockedBy(SeqNum(2)));
        assert_eq!(queue.get(SeqNum(3)).and_then(Event::blocker), None);
        assert_eq!(queue.next_ready(now), None, "child waits for its running parent");

        queue.remove(SeqNum(2));
        let ready = queue.next_ready(now).expect("parent gone");
        assert_eq!(ready.seq, SeqNum(3));
        assert!(
            matches!(ready.degraded, Some(DependencyError::MalformedDevpath(ref p)) if p == "usb-bad"),
            "only the unresolvable comparison remains: {:?}",
            ready.degraded
        );
    }

    #[test]
    fn next_ready_skips_running_and_blocked() {
        let (mut queue, now) =
            queue_with(&["/devices/usb1", "/devices/usb1/1-1", "/devices/virtual/net/lo"]);
        let first = queue.next_ready(now).expect("first");
        assert_eq!(first.seq, SeqNum(1));
        queue.get_mut(SeqNum(1)).expect("event").assigned_worker = Some(WorkerId(0));

        let second = queue.next_ready(now).expect("second");
        assert_eq!(second.seq, SeqNum(3), "child of a running parent must wait");
        assert!(second.degraded.is_none());
    }

    #[test]
    fn next_ready_does_not_remove() {
        let (mut queue, now) = queue_with(&["/devices/a"]);
        assert!(queue.next_ready(now).is_some());
        assert!(queue.next_ready(now).is_some());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn deferred_event_waits_until_retry_time() {
        let (mut queue, now) = queue_with(&["/devices/block/sda"]);
        queue.get_mut(SeqNum(1)).expect("event").retry_state = Some(RetryState {
            next_retry_at: Some(now + Duration::from_secs(1)),
            timeout_deadline: now + Duration::from_secs(10),
        });

        assert!(queue.next_ready(now).is_none());
        let ready = queue
            .next_ready(now + Duration::from_secs(1))
            .expect("due for retry");
        assert!(!ready.forced);
        let forced = queue
            .next_ready(now + Duration::from_secs(10))
            .expect("past ceiling");
        assert!(forced.forced);
    }

    #[test]
    fn counts_and_unstarted() {
        let (mut queue, _) = queue_with(&["/devices/a", "/devices/b"]);
        queue.get_mut(SeqNum(1)).expect("event").assigned_worker = Some(WorkerId(3));
        assert_eq!(queue.running_count(), 1);
        assert_eq!(queue.unstarted(), vec![SeqNum(2)]);
        assert!(queue.remove(SeqNum(1)).is_some());
        assert!(queue.remove(SeqNum(1)).is_none(), "removed exactly once");
    }
}
