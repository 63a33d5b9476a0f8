//! The delayed-send scheduler backing `<send delay="...">` and `<invoke>` timeouts.
//!
//! W3C leaves the exact timing mechanism unspecified; this module offers two
//! implementations behind one trait object, so a session's `GlobalData` can hold
//! whichever one fits its environment:
//!
//! - [`AutomaticScheduler`]: backed by the `timer` crate's [`timer::Timer`], one
//!   instance shared across a whole process. Its background thread never touches a
//!   session's configuration directly -- its closures only push onto the target
//!   session's External Queue, exactly like any other Event I/O Processor would.
//! - [`ManualScheduler`]: an explicit min-heap plus a logical clock, for embedding
//!   into test harnesses or environments that want to single-step wall-clock time
//!   instead of trusting a background thread.
//!
//! Cancellation (`<cancel sendid="...">`) is best effort per W3C 6.3: if the delayed
//! event has already been moved to the External Queue, cancellation can no longer
//! stop it.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use timer::{Guard, Timer};

use crate::fsm::Event;

static SEQUENCE_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_sequence() -> u64 {
    SEQUENCE_COUNTER.fetch_add(1, AtomicOrdering::Relaxed)
}

/// A pending `<send>` waiting to fire, keyed for priority by `(firing_time, sequence)`
/// so that same-millisecond sends still fire in send order.
#[derive(Debug, Clone)]
pub struct ScheduledEntry {
    pub sendid: String,
    pub session_id: crate::fsm::SessionId,
    pub firing_time_millis: i64,
    pub sequence: u64,
    pub event: Box<Event>,
    /// The target session's External Queue sender, so a poller can deliver the entry
    /// itself once it's due (`ManualScheduler`'s `poll_ready`; `AutomaticScheduler`'s
    /// timer callback closes over its own copy instead of going through an entry).
    pub target: Sender<Box<Event>>,
}

impl PartialEq for ScheduledEntry {
    fn eq(&self, other: &Self) -> bool {
        self.firing_time_millis == other.firing_time_millis && self.sequence == other.sequence
    }
}
impl Eq for ScheduledEntry {}

impl PartialOrd for ScheduledEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse so the earliest-firing entry sorts highest.
        other
            .firing_time_millis
            .cmp(&self.firing_time_millis)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// Behavior shared by the two scheduler flavors. Lives on `GlobalData` as
/// `Box<dyn Scheduler>` so sessions can be driven either by wall-clock sends
/// (`AutomaticScheduler`) or by a single-stepped logical clock (`ManualScheduler`)
/// without the rest of the runtime caring which.
pub trait Scheduler: Send {
    /// Schedules `event` to be delivered to `session`'s External Queue after `delay`.
    /// Returns an error if `sendid` already has a pending entry for this session
    /// (sendid collision within one session is rejected with `error.execution`, not
    /// silently deduplicated -- see DESIGN.md).
    fn schedule(
        &mut self,
        session_id: crate::fsm::SessionId,
        sendid: String,
        delay: Duration,
        event: Box<Event>,
        target: Sender<Box<Event>>,
    ) -> Result<(), String>;

    /// Cancels a pending send for this session by sendid. Best effort: if the event
    /// already fired, this is a no-op.
    fn cancel(&mut self, session_id: crate::fsm::SessionId, sendid: &str);

    /// Cancels every pending send for a session, used when the session terminates.
    fn cancel_session(&mut self, session_id: crate::fsm::SessionId);

    /// Drains and returns every entry whose firing time is now due, for a caller to
    /// deliver to each entry's target session. `spec.md` §4.2/§4.6: "Manual mode calls
    /// `poll_ready(now)` at the top of each macrostep iteration." `AutomaticScheduler`
    /// delivers directly from its timer thread and never has anything to report here,
    /// so the default is an empty list; only `ManualScheduler` overrides it.
    fn poll_ready(&mut self) -> Vec<ScheduledEntry> {
        Vec::new()
    }
}

/// Timer-thread-backed scheduler. One `Timer` is normally shared by every session in
/// a process (see `fsm_executor.rs`), matching "the timer thread must never touch a
/// session's configuration" -- its scheduled closures only ever call `Sender::send`.
pub struct AutomaticScheduler {
    timer: Arc<Timer>,
    guards: std::collections::HashMap<(crate::fsm::SessionId, String), Guard>,
}

impl AutomaticScheduler {
    pub fn new() -> AutomaticScheduler {
        AutomaticScheduler {
            timer: Arc::new(Timer::new()),
            guards: std::collections::HashMap::new(),
        }
    }

    pub fn with_timer(timer: Arc<Timer>) -> AutomaticScheduler {
        AutomaticScheduler {
            timer,
            guards: std::collections::HashMap::new(),
        }
    }
}

impl Default for AutomaticScheduler {
    fn default() -> Self {
        AutomaticScheduler::new()
    }
}

impl Scheduler for AutomaticScheduler {
    fn schedule(
        &mut self,
        session_id: crate::fsm::SessionId,
        sendid: String,
        delay: Duration,
        event: Box<Event>,
        target: Sender<Box<Event>>,
    ) -> Result<(), String> {
        let key = (session_id, sendid.clone());
        if self.guards.contains_key(&key) {
            return Err(format!("sendid '{}' already scheduled", sendid));
        }
        let chrono_delay = chrono::Duration::from_std(delay)
            .unwrap_or_else(|_| chrono::Duration::milliseconds(0));
        let guard = self.timer.schedule_with_delay(chrono_delay, move || {
            let _ = target.send(event.clone());
        });
        self.guards.insert(key, guard);
        Ok(())
    }

    fn cancel(&mut self, session_id: crate::fsm::SessionId, sendid: &str) {
        self.guards.remove(&(session_id, sendid.to_string()));
    }

    fn cancel_session(&mut self, session_id: crate::fsm::SessionId) {
        self.guards.retain(|(sid, _), _| *sid != session_id);
    }
}

/// An explicit min-heap plus a logical clock, for deterministic single-stepped
/// timing (e.g. a test harness that wants to "advance time" under its own control
/// instead of trusting a background thread).
pub struct ManualScheduler {
    now_millis: i64,
    heap: BinaryHeap<ScheduledEntry>,
    sendids: std::collections::HashSet<(crate::fsm::SessionId, String)>,
}

impl ManualScheduler {
    pub fn new() -> ManualScheduler {
        ManualScheduler {
            now_millis: 0,
            heap: BinaryHeap::new(),
            sendids: std::collections::HashSet::new(),
        }
    }

    /// Advances the logical clock by `delta`. Draining is left to `poll_ready`, so
    /// callers decide when to actually send -- see the "manual-mode clock advancement"
    /// decision in DESIGN.md.
    pub fn advance(&mut self, delta: Duration) {
        self.now_millis += delta.as_millis() as i64;
    }
}

impl Default for ManualScheduler {
    fn default() -> Self {
        ManualScheduler::new()
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(
        &mut self,
        session_id: crate::fsm::SessionId,
        sendid: String,
        delay: Duration,
        event: Box<Event>,
        target: Sender<Box<Event>>,
    ) -> Result<(), String> {
        let key = (session_id, sendid.clone());
        if self.sendids.contains(&key) {
            return Err(format!("sendid '{}' already scheduled", sendid));
        }
        self.sendids.insert(key);
        self.heap.push(ScheduledEntry {
            sendid,
            session_id,
            firing_time_millis: self.now_millis + delay.as_millis() as i64,
            sequence: next_sequence(),
            event,
            target,
        });
        Ok(())
    }

    fn cancel(&mut self, session_id: crate::fsm::SessionId, sendid: &str) {
        self.sendids.remove(&(session_id, sendid.to_string()));
        self.heap = self
            .heap
            .drain()
            .filter(|e| !(e.session_id == session_id && e.sendid == sendid))
            .collect();
    }

    fn cancel_session(&mut self, session_id: crate::fsm::SessionId) {
        self.heap = self.heap.drain().filter(|e| e.session_id != session_id).collect();
        self.sendids.retain(|(sid, _)| *sid != session_id);
    }

    /// Pops and returns every entry whose firing time has passed, without sending
    /// them -- the caller (the manual macrostep driver, or a test) decides how to
    /// deliver them.
    fn poll_ready(&mut self) -> Vec<ScheduledEntry> {
        let mut ready = Vec::new();
        while let Some(top) = self.heap.peek() {
            if top.firing_time_millis > self.now_millis {
                break;
            }
            let entry = self.heap.pop().unwrap();
            self.sendids.remove(&(entry.session_id, entry.sendid.clone()));
            ready.push(entry);
        }
        ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsm::Event;

    #[test]
    fn manual_scheduler_fires_in_time_order() {
        let mut s = ManualScheduler::new();
        let (tx, _rx) = std::sync::mpsc::channel();
        s.schedule(1, "a".into(), Duration::from_millis(100), Box::new(Event::new_simple("a")), tx.clone())
            .unwrap();
        s.schedule(1, "b".into(), Duration::from_millis(50), Box::new(Event::new_simple("b")), tx)
            .unwrap();
        s.advance(Duration::from_millis(60));
        let ready = s.poll_ready();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].sendid, "b");
    }

    #[test]
    fn manual_scheduler_rejects_duplicate_sendid() {
        let mut s = ManualScheduler::new();
        let (tx, _rx) = std::sync::mpsc::channel();
        s.schedule(1, "a".into(), Duration::from_millis(10), Box::new(Event::new_simple("a")), tx.clone())
            .unwrap();
        let err = s.schedule(1, "a".into(), Duration::from_millis(10), Box::new(Event::new_simple("a")), tx);
        assert!(err.is_err());
    }

    #[test]
    fn cancel_removes_pending_entry() {
        let mut s = ManualScheduler::new();
        let (tx, _rx) = std::sync::mpsc::channel();
        s.schedule(1, "a".into(), Duration::from_millis(10), Box::new(Event::new_simple("a")), tx)
            .unwrap();
        s.cancel(1, "a");
        s.advance(Duration::from_millis(20));
        assert!(s.poll_ready().is_empty());
    }
}
