//! Fast-timeout wheel
//!
//! Every timeout event in a scan shares one delay (`--ft-spec`), so there
//! is no need for a real timer wheel: events are enqueued in arrival order
//! and the head of the queue is always the oldest. `pop` returns the head
//! only once its age reaches the spec. Enqueue and dequeue are both O(1).
//!
//! One wheel exists per handler thread. Producers are the tx workers and
//! the owning handler, sharded by the same `(ip_them, port_them)` hash the
//! dispatcher uses, so a timeout and the reply it races always meet in the
//! same handler and dedup against the same cache partition.
//!
//! If a scan module ever needs two different delays it must run two
//! wheels; this type intentionally does not generalize.

use crate::contract::ScanTmEvent;
use crossbeam::queue::SegQueue;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

struct FtEntry {
    timestamp: u64,
    event: ScanTmEvent,
}

/// Shared queue of one handler's pending timeout events
pub struct FtWheel {
    queue: SegQueue<FtEntry>,
    count: AtomicU64,
}

impl FtWheel {
    fn new() -> Self {
        Self {
            queue: SegQueue::new(),
            count: AtomicU64::new(0),
        }
    }

    /// Enqueue an event stamped with the current coarse time
    pub fn add(&self, event: ScanTmEvent, now: u64) {
        self.queue.push(FtEntry {
            timestamp: now,
            event,
        });
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn event_count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

/// Table of wheels, one per handler
pub struct FtTable {
    wheels: Vec<Arc<FtWheel>>,
    spec: u64,
}

impl FtTable {
    pub fn new(spec: u64, handler_count: usize) -> Self {
        Self {
            wheels: (0..handler_count).map(|_| Arc::new(FtWheel::new())).collect(),
            spec,
        }
    }

    pub fn spec(&self) -> u64 {
        self.spec
    }

    pub fn wheel(&self, handler: usize) -> Arc<FtWheel> {
        self.wheels[handler].clone()
    }

    pub fn handler_count(&self) -> usize {
        self.wheels.len()
    }

    /// Route an event to a specific handler's wheel; tx threads use this
    /// with the dispatch hash so the timeout meets its reply
    pub fn add(&self, handler: usize, event: ScanTmEvent, now: u64) {
        self.wheels[handler].add(event, now);
    }

    /// Total backlog across wheels, for the status line
    pub fn event_count(&self) -> u64 {
        self.wheels.iter().map(|w| w.event_count()).sum()
    }
}

/// The consuming end, owned by exactly one handler thread. Holds the
/// popped-but-not-yet-due head so the lock-free queue never needs a peek.
pub struct FtHandler {
    wheel: Arc<FtWheel>,
    spec: u64,
    oldest: Option<FtEntry>,
}

impl FtHandler {
    pub fn new(table: &FtTable, handler: usize) -> Self {
        Self {
            wheel: table.wheel(handler),
            spec: table.spec,
            oldest: None,
        }
    }

    /// The wheel this handler feeds when a module re-arms a timeout
    pub fn wheel(&self) -> &FtWheel {
        &self.wheel
    }

    /// Pop the oldest event if its age reached the spec; `None` when the
    /// queue is empty or the head is not yet due.
    pub fn pop(&mut self, now: u64) -> Option<ScanTmEvent> {
        if self.oldest.is_none() {
            self.oldest = self.wheel.queue.pop();
            self.oldest.as_ref()?;
        }

        let due = {
            let head = self.oldest.as_ref().unwrap();
            now.saturating_sub(head.timestamp) >= self.spec
        };
        if due {
            self.wheel.count.fetch_sub(1, Ordering::Relaxed);
            self.oldest.take().map(|e| e.event)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strobe_core::{Address, IpProto};

    fn event(port: u16) -> ScanTmEvent {
        ScanTmEvent {
            ip_proto: IpProto::Tcp,
            ip_them: Address::from_v4_u32(0x0A00_0001),
            ip_me: Address::from_v4_u32(0x0A00_0002),
            port_them: port,
            port_me: 40_000,
            dedup_type: 0,
            need_timeout: true,
        }
    }

    #[test]
    fn test_pop_respects_spec() {
        let table = FtTable::new(2, 1);
        let mut handler = FtHandler::new(&table, 0);
        handler.wheel().add(event(80), 100);

        assert!(handler.pop(100).is_none());
        assert!(handler.pop(101).is_none());
        let popped = handler.pop(102).expect("due at spec age");
        assert_eq!(popped.port_them, 80);
        assert!(handler.pop(200).is_none(), "queue drained");
    }

    #[test]
    fn test_fifo_order() {
        let table = FtTable::new(1, 1);
        let mut handler = FtHandler::new(&table, 0);
        for port in [1u16, 2, 3] {
            handler.wheel().add(event(port), 10);
        }
        let order: Vec<u16> = std::iter::from_fn(|| handler.pop(100).map(|e| e.port_them)).collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn test_head_not_due_blocks_tail() {
        let table = FtTable::new(5, 1);
        let mut handler = FtHandler::new(&table, 0);
        handler.wheel().add(event(1), 100);
        handler.wheel().add(event(2), 101);

        // head becomes due at 105, tail at 106
        assert!(handler.pop(104).is_none());
        assert_eq!(handler.pop(105).unwrap().port_them, 1);
        assert!(handler.pop(105).is_none());
        assert_eq!(handler.pop(106).unwrap().port_them, 2);
    }

    #[test]
    fn test_event_count_tracks_held_head() {
        let table = FtTable::new(10, 1);
        let mut handler = FtHandler::new(&table, 0);
        handler.wheel().add(event(1), 0);
        handler.wheel().add(event(2), 0);
        assert_eq!(table.event_count(), 2);

        // a not-yet-due pop moves the head into the handler but it still
        // counts as pending
        assert!(handler.pop(5).is_none());
        assert_eq!(table.event_count(), 2);

        handler.pop(10).unwrap();
        assert_eq!(table.event_count(), 1);
    }

    #[test]
    fn test_wheels_are_independent() {
        let table = FtTable::new(1, 2);
        let mut h0 = FtHandler::new(&table, 0);
        let mut h1 = FtHandler::new(&table, 1);
        h0.wheel().add(event(1), 0);
        assert!(h1.pop(100).is_none());
        assert!(h0.pop(100).is_some());
    }
}
