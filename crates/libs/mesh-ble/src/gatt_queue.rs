//! Serializes GATT operations per connection handle, since BLE stacks are
//! not reentrant across overlapping reads/writes/subscribes on one
//! connection.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GattOpKind {
    Write,
    Read,
    EnableNotify,
    RequestMtu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GattOpResult {
    Success,
    Failure,
    Timeout,
    Disconnected,
}

pub struct GattOp {
    pub id: u64,
    pub handle: u16,
    pub kind: GattOpKind,
    pub payload: Vec<u8>,
    pub enqueued_at: Instant,
    pub timeout: Duration,
}

pub struct CompletedOp {
    pub id: u64,
    pub handle: u16,
    pub result: GattOpResult,
    pub response: Option<Vec<u8>>,
}

/// One FIFO queue per connection handle; at most one op in flight overall
/// matches the single shared BLE radio underneath both roles.
pub struct GattOpQueue {
    next_id: u64,
    queued: VecDeque<GattOp>,
    in_flight: Option<GattOp>,
    completions: Vec<CompletedOp>,
}

impl Default for GattOpQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl GattOpQueue {
    pub fn new() -> Self {
        Self { next_id: 1, queued: VecDeque::new(), in_flight: None, completions: Vec::new() }
    }

    pub fn enqueue(&mut self, handle: u16, kind: GattOpKind, payload: Vec<u8>, timeout: Duration) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.queued.push_back(GattOp { id, handle, kind, payload, enqueued_at: Instant::now(), timeout });
        id
    }

    /// Dequeues the next op into flight if the radio is idle. Returns the op
    /// the caller should now execute against the platform.
    pub fn process(&mut self) -> Option<&GattOp> {
        if self.in_flight.is_none() {
            self.in_flight = self.queued.pop_front();
        }
        self.in_flight.as_ref()
    }

    /// Called from the platform callback when the in-flight op finishes.
    pub fn complete(&mut self, result: GattOpResult, response: Option<Vec<u8>>) {
        if let Some(op) = self.in_flight.take() {
            self.completions.push(CompletedOp { id: op.id, handle: op.handle, result, response });
        }
    }

    /// Sweeps the in-flight op for timeout expiry; call every tick.
    pub fn sweep_timeouts(&mut self) {
        let expired = self
            .in_flight
            .as_ref()
            .map(|op| Instant::now().duration_since(op.enqueued_at) > op.timeout)
            .unwrap_or(false);
        if expired {
            self.complete(GattOpResult::Timeout, None);
        }
    }

    /// Fires `Disconnected` on every queued and in-flight op for `handle`.
    pub fn clear_for_connection(&mut self, handle: u16) {
        if self.in_flight.as_ref().map(|op| op.handle) == Some(handle) {
            self.complete(GattOpResult::Disconnected, None);
        }
        let mut remaining = VecDeque::new();
        while let Some(op) = self.queued.pop_front() {
            if op.handle == handle {
                self.completions.push(CompletedOp { id: op.id, handle, result: GattOpResult::Disconnected, response: None });
            } else {
                remaining.push_back(op);
            }
        }
        self.queued = remaining;
    }

    pub fn drain_completions(&mut self) -> Vec<CompletedOp> {
        std::mem::take(&mut self.completions)
    }

    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }

    pub fn has_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_one_op_in_flight_at_a_time() {
        let mut queue = GattOpQueue::new();
        queue.enqueue(1, GattOpKind::Write, vec![1], DEFAULT_TIMEOUT);
        queue.enqueue(1, GattOpKind::Write, vec![2], DEFAULT_TIMEOUT);
        assert!(queue.process().is_some());
        assert_eq!(queue.queued_len(), 1);
        assert!(queue.process().is_some()); // still the same in-flight op
        assert_eq!(queue.queued_len(), 1);
    }

    #[test]
    fn completing_releases_the_slot_for_the_next_op() {
        let mut queue = GattOpQueue::new();
        queue.enqueue(1, GattOpKind::Write, vec![1], DEFAULT_TIMEOUT);
        queue.enqueue(1, GattOpKind::Write, vec![2], DEFAULT_TIMEOUT);
        queue.process();
        queue.complete(GattOpResult::Success, None);
        assert!(!queue.has_in_flight());
        queue.process();
        assert!(queue.has_in_flight());
        assert_eq!(queue.queued_len(), 0);
    }

    #[test]
    fn expired_op_completes_with_timeout() {
        let mut queue = GattOpQueue::new();
        queue.enqueue(1, GattOpKind::Read, vec![], Duration::from_millis(0));
        queue.process();
        std::thread::sleep(Duration::from_millis(5));
        queue.sweep_timeouts();
        let completions = queue.drain_completions();
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].result, GattOpResult::Timeout);
    }

    #[test]
    fn clear_for_connection_fires_disconnected_on_queued_and_in_flight() {
        let mut queue = GattOpQueue::new();
        queue.enqueue(7, GattOpKind::Write, vec![], DEFAULT_TIMEOUT);
        queue.enqueue(7, GattOpKind::Write, vec![], DEFAULT_TIMEOUT);
        queue.enqueue(9, GattOpKind::Write, vec![], DEFAULT_TIMEOUT);
        queue.process();
        queue.clear_for_connection(7);
        let completions = queue.drain_completions();
        assert_eq!(completions.len(), 2);
        assert!(completions.iter().all(|c| c.result == GattOpResult::Disconnected));
        assert_eq!(queue.queued_len(), 1);
    }
}
