//! In-flight request registry.
//!
//! A fixed-capacity slab correlating outbound SUBSCRIBE/UNSUBSCRIBE/PUBLISH
//! packets with their completion. QoS 1/2 requests retire when the matching
//! acknowledgement arrives; QoS 0 publishes carry no packet id and retire
//! once the transport has confirmed enough sent bytes to cover them.

use std::time::Instant;

/// Number of request slots per client.
pub const MAX_REQUESTS: usize = 8;

/// Kind of packet a request slot is tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestKind {
    Publish,
    Subscribe,
    Unsubscribe,
}

/// A tracked outbound request.
#[derive(Debug)]
pub(crate) struct Request<A> {
    pub kind: RequestKind,
    /// Packet identifier; 0 for QoS-0 publishes.
    pub packet_id: u16,
    /// Set once the packet is queued and a completion is awaited.
    pub pending: bool,
    /// When the request went pending.
    #[allow(dead_code)] // reserved for a host-driven timeout sweep
    pub pending_since: Option<Instant>,
    /// QoS-0 completion sentinel: retire once this many total bytes have
    /// been confirmed sent on the connection.
    pub expected_sent_len: u64,
    /// Opaque user argument returned with the completion event.
    pub arg: A,
}

/// Fixed-capacity table of request slots.
#[derive(Debug)]
pub(crate) struct RequestTable<A> {
    slots: [Option<Request<A>>; MAX_REQUESTS],
}

impl<A> RequestTable<A> {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| None),
        }
    }

    /// Claim the first free slot. Returns its index, or `None` when every
    /// slot is taken.
    pub fn create(&mut self, kind: RequestKind, packet_id: u16, arg: A) -> Option<usize> {
        let idx = self.slots.iter().position(Option::is_none)?;
        self.slots[idx] = Some(Request {
            kind,
            packet_id,
            pending: false,
            pending_since: None,
            expected_sent_len: 0,
            arg,
        });
        Some(idx)
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut Request<A>> {
        self.slots[idx].as_mut()
    }

    /// Mark a slot pending and stamp the clock.
    pub fn set_pending(&mut self, idx: usize) {
        if let Some(request) = self.slots[idx].as_mut() {
            request.pending = true;
            request.pending_since = Some(Instant::now());
        }
    }

    /// Remove and return the pending request with this packet id.
    pub fn take_pending(&mut self, packet_id: u16) -> Option<Request<A>> {
        let idx = self
            .slots
            .iter()
            .position(|slot| matches!(slot, Some(r) if r.pending && r.packet_id == packet_id))?;
        self.slots[idx].take()
    }

    /// Remove and return any pending request (connection-closed fanout).
    pub fn take_any_pending(&mut self) -> Option<Request<A>> {
        let idx = self
            .slots
            .iter()
            .position(|slot| matches!(slot, Some(r) if r.pending))?;
        self.slots[idx].take()
    }

    /// Remove and return the first pending QoS-0 publish in slot order,
    /// once `sent_total` covers its expected byte count. An uncovered head
    /// blocks the scan, so completion events fire in enqueue order.
    pub fn take_completed_qos0(&mut self, sent_total: u64) -> Option<Request<A>> {
        let idx = self
            .slots
            .iter()
            .position(|slot| matches!(slot, Some(r) if r.pending && r.packet_id == 0))?;
        if matches!(&self.slots[idx], Some(r) if r.expected_sent_len <= sent_total) {
            self.slots[idx].take()
        } else {
            None
        }
    }

    /// Number of pending requests.
    pub fn pending_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| matches!(slot, Some(r) if r.pending))
            .count()
    }

    /// Forget every slot.
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
    }

    /// True when no slot is occupied.
    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }
}
