//! Concurrent packet FIFO with an atomic depth counter.
//!
//! Both mailbox queues (inbound and outbound) use this wrapper. Enqueue never
//! blocks and always succeeds; dequeue is either a non-blocking try or an
//! awaited wait, depending on the driving mode. The depth counter is kept
//! outside the queue lock so `len()` never contends with the pump: it is
//! monotonically consistent with the queue contents, not exactly
//! linearizable with them.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::packet::Packet;

/// Unbounded concurrent FIFO of packets.
#[derive(Debug, Default)]
pub struct PacketQueue {
    inner: Mutex<VecDeque<Packet>>,
    depth: AtomicUsize,
    notify: Notify,
}

impl PacketQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a packet. Never blocks, always succeeds.
    pub fn push(&self, packet: Packet) {
        self.inner.lock().push_back(packet);
        self.depth.fetch_add(1, Ordering::AcqRel);
        self.notify.notify_one();
    }

    /// Dequeue the next packet if one is available (non-blocking).
    pub fn try_pop(&self) -> Option<Packet> {
        let packet = self.inner.lock().pop_front()?;
        self.depth.fetch_sub(1, Ordering::AcqRel);
        Some(packet)
    }

    /// Wait until a packet is available and dequeue it.
    pub async fn pop_wait(&self) -> Packet {
        loop {
            if let Some(packet) = self.try_pop() {
                return packet;
            }
            let notified = self.notify.notified();
            // Re-check after arming the waiter so a push racing with the
            // first check cannot be missed.
            if let Some(packet) = self.try_pop() {
                return packet;
            }
            notified.await;
        }
    }

    /// Atomically remove and return every currently queued packet.
    pub fn drain_all(&self) -> Vec<Packet> {
        let drained: Vec<Packet> = {
            let mut inner = self.inner.lock();
            std::mem::take(&mut *inner).into()
        };
        self.depth.fetch_sub(drained.len(), Ordering::AcqRel);
        drained
    }

    /// Discard every currently queued packet.
    pub fn clear(&self) {
        let dropped = {
            let mut inner = self.inner.lock();
            let n = inner.len();
            inner.clear();
            n
        };
        self.depth.fetch_sub(dropped, Ordering::AcqRel);
    }

    /// Approximate queue depth (from the atomic counter, not the lock).
    #[inline]
    pub fn len(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    /// Whether the queue is currently empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
