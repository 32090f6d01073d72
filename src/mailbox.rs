//! Mailbox: one socket, two packet queues, one pump.
//!
//! A [`Mailbox`] wraps an already-connected TCP socket and turns it into a
//! bidirectional queue of length-prefixed packets. Exactly one driving mode
//! is active at a time: either an external scheduler calls [`Mailbox::tick`]
//! repeatedly (non-blocking, bounded work per call), or the cooperative pump
//! started with [`Mailbox::start_listen`] runs its own receive/send task
//! pair. Enqueuing and dequeuing packets from other threads is safe
//! concurrently with either mode.

use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::Result;
use crate::framing::FramingState;
use crate::listen::{ListenControl, StopPolicy};
use crate::owner::MailboxOwner;
use crate::packet::{DynamicPacket, Packet};
use crate::queue::PacketQueue;
use crate::WireboxError;

/// Default maximum fragments processed per `tick()` call, so one chatty
/// connection cannot monopolize a shared driving thread.
pub const DEFAULT_MAX_FRAGMENTS_PER_TICK: usize = 64;

/// Static per-connection configuration. Immutable after construction.
#[derive(Debug, Clone)]
pub struct MailboxConfig {
    /// Maximum receive fragments processed per `tick()` call (0 = unbounded).
    pub max_fragments_per_tick: usize,
    /// Maximum packets fully sent per `tick()` call (0 = unbounded).
    pub max_sends_per_tick: usize,
    /// Maximum accepted payload size in bytes (0 = no limit). A peer
    /// declaring a larger length is a protocol violation.
    pub max_payload_size: usize,
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            max_fragments_per_tick: DEFAULT_MAX_FRAGMENTS_PER_TICK,
            max_sends_per_tick: 0,
            max_payload_size: 0,
        }
    }
}

/// The socket in its current driving mode.
pub(crate) enum Transport {
    /// Non-blocking socket driven by `tick()`.
    Polling(TcpStream),
    /// Socket handed to the cooperative loop pair.
    Listening(Arc<tokio::net::TcpStream>),
    /// Socket closed; all pump calls report failure.
    Closed,
}

/// Wire-side state: the transport and the two in-flight packet slots.
/// Guarded by one lock; only the active pump touches it.
pub(crate) struct IoState {
    pub(crate) transport: Transport,
    pub(crate) framing: FramingState,
}

/// A packet mailbox over one duplex socket.
pub struct Mailbox {
    pub(crate) io: Mutex<IoState>,
    pub(crate) inbound: PacketQueue,
    pub(crate) outbound: PacketQueue,
    pub(crate) config: MailboxConfig,
    /// Set once the connection is no longer usable (closed, faulted, or a
    /// protocol violation was detected).
    pub(crate) failed: AtomicBool,
    pub(crate) listen: Mutex<Option<ListenControl>>,
    owner: Mutex<Option<Weak<dyn MailboxOwner>>>,
    peer: String,
}

impl Mailbox {
    /// Wrap an already-connected socket with the default configuration.
    /// The socket is switched to non-blocking mode.
    pub fn new(stream: TcpStream) -> Result<Self> {
        Self::with_config(stream, MailboxConfig::default())
    }

    /// Wrap an already-connected socket with the given configuration.
    pub fn with_config(stream: TcpStream, config: MailboxConfig) -> Result<Self> {
        stream.set_nonblocking(true)?;
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "<unknown peer>".to_string());

        Ok(Self {
            io: Mutex::new(IoState {
                transport: Transport::Polling(stream),
                framing: FramingState::new(),
            }),
            inbound: PacketQueue::new(),
            outbound: PacketQueue::new(),
            config,
            failed: AtomicBool::new(false),
            listen: Mutex::new(None),
            owner: Mutex::new(None),
            peer,
        })
    }

    /// This mailbox's configuration.
    pub fn config(&self) -> &MailboxConfig {
        &self.config
    }

    /// Peer address label used in diagnostics.
    pub(crate) fn peer_label(&self) -> &str {
        &self.peer
    }

    /// Enqueue an outbound packet. Never blocks; the packet goes out on a
    /// later `tick()` or through the cooperative send loop.
    pub fn send(&self, packet: impl Into<Packet>) {
        self.outbound.push(packet.into());
    }

    /// Enqueue a dynamic packet whose payload may still be replaced (once)
    /// until the send side locks it for transmission.
    pub fn send_dynamic(&self, packet: &DynamicPacket) {
        self.outbound.push(packet.packet());
    }

    /// Dequeue one received packet if available (non-blocking).
    pub fn next(&self) -> Option<Packet> {
        self.inbound.try_pop()
    }

    /// Wait for the next received packet. Intended for the cooperative mode;
    /// callers wanting a timeout or cancellation should `select!` around it.
    pub async fn recv(&self) -> Packet {
        self.inbound.pop_wait().await
    }

    /// Atomically remove and return everything received so far.
    pub fn drain_received(&self) -> Vec<Packet> {
        self.inbound.drain_all()
    }

    /// Wait until at least one packet has been received, then atomically
    /// drain everything queued at that moment.
    pub async fn recv_all(&self) -> Vec<Packet> {
        let first = self.inbound.pop_wait().await;
        let mut packets = vec![first];
        packets.extend(self.inbound.drain_all());
        packets
    }

    /// Number of received packets waiting to be dequeued.
    pub fn pending_received(&self) -> usize {
        self.inbound.len()
    }

    /// Number of outbound packets not yet fully sent from the queue.
    pub fn pending_send(&self) -> usize {
        self.outbound.len()
    }

    /// Whether the outbound queue is currently empty.
    pub fn is_send_queue_empty(&self) -> bool {
        self.outbound.is_empty()
    }

    /// Whether the connection is still usable by either pump.
    pub fn is_usable(&self) -> bool {
        !self.failed.load(Ordering::Acquire)
    }

    /// Run one synchronous pump step: advance the receive side, then the
    /// send side, as far as currently possible without blocking.
    ///
    /// Returns `false` once the connection is no longer usable (peer closed,
    /// protocol violation, or an unrecoverable I/O fault, all handled
    /// internally, never raised); `true` otherwise, including when there was
    /// no work to do. Not reentrant: one thread drives a given mailbox.
    pub fn tick(&self) -> bool {
        if self.failed.load(Ordering::Acquire) {
            return false;
        }

        let mut io = self.io.lock();
        let IoState { transport, framing } = &mut *io;
        let stream = match transport {
            Transport::Polling(stream) => stream,
            Transport::Listening(_) => {
                tracing::warn!(
                    peer = %self.peer,
                    "tick() called while the cooperative pump is active; ignoring"
                );
                return true;
            }
            Transport::Closed => return false,
        };

        let mut result = framing.pump_recv(stream, &self.config, &self.inbound);
        if result.is_ok() {
            result = framing.pump_send(stream, &self.config, &self.outbound);
        }

        match result {
            Ok(()) => true,
            Err(error) => {
                match &error {
                    WireboxError::ConnectionClosed => {
                        tracing::debug!(peer = %self.peer, "connection closed")
                    }
                    WireboxError::Protocol(msg) => {
                        tracing::warn!(peer = %self.peer, "protocol violation: {msg}")
                    }
                    other => tracing::error!(peer = %self.peer, "transport fault: {other}"),
                }
                let _ = stream.shutdown(Shutdown::Both);
                *transport = Transport::Closed;
                self.failed.store(true, Ordering::Release);
                false
            }
        }
    }

    /// Close the underlying transport. Subsequent `tick()` calls return
    /// `false`; an active cooperative pump is cancelled.
    pub fn close(&self) {
        self.failed.store(true, Ordering::Release);

        let listening = {
            let mut io = self.io.lock();
            match std::mem::replace(&mut io.transport, Transport::Closed) {
                Transport::Polling(stream) => {
                    let _ = stream.shutdown(Shutdown::Both);
                    false
                }
                // The loop tasks still hold clones of the socket; it closes
                // once they observe cancellation and drop them.
                Transport::Listening(_) => true,
                Transport::Closed => false,
            }
        };

        if listening {
            self.stop_listen(StopPolicy::Immediate);
        }
    }

    /// Mark the connection failed (used by the cooperative loops).
    pub(crate) fn mark_failed(&self) {
        self.failed.store(true, Ordering::Release);
    }

    /// The currently bound owner, if any.
    pub fn owner(&self) -> Option<Arc<dyn MailboxOwner>> {
        self.owner.lock().as_ref()?.upgrade()
    }

    /// The currently bound owner downcast to its concrete type.
    pub fn owner_as<T: MailboxOwner>(&self) -> Option<Arc<T>> {
        let owner = self.owner()?;
        let any: Arc<dyn std::any::Any + Send + Sync> = owner;
        any.downcast::<T>().ok()
    }

    /// Whether an owner is currently bound.
    pub fn has_owner(&self) -> bool {
        self.owner().is_some()
    }

    /// Overwrite the owner back-reference. Only the registry calls this,
    /// under its binding lock.
    pub(crate) fn set_owner_weak(&self, owner: Option<Weak<dyn MailboxOwner>>) {
        *self.owner.lock() = owner;
    }
}

impl std::fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailbox")
            .field("peer", &self.peer)
            .field("pending_received", &self.pending_received())
            .field("pending_send", &self.pending_send())
            .field("usable", &self.is_usable())
            .finish()
    }
}
