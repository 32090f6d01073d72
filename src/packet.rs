//! Packet model: one framed message and its in-flight transfer progress.
//!
//! A [`Packet`] carries its own resumability state: `transferred` starts at
//! −4 (the prefix width) and counts up to 0 while the length prefix moves,
//! then from 0 to `length` while the payload moves. The synchronous pump can
//! therefore stop at any point and pick up exactly where it left off on the
//! next call, with no hidden state outside the packet itself.
//!
//! [`DynamicPacket`] covers the "payload decided after enqueue" case: the
//! caller keeps a handle and may replace the payload at most once, up to the
//! moment the send pump fixes the packet for transmission.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

use crate::wire::PREFIX_SIZE;

/// Starting value of `transferred`: the whole prefix is still to move.
pub(crate) const TRANSFER_START: i32 = -(PREFIX_SIZE as i32);

/// Payload storage for a packet.
#[derive(Debug)]
pub(crate) enum PayloadBuf {
    /// Immutable payload: outbound packets and completed inbound packets.
    Fixed(Bytes),
    /// Inbound payload still being filled by the receive side.
    Filling(BytesMut),
    /// Payload decided later through a [`DynamicPacket`] handle.
    Deferred(Arc<PayloadCell>),
}

/// A single framed message: length prefix + opaque payload bytes.
#[derive(Debug)]
pub struct Packet {
    /// Payload byte count for this message. Zero is valid.
    pub(crate) length: i32,
    /// Transfer progress: −4..0 = prefix bytes remaining (negated),
    /// 0..=length = payload bytes done. Only ever increases.
    pub(crate) transferred: i32,
    /// Payload buffer; `None` before the prefix is known and for
    /// zero-length packets (which never allocate).
    pub(crate) buf: Option<PayloadBuf>,
}

impl Packet {
    /// Create an outbound packet with the given payload.
    ///
    /// # Panics
    ///
    /// Panics if the payload is longer than `i32::MAX` bytes, which cannot be
    /// represented in the wire format.
    pub fn new(payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        assert!(
            payload.len() <= i32::MAX as usize,
            "payload length {} does not fit the 4-byte signed prefix",
            payload.len()
        );
        Self {
            length: payload.len() as i32,
            transferred: TRANSFER_START,
            buf: Some(PayloadBuf::Fixed(payload)),
        }
    }

    /// Create an outbound zero-length packet. No payload buffer is allocated;
    /// on the wire it is just the 4-byte prefix.
    pub fn empty() -> Self {
        Self {
            length: 0,
            transferred: TRANSFER_START,
            buf: None,
        }
    }

    /// Fresh inbound packet: prefix not yet known.
    pub(crate) fn for_receive() -> Self {
        Self {
            length: 0,
            transferred: TRANSFER_START,
            buf: None,
        }
    }

    /// Completed inbound packet (cooperative receive path).
    pub(crate) fn received(payload: Bytes) -> Self {
        debug_assert!(payload.len() <= i32::MAX as usize);
        Self {
            length: payload.len() as i32,
            transferred: payload.len() as i32,
            buf: Some(PayloadBuf::Fixed(payload)),
        }
    }

    /// Completed inbound zero-length packet.
    pub(crate) fn received_empty() -> Self {
        Self {
            length: 0,
            transferred: 0,
            buf: None,
        }
    }

    /// Payload length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.length.max(0) as usize
    }

    /// Whether the payload is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Payload bytes. Empty for zero-length packets and before an inbound
    /// packet's prefix is known.
    pub fn payload(&self) -> &[u8] {
        match &self.buf {
            Some(PayloadBuf::Fixed(bytes)) => bytes,
            Some(PayloadBuf::Filling(buf)) => buf,
            Some(PayloadBuf::Deferred(cell)) => {
                // Not fixed yet; a deferred payload is observable only
                // through its handle until the send pump resolves it.
                debug_assert!(!cell.is_fixed());
                &[]
            }
            None => &[],
        }
    }

    /// Consume the packet and return its payload.
    pub fn into_payload(self) -> Bytes {
        match self.buf {
            Some(PayloadBuf::Fixed(bytes)) => bytes,
            Some(PayloadBuf::Filling(buf)) => buf.freeze(),
            Some(PayloadBuf::Deferred(cell)) => cell.fix(),
            None => Bytes::new(),
        }
    }

    /// Whether the 4-byte length prefix has fully moved.
    #[inline]
    pub fn is_length_known(&self) -> bool {
        self.transferred >= 0
    }

    /// Whether the whole packet (prefix + payload) has moved.
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.is_length_known() && self.transferred == self.length
    }

    /// Allocate the inbound payload buffer once the prefix is known.
    /// Called exactly once per packet, and never for zero-length packets.
    pub(crate) fn begin_payload(&mut self) {
        debug_assert!(self.is_length_known() && self.length > 0);
        debug_assert!(self.buf.is_none());
        self.buf = Some(PayloadBuf::Filling(BytesMut::zeroed(self.length as usize)));
    }

    /// Unfilled region of the inbound payload buffer.
    pub(crate) fn recv_region(&mut self) -> &mut [u8] {
        let start = self.transferred.max(0) as usize;
        match &mut self.buf {
            Some(PayloadBuf::Filling(buf)) => &mut buf[start..],
            _ => &mut [],
        }
    }

    /// Convert a fully received payload into its immutable form.
    pub(crate) fn finish_receive(&mut self) {
        debug_assert!(self.is_complete());
        if let Some(PayloadBuf::Filling(buf)) = self.buf.take() {
            self.buf = Some(PayloadBuf::Fixed(buf.freeze()));
        }
    }

    /// Fix a deferred payload for transmission. Called by the send side when
    /// the packet is dequeued; after this point `replace_payload` on the
    /// originating [`DynamicPacket`] reports "not applied".
    pub(crate) fn resolve_deferred(&mut self) {
        if let Some(PayloadBuf::Deferred(cell)) = &self.buf {
            let payload = cell.fix();
            debug_assert!(payload.len() <= i32::MAX as usize);
            self.length = payload.len() as i32;
            self.buf = Some(PayloadBuf::Fixed(payload));
        }
    }
}

impl From<Bytes> for Packet {
    fn from(payload: Bytes) -> Self {
        Packet::new(payload)
    }
}

impl From<Vec<u8>> for Packet {
    fn from(payload: Vec<u8>) -> Self {
        Packet::new(Bytes::from(payload))
    }
}

/// Shared payload cell backing a [`DynamicPacket`].
#[derive(Debug)]
pub(crate) struct PayloadCell {
    state: Mutex<CellState>,
}

#[derive(Debug)]
struct CellState {
    payload: Bytes,
    fixed: bool,
    replaced: bool,
}

impl PayloadCell {
    fn new(payload: Bytes) -> Self {
        Self {
            state: Mutex::new(CellState {
                payload,
                fixed: false,
                replaced: false,
            }),
        }
    }

    /// Replace the payload. Fails (returns `false`) once fixed or after the
    /// single allowed replacement has been used.
    fn replace(&self, payload: Bytes) -> bool {
        let mut state = self.state.lock();
        if state.fixed || state.replaced {
            return false;
        }
        state.payload = payload;
        state.replaced = true;
        true
    }

    /// Lock the payload for transmission and return a snapshot of it.
    fn fix(&self) -> Bytes {
        let mut state = self.state.lock();
        state.fixed = true;
        state.payload.clone()
    }

    fn is_fixed(&self) -> bool {
        self.state.lock().fixed
    }
}

/// An outbound packet whose payload is decided after enqueue.
///
/// The caller keeps this handle after calling [`Mailbox::send_dynamic`]
/// (which enqueues a packet referencing the same cell) and may replace the
/// payload at most once. Once the send side fixes the packet for
/// transmission the replacement reports "not applied", so the transfer never
/// observes a buffer mutating mid-flight.
///
/// [`Mailbox::send_dynamic`]: crate::Mailbox::send_dynamic
#[derive(Debug, Clone)]
pub struct DynamicPacket {
    cell: Arc<PayloadCell>,
}

impl DynamicPacket {
    /// Create a dynamic packet with an empty initial payload.
    pub fn new() -> Self {
        Self {
            cell: Arc::new(PayloadCell::new(Bytes::new())),
        }
    }

    /// Create a dynamic packet with an initial payload. Setting the initial
    /// payload does not count as the single allowed replacement.
    pub fn with_payload(payload: impl Into<Bytes>) -> Self {
        Self {
            cell: Arc::new(PayloadCell::new(payload.into())),
        }
    }

    /// Replace the payload. Returns whether the replacement was applied:
    /// `false` once the packet is fixed for transmission or after a previous
    /// replacement, with no error raised.
    pub fn replace_payload(&self, payload: impl Into<Bytes>) -> bool {
        let payload = payload.into();
        assert!(
            payload.len() <= i32::MAX as usize,
            "payload length {} does not fit the 4-byte signed prefix",
            payload.len()
        );
        self.cell.replace(payload)
    }

    /// Whether the payload has been locked for transmission.
    pub fn is_fixed(&self) -> bool {
        self.cell.is_fixed()
    }

    /// Produce the queueable packet referencing this cell. The packet's
    /// length is decided when the send side fixes the cell.
    pub(crate) fn packet(&self) -> Packet {
        Packet {
            length: 0,
            transferred: TRANSFER_START,
            buf: Some(PayloadBuf::Deferred(self.cell.clone())),
        }
    }
}

impl Default for DynamicPacket {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_packet_progress_starts_at_prefix() {
        let packet = Packet::new(Bytes::from_static(b"hello"));
        assert_eq!(packet.len(), 5);
        assert!(!packet.is_length_known());
        assert!(!packet.is_complete());
        assert_eq!(packet.payload(), b"hello");
    }

    #[test]
    fn test_empty_packet_has_no_buffer() {
        let packet = Packet::empty();
        assert!(packet.is_empty());
        assert!(packet.buf.is_none());
        assert!(packet.payload().is_empty());
    }

    #[test]
    fn test_received_packet_is_complete() {
        let packet = Packet::received(Bytes::from_static(b"abc"));
        assert!(packet.is_complete());
        assert_eq!(packet.payload(), b"abc");

        let empty = Packet::received_empty();
        assert!(empty.is_complete());
        assert!(empty.buf.is_none());
    }

    #[test]
    fn test_receive_fill_and_finish() {
        let mut packet = Packet::for_receive();
        packet.transferred = 0;
        packet.length = 4;
        packet.begin_payload();

        packet.recv_region()[..2].copy_from_slice(b"ab");
        packet.transferred += 2;
        assert!(!packet.is_complete());

        packet.recv_region()[..2].copy_from_slice(b"cd");
        packet.transferred += 2;
        assert!(packet.is_complete());

        packet.finish_receive();
        assert_eq!(packet.payload(), b"abcd");
        assert_eq!(packet.into_payload(), Bytes::from_static(b"abcd"));
    }

    #[test]
    fn test_dynamic_replace_once() {
        let dynamic = DynamicPacket::new();
        assert!(dynamic.replace_payload(Bytes::from_static(b"first")));
        // Second replacement is refused without error.
        assert!(!dynamic.replace_payload(Bytes::from_static(b"second")));

        let mut packet = dynamic.packet();
        packet.resolve_deferred();
        assert_eq!(packet.payload(), b"first");
    }

    #[test]
    fn test_dynamic_replace_refused_after_fix() {
        let dynamic = DynamicPacket::with_payload(Bytes::from_static(b"initial"));
        let mut packet = dynamic.packet();

        packet.resolve_deferred();
        assert!(dynamic.is_fixed());
        assert!(!dynamic.replace_payload(Bytes::from_static(b"late")));
        assert_eq!(packet.payload(), b"initial");
        assert_eq!(packet.len(), 7);
    }

    #[test]
    fn test_dynamic_initial_payload_does_not_consume_replacement() {
        let dynamic = DynamicPacket::with_payload(Bytes::from_static(b"a"));
        assert!(dynamic.replace_payload(Bytes::from_static(b"b")));

        let mut packet = dynamic.packet();
        packet.resolve_deferred();
        assert_eq!(packet.payload(), b"b");
    }

    #[test]
    fn test_deferred_payload_hidden_until_fixed() {
        let dynamic = DynamicPacket::with_payload(Bytes::from_static(b"xyz"));
        let packet = dynamic.packet();
        assert!(packet.payload().is_empty());
    }
}
