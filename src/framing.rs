//! Resumable framing state machine.
//!
//! This is the receive/send logic behind [`Mailbox::tick`]: strictly
//! non-blocking, bounded per call, and able to resume a partially moved
//! prefix or payload on the next call. All progress lives in the in-flight
//! [`Packet`]s themselves, so the state machine carries nothing but the two
//! in-flight slots.
//!
//! The length prefix is read only when all 4 bytes are already available
//! (checked with a non-consuming peek); payload bytes are read as they
//! arrive, as many as the transport will give without blocking.
//!
//! [`Mailbox::tick`]: crate::Mailbox::tick

use std::io;

use crate::error::{Result, WireboxError};
use crate::mailbox::MailboxConfig;
use crate::packet::Packet;
use crate::queue::PacketQueue;
use crate::wire::{decode_prefix, encode_prefix, validate_length, PREFIX_SIZE};

/// Non-blocking byte transport as seen by the synchronous pump.
///
/// Every method returns immediately; "no progress possible right now" is
/// reported as `io::ErrorKind::WouldBlock` and is normal flow control, not a
/// fault.
pub(crate) trait PolledIo {
    /// Read available bytes without consuming them. `Ok(0)` means the peer
    /// has closed the connection.
    fn peek_now(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Read available bytes. `Ok(0)` means the peer has closed.
    fn read_now(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write as many bytes as the transport accepts right now.
    fn write_now(&mut self, buf: &[u8]) -> io::Result<usize>;
}

impl PolledIo for std::net::TcpStream {
    fn peek_now(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.peek(buf)
    }

    fn read_now(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        io::Read::read(self, buf)
    }

    fn write_now(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::Write::write(self, buf)
    }
}

/// Outcome of one non-blocking transfer attempt.
enum Attempt {
    /// Moved this many bytes (> 0).
    Moved(usize),
    /// Nothing available right now; stop this side for the current call.
    Stalled,
}

/// Map a non-blocking I/O result, treating `WouldBlock` (and `Interrupted`)
/// as a stall and a zero-byte read as connection loss.
fn attempt_read(result: io::Result<usize>) -> Result<Attempt> {
    match result {
        Ok(0) => Err(WireboxError::ConnectionClosed),
        Ok(n) => Ok(Attempt::Moved(n)),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(Attempt::Stalled),
        Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(Attempt::Stalled),
        Err(e) => Err(WireboxError::Io(e)),
    }
}

/// Same mapping for writes; a zero-byte write is an I/O fault, not closure.
fn attempt_write(result: io::Result<usize>) -> Result<Attempt> {
    match result {
        Ok(0) => Err(WireboxError::Io(io::Error::new(
            io::ErrorKind::WriteZero,
            "transport accepted zero bytes",
        ))),
        Ok(n) => Ok(Attempt::Moved(n)),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(Attempt::Stalled),
        Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(Attempt::Stalled),
        Err(e) => Err(WireboxError::Io(e)),
    }
}

/// The two in-flight slots of one connection.
#[derive(Debug, Default)]
pub(crate) struct FramingState {
    /// Inbound packet currently being assembled, if any.
    recv: Option<Packet>,
    /// Outbound packet currently being transmitted, if any.
    send: Option<Packet>,
}

impl FramingState {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Advance the receive side as far as currently possible.
    ///
    /// Completed packets go to `inbound`. Stops on stall, on the fragment
    /// budget, or on error; partial progress is kept in the in-flight slot
    /// for the next call.
    pub(crate) fn pump_recv(
        &mut self,
        io: &mut dyn PolledIo,
        config: &MailboxConfig,
        inbound: &PacketQueue,
    ) -> Result<()> {
        let mut fragments = 0usize;

        loop {
            let packet = self.recv.get_or_insert_with(Packet::for_receive);

            if !packet.is_length_known() {
                // Require the whole prefix before consuming any of it.
                let mut prefix = [0u8; PREFIX_SIZE];
                match attempt_read(io.peek_now(&mut prefix))? {
                    Attempt::Moved(n) if n >= PREFIX_SIZE => {}
                    _ => break,
                }

                // The peek saw all 4 bytes buffered. The transport may hand
                // them over in pieces, but a stall before all 4 arrive would
                // drop the consumed bytes and desynchronize the stream, so it
                // is a transport fault, not flow control.
                let mut consumed = 0;
                while consumed < PREFIX_SIZE {
                    match attempt_read(io.read_now(&mut prefix[consumed..]))? {
                        Attempt::Moved(n) => consumed += n,
                        Attempt::Stalled => {
                            return Err(WireboxError::Io(io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                "transport stalled mid-prefix after a full peek",
                            )))
                        }
                    }
                }

                packet.transferred += consumed as i32;
                packet.length = decode_prefix(prefix);
                validate_length(packet.length, config.max_payload_size)?;

                if packet.length == 0 {
                    let mut done = self.recv.take().unwrap_or_else(Packet::received_empty);
                    done.finish_receive();
                    inbound.push(done);
                    fragments += 1;
                    if config.max_fragments_per_tick != 0
                        && fragments >= config.max_fragments_per_tick
                    {
                        break;
                    }
                    continue;
                }

                packet.begin_payload();
            }

            match attempt_read(io.read_now(packet.recv_region()))? {
                Attempt::Moved(n) => packet.transferred += n as i32,
                Attempt::Stalled => break,
            }

            if packet.is_complete() {
                let mut done = self.recv.take().unwrap_or_else(Packet::received_empty);
                done.finish_receive();
                inbound.push(done);
                fragments += 1;
                if config.max_fragments_per_tick != 0 && fragments >= config.max_fragments_per_tick
                {
                    break;
                }
            } else {
                break;
            }
        }

        Ok(())
    }

    /// Advance the send side as far as currently possible.
    ///
    /// Dequeues from `outbound` without blocking. Stops on stall, on an empty
    /// queue, or on the per-call packet budget.
    pub(crate) fn pump_send(
        &mut self,
        io: &mut dyn PolledIo,
        config: &MailboxConfig,
        outbound: &PacketQueue,
    ) -> Result<()> {
        let mut sent = 0usize;

        loop {
            if self.send.is_none() {
                match outbound.try_pop() {
                    Some(mut packet) => {
                        packet.resolve_deferred();
                        self.send = Some(packet);
                    }
                    None => break,
                }
            }
            let packet = self.send.as_mut().expect("send slot was just filled");

            if !packet.is_length_known() {
                let prefix = encode_prefix(packet.length);
                let offset = (PREFIX_SIZE as i32 + packet.transferred) as usize;
                match attempt_write(io.write_now(&prefix[offset..]))? {
                    Attempt::Moved(n) => packet.transferred += n as i32,
                    Attempt::Stalled => break,
                }
                if !packet.is_length_known() {
                    // Short prefix write; resume next call.
                    break;
                }
            }

            if packet.transferred < packet.length {
                let n = {
                    let remaining = &packet.payload()[packet.transferred as usize..];
                    match attempt_write(io.write_now(remaining))? {
                        Attempt::Moved(n) => n,
                        Attempt::Stalled => break,
                    }
                };
                packet.transferred += n as i32;
            }

            if packet.is_complete() {
                self.send = None;
                sent += 1;
                if config.max_sends_per_tick != 0 && sent >= config.max_sends_per_tick {
                    break;
                }
            } else {
                break;
            }
        }

        Ok(())
    }

    /// Whether a receive or send is currently mid-packet.
    #[cfg(test)]
    fn in_flight(&self) -> (bool, bool) {
        (self.recv.is_some(), self.send.is_some())
    }
}
