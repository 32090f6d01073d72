//! Cooperative driving mode: the "listen" task pair.
//!
//! Instead of an external scheduler ticking the mailbox, [`Mailbox::start_listen`]
//! spawns two independently cancellable tasks over the same queues: a receive
//! loop (exact prefix read, validate, exact payload read, push inbound) and a
//! send loop (await next outbound packet, write prefix and payload whole).
//! Framing behavior is observably identical to the synchronous pump.
//!
//! Cancellation is cooperative: each loop watches its own cancel signal at
//! the top of every iteration and at every suspension point. Stopping either
//! cancels both loops immediately or lets the send loop drain the outbound
//! queue first.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{Result, WireboxError};
use crate::mailbox::{Mailbox, Transport};
use crate::packet::Packet;
use crate::wire::{decode_prefix, encode_prefix, validate_length, PREFIX_SIZE};

/// Rolling window used by the receive-side rate cap.
const ONE_SECOND: Duration = Duration::from_secs(1);

/// How to stop the cooperative pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopPolicy {
    /// Cancel both loops right away; queued outbound packets stay queued.
    Immediate,
    /// Cancel the receive loop right away, but let the send loop run until
    /// the outbound queue is observed empty.
    DrainOnEmpty,
}

/// Options for the cooperative pump.
#[derive(Debug, Clone, Default)]
pub struct ListenOptions {
    /// Receive-side rate cap: at most this many packets per rolling
    /// one-second window (0 = uncapped). Once reached, the receive loop
    /// sleeps out the remainder of the window.
    pub max_packets_per_second: u32,
}

/// Cancellation state shared by both loops and the stop operations.
pub(crate) struct ListenShared {
    recv_cancel: watch::Sender<bool>,
    send_cancel: watch::Sender<bool>,
    drain_on_empty: AtomicBool,
}

impl ListenShared {
    fn cancel_all(&self) {
        let _ = self.recv_cancel.send(true);
        let _ = self.send_cancel.send(true);
    }
}

/// Handle to a running listen pair, stored on the mailbox.
pub(crate) struct ListenControl {
    shared: Arc<ListenShared>,
    recv_task: JoinHandle<()>,
    send_task: JoinHandle<()>,
}

impl Mailbox {
    /// Start the cooperative pump: spawn the receive and send loops.
    ///
    /// Mutually exclusive with the synchronous pump and with itself: calling
    /// this while a listen pair is already active returns
    /// [`WireboxError::AlreadyListening`] naming the offending connection.
    /// Must be called from within a tokio runtime.
    pub fn start_listen(self: &Arc<Self>, options: ListenOptions) -> Result<()> {
        let mut listen = self.listen.lock();
        if listen.is_some() {
            return Err(WireboxError::AlreadyListening(self.peer_label().to_string()));
        }
        if !self.is_usable() {
            return Err(WireboxError::ConnectionClosed);
        }

        let stream = {
            let mut io = self.io.lock();
            match std::mem::replace(&mut io.transport, Transport::Closed) {
                Transport::Polling(stream) => match TcpStream::from_std(stream) {
                    Ok(stream) => {
                        let stream = Arc::new(stream);
                        io.transport = Transport::Listening(stream.clone());
                        stream
                    }
                    Err(error) => {
                        self.mark_failed();
                        return Err(error.into());
                    }
                },
                listening @ Transport::Listening(_) => {
                    io.transport = listening;
                    return Err(WireboxError::AlreadyListening(self.peer_label().to_string()));
                }
                Transport::Closed => return Err(WireboxError::ConnectionClosed),
            }
        };

        let (recv_cancel, recv_rx) = watch::channel(false);
        let (send_cancel, send_rx) = watch::channel(false);
        let shared = Arc::new(ListenShared {
            recv_cancel,
            send_cancel,
            drain_on_empty: AtomicBool::new(false),
        });

        let recv_task = tokio::spawn(recv_loop(
            self.clone(),
            stream.clone(),
            recv_rx,
            shared.clone(),
            options,
        ));
        let send_task = tokio::spawn(send_loop(self.clone(), stream, send_rx, shared.clone()));

        *listen = Some(ListenControl {
            shared,
            recv_task,
            send_task,
        });
        Ok(())
    }

    /// Request the cooperative pump to stop, without waiting for the loops
    /// to actually terminate. No-op when the pump is not running.
    pub fn stop_listen(&self, policy: StopPolicy) {
        let listen = self.listen.lock();
        let Some(control) = listen.as_ref() else {
            return;
        };

        let _ = control.shared.recv_cancel.send(true);
        match policy {
            StopPolicy::Immediate => {
                let _ = control.shared.send_cancel.send(true);
            }
            StopPolicy::DrainOnEmpty => {
                control.shared.drain_on_empty.store(true, Ordering::Release);
                // The send loop re-checks the flag after every completed
                // send; only an already-empty queue is cancelled here.
                if self.outbound.is_empty() {
                    let _ = control.shared.send_cancel.send(true);
                }
            }
        }
    }

    /// Request the cooperative pump to stop per `policy`, then wait for both
    /// loops to terminate. When the connection is still healthy the socket
    /// returns to polling mode, ready for `tick()` again.
    pub async fn stop_listen_wait(&self, policy: StopPolicy) {
        self.stop_listen(policy);

        let control = self.listen.lock().take();
        let Some(control) = control else {
            return;
        };
        let _ = control.recv_task.await;
        let _ = control.send_task.await;

        self.reclaim_socket();
    }

    /// Take the socket back from the finished loop pair.
    fn reclaim_socket(&self) {
        let mut io = self.io.lock();
        match std::mem::replace(&mut io.transport, Transport::Closed) {
            Transport::Listening(stream) => {
                if !self.is_usable() {
                    return; // dropping the last reference closes the socket
                }
                match Arc::try_unwrap(stream) {
                    Ok(stream) => match stream.into_std() {
                        Ok(stream) => io.transport = Transport::Polling(stream),
                        Err(error) => {
                            tracing::error!(
                                peer = %self.peer_label(),
                                "failed to reclaim socket after listen: {error}"
                            );
                            self.mark_failed();
                        }
                    },
                    Err(_) => {
                        tracing::error!(
                            peer = %self.peer_label(),
                            "socket still shared after loop shutdown"
                        );
                        self.mark_failed();
                    }
                }
            }
            other => io.transport = other,
        }
    }
}

/// Receive loop wrapper: runs the loop, records any fatal outcome.
async fn recv_loop(
    mailbox: Arc<Mailbox>,
    stream: Arc<TcpStream>,
    mut cancel: watch::Receiver<bool>,
    shared: Arc<ListenShared>,
    options: ListenOptions,
) {
    if let Err(error) = recv_loop_inner(&mailbox, &stream, &mut cancel, options).await {
        match &error {
            WireboxError::ConnectionClosed => {
                tracing::debug!(peer = %mailbox.peer_label(), "receive loop: connection closed")
            }
            WireboxError::Protocol(msg) => {
                tracing::warn!(peer = %mailbox.peer_label(), "receive loop: protocol violation: {msg}")
            }
            other => {
                tracing::error!(peer = %mailbox.peer_label(), "receive loop: transport fault: {other}")
            }
        }
        mailbox.mark_failed();
        shared.cancel_all();
    }
}

async fn recv_loop_inner(
    mailbox: &Mailbox,
    stream: &TcpStream,
    cancel: &mut watch::Receiver<bool>,
    options: ListenOptions,
) -> Result<()> {
    let per_second = options.max_packets_per_second;

    loop {
        let window_start = Instant::now();
        let mut in_window = 0u32;

        loop {
            if *cancel.borrow() {
                return Ok(());
            }

            let mut prefix = [0u8; PREFIX_SIZE];
            tokio::select! {
                _ = cancel.changed() => return Ok(()),
                result = read_exact_now(stream, &mut prefix) => result?,
            }

            let length = decode_prefix(prefix);
            validate_length(length, mailbox.config.max_payload_size)?;

            let packet = if length == 0 {
                Packet::received_empty()
            } else {
                let mut payload = BytesMut::zeroed(length as usize);
                tokio::select! {
                    _ = cancel.changed() => return Ok(()),
                    result = read_exact_now(stream, &mut payload) => result?,
                }
                Packet::received(payload.freeze())
            };
            mailbox.inbound.push(packet);

            if per_second != 0 {
                in_window += 1;
                if in_window >= per_second {
                    break;
                }
            }
        }

        // Rate cap reached: rest for the remainder of this window.
        let elapsed = window_start.elapsed();
        if elapsed < ONE_SECOND {
            tokio::select! {
                _ = cancel.changed() => return Ok(()),
                _ = tokio::time::sleep(ONE_SECOND - elapsed) => {}
            }
        }
    }
}

/// Send loop wrapper: runs the loop, records any fatal outcome.
async fn send_loop(
    mailbox: Arc<Mailbox>,
    stream: Arc<TcpStream>,
    mut cancel: watch::Receiver<bool>,
    shared: Arc<ListenShared>,
) {
    if let Err(error) = send_loop_inner(&mailbox, &stream, &mut cancel, &shared).await {
        match &error {
            WireboxError::ConnectionClosed => {
                tracing::debug!(peer = %mailbox.peer_label(), "send loop: connection closed")
            }
            other => {
                tracing::error!(peer = %mailbox.peer_label(), "send loop: transport fault: {other}")
            }
        }
        mailbox.mark_failed();
        shared.cancel_all();
    }
}

async fn send_loop_inner(
    mailbox: &Mailbox,
    stream: &TcpStream,
    cancel: &mut watch::Receiver<bool>,
    shared: &ListenShared,
) -> Result<()> {
    loop {
        if *cancel.borrow() {
            return Ok(());
        }
        if shared.drain_on_empty.load(Ordering::Acquire) && mailbox.outbound.is_empty() {
            return Ok(());
        }

        let mut packet = tokio::select! {
            _ = cancel.changed() => return Ok(()),
            packet = mailbox.outbound.pop_wait() => packet,
        };
        packet.resolve_deferred();

        // Whole-packet writes: this mode never needs partial-write resumption.
        write_all_now(stream, &encode_prefix(packet.len() as i32)).await?;
        if !packet.is_empty() {
            write_all_now(stream, packet.payload()).await?;
        }

        if shared.drain_on_empty.load(Ordering::Acquire) && mailbox.outbound.is_empty() {
            return Ok(());
        }
    }
}

/// Read exactly `buf.len()` bytes, suspending until they have all arrived.
async fn read_exact_now(stream: &TcpStream, buf: &mut [u8]) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        stream.readable().await?;
        match stream.try_read(&mut buf[filled..]) {
            Ok(0) => return Err(WireboxError::ConnectionClosed),
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Write all of `buf`, suspending until the transport has accepted it.
async fn write_all_now(stream: &TcpStream, buf: &[u8]) -> Result<()> {
    let mut written = 0;
    while written < buf.len() {
        stream.writable().await?;
        match stream.try_write(&buf[written..]) {
            Ok(0) => {
                return Err(WireboxError::Io(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "transport accepted zero bytes",
                )))
            }
            Ok(n) => written += n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
