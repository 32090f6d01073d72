//! Length-prefixed packet mailboxes over duplex sockets.
//!
//! `wirebox` turns an already-connected TCP socket into a [`Mailbox`]: a
//! pair of concurrent packet queues glued to the wire by a framing pump.
//! Every packet travels as a 4-byte little-endian signed length prefix
//! followed by that many payload bytes; payloads are opaque to the library.
//!
//! # Driving modes
//!
//! A mailbox is driven in exactly one of two ways at a time:
//!
//! - **Polling**: an external scheduler calls [`Mailbox::tick`] repeatedly.
//!   Each call does a bounded amount of non-blocking work and returns;
//!   partially transferred packets resume on the next call. This lets one
//!   thread fairly drive many connections.
//! - **Listening**: [`Mailbox::start_listen`] spawns a cooperative
//!   receive/send task pair on the tokio runtime. [`Mailbox::stop_listen_wait`]
//!   stops the pair (optionally draining the outbound queue first) and hands
//!   the socket back to polling mode.
//!
//! In both modes, sending is [`Mailbox::send`] and receiving is
//! [`Mailbox::next`] / [`Mailbox::recv`]; queue operations are safe from any
//! thread.
//!
//! # Example
//!
//! ```no_run
//! use wirebox::{Mailbox, Packet};
//!
//! # fn main() -> wirebox::Result<()> {
//! let socket = std::net::TcpStream::connect("127.0.0.1:4000")?;
//! let mailbox = Mailbox::new(socket)?;
//!
//! mailbox.send(Packet::from(b"hello".to_vec()));
//! while mailbox.tick() {
//!     if let Some(packet) = mailbox.next() {
//!         println!("got {} bytes", packet.len());
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod error;
mod framing;
mod listen;
mod mailbox;
pub mod owner;
pub mod packet;
pub mod queue;
pub mod wire;

pub use error::{Result, WireboxError};
pub use listen::{ListenOptions, StopPolicy};
pub use mailbox::{Mailbox, MailboxConfig, DEFAULT_MAX_FRAGMENTS_PER_TICK};
pub use owner::{MailboxOwner, MailboxSlot, OwnerRegistry};
pub use packet::{DynamicPacket, Packet};
pub use queue::PacketQueue;
