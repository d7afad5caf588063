//! Stream and datagram transports over a message-oriented P2P engine.
//!
//! The engine underneath ([`weft_engine::Engine`]) addresses peers by
//! identity, delivers whole messages, and exposes exactly one callback slot
//! per event kind. This crate adapts that into conventional transport
//! objects an application can use without any engine-specific logic:
//!
//! - [`StreamConn`] / [`StreamListener`] — a reliable ordered byte stream
//!   per peer, with chunked writes and read/write deadlines.
//! - [`DatagramSocket`] — a packet socket bound to a UDP endpoint, with
//!   optional per-peer authenticated encryption.
//! - [`DatagramListener`] / [`DatagramConn`] — one shared socket
//!   demultiplexed into per-source pseudo-connections.
//! - [`Node`] — the dial/listen entry points tying it together.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use weft_engine::testing::LoopbackNet;
//! use weft_net::{NetConfig, Node};
//!
//! # async fn example() -> Result<(), weft_net::NetError> {
//! let net = LoopbackNet::new();
//! let alice = Node::new(net.engine(), NetConfig::new());
//! let bob = Node::new(net.engine(), NetConfig::new());
//!
//! let listener = bob.listen()?;
//! let conn = alice.connect(&bob.local_endpoint()).await?;
//! let accepted = listener.accept().await?;
//!
//! conn.write(b"hello").await?;
//! let mut buf = [0u8; 16];
//! let n = accepted.read(&mut buf).await?;
//! assert_eq!(&buf[..n], b"hello");
//! # Ok(())
//! # }
//! ```

mod clock;
mod config;
mod crypto;
mod datagram;
mod error;
mod listener;
mod mux;
mod node;
mod router;
mod stream;

pub use clock::{Clock, TokioClock};
pub use config::{NetConfig, DEFAULT_CHUNK_SIZE};
pub use crypto::{generate_keypair, generate_nonce, KeyPair, SecretKey, NONCE_LEN, TAG_LEN};
pub use datagram::DatagramSocket;
pub use error::NetError;
pub use listener::StreamListener;
pub use mux::{DatagramConn, DatagramListener};
pub use node::Node;
pub use stream::StreamConn;

// Re-export the boundary types callers hold.
pub use weft_engine::{Endpoint, PublicKey};

use async_trait::async_trait;
use tokio::time::Instant;

/// Reliable ordered byte-stream contract.
///
/// Concrete types also expose these as inherent methods; the trait exists so
/// transport-agnostic code can hold any stream connection. Deadlines are
/// absolute instants; `None` clears one. A read or write already parked when
/// its deadline is moved keeps the deadline it started with.
#[async_trait]
pub trait Conn: Send + Sync {
    type Addr;

    /// Read up to `buf.len()` bytes, blocking until data, deadline or close.
    async fn read(&self, buf: &mut [u8]) -> Result<usize, NetError>;

    /// Write all of `buf`, blocking until the peer is reachable.
    async fn write(&self, buf: &[u8]) -> Result<usize, NetError>;

    /// Tear the connection down. Idempotent.
    fn close(&self) -> Result<(), NetError>;

    fn local_addr(&self) -> Self::Addr;
    fn remote_addr(&self) -> Self::Addr;

    /// Set both deadlines at once.
    fn set_deadline(&self, deadline: Option<Instant>);
    fn set_read_deadline(&self, deadline: Option<Instant>);
    fn set_write_deadline(&self, deadline: Option<Instant>);
}

/// Unreliable datagram contract.
#[async_trait]
pub trait PacketConn: Send + Sync {
    type Addr;

    /// Receive one datagram, truncating if `buf` is short.
    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, Self::Addr), NetError>;

    /// Send one datagram to `addr`.
    async fn send_to(&self, buf: &[u8], addr: Self::Addr) -> Result<usize, NetError>;

    /// Tear the socket down. Idempotent.
    fn close(&self) -> Result<(), NetError>;

    fn local_addr(&self) -> Self::Addr;

    /// Set both deadlines at once.
    fn set_deadline(&self, deadline: Option<Instant>);
    fn set_read_deadline(&self, deadline: Option<Instant>);
    fn set_write_deadline(&self, deadline: Option<Instant>);
}

/// Accept-loop contract shared by the stream and datagram listeners.
#[async_trait]
pub trait Listener: Send + Sync {
    type Conn;
    type Addr;

    /// Wait for the next ready connection.
    async fn accept(&self) -> Result<Self::Conn, NetError>;

    /// Stop accepting and release queued connections. Idempotent.
    fn close(&self) -> Result<(), NetError>;

    fn local_addr(&self) -> Self::Addr;
}
