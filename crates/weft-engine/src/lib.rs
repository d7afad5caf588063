//! Engine boundary for weft.
//!
//! The engine is an identity-based, message-oriented peer-to-peer core: it
//! knows peers by numeric id, delivers whole messages, and reports presence
//! through callbacks. This crate pins down that boundary — the [`Engine`]
//! trait plus the [`Endpoint`] identity codec — so the transport layer in
//! `weft-net` can be written against it without caring which concrete
//! engine is underneath.
//!
//! Each callback slot ([`Engine::set_message_handler`],
//! [`Engine::set_presence_handler`], [`Engine::set_request_handler`]) is a
//! single registration point per engine instance: installing a second
//! handler replaces the first. Anything that needs to share an engine
//! across many consumers has to multiplex above this boundary.

mod endpoint;
mod error;
pub mod testing;

pub use endpoint::{
    AntiSpam, Endpoint, PublicKey, ANTI_SPAM_LEN, CHECKSUM_LEN, ENDPOINT_STR_LEN, PUBLIC_KEY_LEN,
};
pub use error::{EngineError, IdentityError};

use std::collections::HashMap;
use std::sync::Arc;

/// Numeric peer identifier assigned by the engine.
pub type PeerId = u32;

/// Largest message payload the engine accepts, in bytes.
pub const MAX_MESSAGE_LEN: usize = 1372;

/// What the engine knows about one of its peers.
#[derive(Debug, Clone)]
pub struct PeerState {
    /// The peer's long-term public key.
    pub public_key: PublicKey,
    /// Whether the peer is currently reachable.
    pub online: bool,
}

/// Called with `(peer, payload)` for every message the engine delivers.
pub type MessageHandler = Arc<dyn Fn(PeerId, &[u8]) + Send + Sync>;

/// Called with `(peer, online)` whenever a peer's presence changes.
pub type PresenceHandler = Arc<dyn Fn(PeerId, bool) + Send + Sync>;

/// Called with `(public_key, greeting)` for every inbound peer request.
pub type RequestHandler = Arc<dyn Fn(PublicKey, &[u8]) + Send + Sync>;

/// The message-oriented peer-to-peer engine underneath the transports.
///
/// Implementations are shared across tasks; every method takes `&self`.
/// Handlers may be invoked from arbitrary engine-internal contexts and must
/// not block.
pub trait Engine: Send + Sync + 'static {
    /// This engine instance's own identity.
    fn local_endpoint(&self) -> Endpoint;

    /// Register a peer by full identity, sending `greeting` with the request.
    fn add_peer(&self, endpoint: &Endpoint, greeting: &[u8]) -> Result<PeerId, EngineError>;

    /// Register a peer by bare public key, without sending a request.
    ///
    /// Used to accept an inbound request whose key is already known.
    fn add_peer_by_key(&self, public_key: &PublicKey) -> Result<PeerId, EngineError>;

    /// Forget a peer.
    fn remove_peer(&self, peer: PeerId) -> Result<(), EngineError>;

    /// Snapshot of all known peers.
    fn peers(&self) -> HashMap<PeerId, PeerState>;

    /// Send one message to an online peer. Returns the engine's message id.
    ///
    /// The payload must not exceed [`MAX_MESSAGE_LEN`].
    fn send_message(&self, peer: PeerId, payload: &[u8]) -> Result<u32, EngineError>;

    /// Install (or with `None`, remove) the message callback.
    fn set_message_handler(&self, handler: Option<MessageHandler>);

    /// Install (or with `None`, remove) the presence callback.
    fn set_presence_handler(&self, handler: Option<PresenceHandler>);

    /// Install (or with `None`, remove) the inbound-request callback.
    fn set_request_handler(&self, handler: Option<RequestHandler>);
}
