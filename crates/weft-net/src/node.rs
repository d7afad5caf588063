//! Dial/listen entry points.

use std::sync::Arc;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use weft_engine::{Endpoint, Engine};

use crate::clock::{Clock, TokioClock};
use crate::config::NetConfig;
use crate::error::NetError;
use crate::listener::StreamListener;
use crate::router::Router;
use crate::stream::StreamConn;

/// One engine instance wrapped for transport use.
///
/// The node holds the engine's [`Router`] — the single owner of the
/// engine's message and presence callback slots — so any number of
/// connections can share the engine without trampling each other's
/// registrations. Independent nodes over independent engines never contend.
pub struct Node<E: Engine> {
    engine: Arc<E>,
    router: Arc<Router<E>>,
    clock: Arc<dyn Clock>,
    config: NetConfig,
    shutdown: CancellationToken,
}

impl<E: Engine> Node<E> {
    /// Wrap an engine with the default tokio clock.
    pub fn new(engine: Arc<E>, config: NetConfig) -> Self {
        Self::with_clock(engine, config, Arc::new(TokioClock))
    }

    /// Wrap an engine with an injected [`Clock`].
    pub fn with_clock(engine: Arc<E>, config: NetConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            router: Router::new(engine.clone()),
            engine,
            clock,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// This node's identity.
    pub fn local_endpoint(&self) -> Endpoint {
        self.engine.local_endpoint()
    }

    /// Dial `remote`, waiting up to the configured dial timeout for the
    /// peer to come online.
    pub async fn connect(&self, remote: &Endpoint) -> Result<StreamConn<E>, NetError> {
        let deadline = self.clock.now() + self.config.dial_timeout;
        self.connect_deadline(remote, Some(deadline)).await
    }

    /// Dial `remote` under an absolute deadline (`None`: wait forever).
    ///
    /// Reuses an engine peer that already holds the remote key, otherwise
    /// sends a peer request with the configured greeting. The returned
    /// connection is registered and Connected; if the peer does not come
    /// online in time the half-built connection is torn down and
    /// [`NetError::Timeout`] is returned.
    pub async fn connect_deadline(
        &self,
        remote: &Endpoint,
        deadline: Option<Instant>,
    ) -> Result<StreamConn<E>, NetError> {
        let key = remote.public_key().ok_or(NetError::PeerNotFound {
            op: "connect",
            endpoint: *remote,
        })?;

        let existing = self
            .engine
            .peers()
            .into_iter()
            .find(|(_, p)| p.public_key == *key);
        let peer = match existing {
            Some((peer, _)) => peer,
            None => self
                .engine
                .add_peer(remote, &self.config.greeting)
                .map_err(|e| NetError::Engine {
                    op: "connect",
                    source: e,
                })?,
        };

        // Presence may have flipped while we were registering; seed the
        // connection from the engine's current view so an already-online
        // peer connects immediately.
        let connected = self
            .engine
            .peers()
            .get(&peer)
            .map(|p| p.online)
            .unwrap_or(false);

        let conn = StreamConn::attach(
            self.engine.clone(),
            self.router.clone(),
            self.clock.clone(),
            &self.config,
            peer,
            *remote,
            connected,
        );

        if let Err(e) = conn.await_online(deadline, &self.shutdown).await {
            let _ = conn.close();
            return Err(e);
        }
        Ok(conn)
    }

    /// Start listening for inbound stream connections.
    ///
    /// The engine has a single request slot, so at most one listener should
    /// be live per node; a second call replaces the first listener's
    /// registration.
    pub fn listen(&self) -> Result<StreamListener<E>, NetError> {
        Ok(StreamListener::install(
            self.engine.clone(),
            self.router.clone(),
            self.clock.clone(),
            self.config.clone(),
        ))
    }

    /// Cancel in-flight dials. Does not touch the engine's lifecycle.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}
