//! Accepting inbound stream connections.

use std::collections::VecDeque;
use std::pin::pin;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use weft_engine::{Endpoint, Engine, EngineError, PeerId, PublicKey, RequestHandler};

use crate::clock::Clock;
use crate::config::NetConfig;
use crate::error::NetError;
use crate::router::Router;
use crate::stream::StreamConn;
use crate::Listener;

struct ListenerShared<E: Engine> {
    engine: Arc<E>,
    router: Arc<Router<E>>,
    clock: Arc<dyn Clock>,
    config: NetConfig,
    /// Ready connections waiting for `accept`. Bounded by `accept_backlog`.
    ready: Mutex<VecDeque<StreamConn<E>>>,
    /// Engine failures surfaced through `accept`.
    errors: Mutex<VecDeque<NetError>>,
    /// Wakes `accept` when `ready` or `errors` grows.
    notify: Notify,
    /// Inbound requests held for the application in manual-accept mode.
    requests: Mutex<VecDeque<(PublicKey, Vec<u8>)>>,
    request_notify: Notify,
    closed: CancellationToken,
    runtime: Handle,
}

impl<E: Engine> ListenerShared<E> {
    /// Admit a peer: add it to the engine, then wait out the presence
    /// window and queue a ready connection.
    fn admit(self: &Arc<Self>, public_key: PublicKey) {
        let peer = match self.engine.add_peer_by_key(&public_key) {
            Ok(peer) => peer,
            // A peer re-requesting is already in the engine; find its id.
            Err(EngineError::AlreadyPeer) => {
                match self
                    .engine
                    .peers()
                    .into_iter()
                    .find(|(_, p)| p.public_key == public_key)
                {
                    Some((peer, _)) => peer,
                    None => return,
                }
            }
            Err(e) => {
                self.push_error(NetError::Engine {
                    op: "accept",
                    source: e,
                });
                return;
            }
        };

        let shared = self.clone();
        self.runtime.spawn(async move {
            shared.await_presence(peer, public_key).await;
        });
    }

    /// Poll presence until the peer reports online or the window expires.
    async fn await_presence(self: Arc<Self>, peer: PeerId, public_key: PublicKey) {
        let deadline = self.clock.now() + self.config.accept_window;
        loop {
            if self.closed.is_cancelled() {
                return;
            }
            let online = self
                .engine
                .peers()
                .get(&peer)
                .map(|p| p.online)
                .unwrap_or(false);
            if online {
                break;
            }
            if self.clock.now() >= deadline {
                // Window expired: discard the half-built connection silently.
                tracing::debug!(peer, "presence window expired, discarding inbound request");
                let _ = self.engine.remove_peer(peer);
                return;
            }
            let next_poll = self.clock.now() + self.config.presence_poll;
            tokio::select! {
                _ = self.closed.cancelled() => return,
                _ = self.clock.sleep_until(next_poll.min(deadline)) => {}
            }
        }

        // Inbound requests carry only the key; the anti-spam value is not
        // part of the request, so the remote endpoint reports it as zero.
        let remote = Endpoint::from_key(public_key, Default::default());
        let conn = StreamConn::attach(
            self.engine.clone(),
            self.router.clone(),
            self.clock.clone(),
            &self.config,
            peer,
            remote,
            true,
        );

        let mut ready = self.ready.lock().unwrap();
        if ready.len() >= self.config.accept_backlog {
            // Deliberate backpressure, not an error.
            drop(ready);
            tracing::warn!(peer, "accept queue full, dropping inbound connection");
            let _ = conn.close();
            return;
        }
        ready.push_back(conn);
        drop(ready);
        self.notify.notify_waiters();
    }

    fn push_error(&self, err: NetError) {
        self.errors.lock().unwrap().push_back(err);
        self.notify.notify_waiters();
    }

    fn push_request(&self, public_key: PublicKey, greeting: &[u8]) {
        let mut requests = self.requests.lock().unwrap();
        if requests.len() >= self.config.accept_backlog {
            tracing::debug!("request queue full, dropping inbound request");
            return;
        }
        requests.push_back((public_key, greeting.to_vec()));
        drop(requests);
        self.request_notify.notify_waiters();
    }
}

/// Listens for inbound stream connections on an engine.
///
/// Construction installs the engine's single inbound-request callback. In
/// auto-accept mode (the default) every request is registered as a peer and,
/// once the peer reports online within the accept window, a ready
/// [`StreamConn`] is queued for [`accept`](StreamListener::accept). With
/// [`NetConfig::auto_accept`] disabled, requests are surfaced through
/// [`next_request`](StreamListener::next_request) instead and admitted with
/// [`approve`](StreamListener::approve).
///
/// At most one listener can be live per engine instance — the request slot
/// is single, like the message and presence slots.
pub struct StreamListener<E: Engine> {
    shared: Arc<ListenerShared<E>>,
    local: Endpoint,
}

impl<E: Engine> StreamListener<E> {
    pub(crate) fn install(
        engine: Arc<E>,
        router: Arc<Router<E>>,
        clock: Arc<dyn Clock>,
        config: NetConfig,
    ) -> Self {
        let local = engine.local_endpoint();
        let shared = Arc::new(ListenerShared {
            engine,
            router,
            clock,
            config,
            ready: Mutex::new(VecDeque::new()),
            errors: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            requests: Mutex::new(VecDeque::new()),
            request_notify: Notify::new(),
            closed: CancellationToken::new(),
            runtime: Handle::current(),
        });

        let handler: RequestHandler = {
            let shared = shared.clone();
            Arc::new(move |public_key, greeting| {
                if shared.closed.is_cancelled() {
                    return;
                }
                if shared.config.auto_accept {
                    shared.admit(public_key);
                } else {
                    shared.push_request(public_key, greeting);
                }
            })
        };
        shared.engine.set_request_handler(Some(handler));

        Self { shared, local }
    }

    /// Wait for the next ready connection.
    ///
    /// Returns queued engine errors as they surface and
    /// [`NetError::ListenerClosed`] once the listener is closed.
    pub async fn accept(&self) -> Result<StreamConn<E>, NetError> {
        loop {
            if self.shared.closed.is_cancelled() {
                return Err(NetError::ListenerClosed { op: "accept" });
            }
            let mut wake = pin!(self.shared.notify.notified());
            wake.as_mut().enable();

            if let Some(conn) = self.shared.ready.lock().unwrap().pop_front() {
                return Ok(conn);
            }
            if let Some(err) = self.shared.errors.lock().unwrap().pop_front() {
                return Err(err);
            }

            tokio::select! {
                _ = &mut wake => {}
                _ = self.shared.closed.cancelled() => {
                    return Err(NetError::ListenerClosed { op: "accept" });
                }
            }
        }
    }

    /// Wait for the next inbound request (manual-accept mode).
    ///
    /// Yields the requester's public key and greeting. In auto-accept mode
    /// this never yields.
    pub async fn next_request(&self) -> Result<(PublicKey, Vec<u8>), NetError> {
        loop {
            if self.shared.closed.is_cancelled() {
                return Err(NetError::ListenerClosed { op: "next_request" });
            }
            let mut wake = pin!(self.shared.request_notify.notified());
            wake.as_mut().enable();

            if let Some(request) = self.shared.requests.lock().unwrap().pop_front() {
                return Ok(request);
            }

            tokio::select! {
                _ = &mut wake => {}
                _ = self.shared.closed.cancelled() => {
                    return Err(NetError::ListenerClosed { op: "next_request" });
                }
            }
        }
    }

    /// Admit a requester surfaced by [`next_request`](Self::next_request).
    ///
    /// Runs the same add-peer and presence-window path as auto-accept; the
    /// connection arrives through [`accept`](Self::accept).
    pub fn approve(&self, public_key: &PublicKey) -> Result<(), NetError> {
        if self.shared.closed.is_cancelled() {
            return Err(NetError::ListenerClosed { op: "approve" });
        }
        self.shared.admit(*public_key);
        Ok(())
    }

    /// Stop accepting: cancel internal work, drain and close queued
    /// connections, uninstall the request callback. Idempotent, and never
    /// touches the engine's own lifecycle.
    pub fn close(&self) -> Result<(), NetError> {
        if self.shared.closed.is_cancelled() {
            return Ok(());
        }
        self.shared.closed.cancel();
        self.shared.engine.set_request_handler(None);

        let queued: Vec<_> = self.shared.ready.lock().unwrap().drain(..).collect();
        for conn in queued {
            let _ = conn.close();
        }
        Ok(())
    }

    /// This listener's identity.
    pub fn local_addr(&self) -> Endpoint {
        self.local
    }
}

impl<E: Engine> Drop for StreamListener<E> {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[async_trait]
impl<E: Engine> Listener for StreamListener<E> {
    type Conn = StreamConn<E>;
    type Addr = Endpoint;

    async fn accept(&self) -> Result<StreamConn<E>, NetError> {
        StreamListener::accept(self).await
    }

    fn close(&self) -> Result<(), NetError> {
        StreamListener::close(self)
    }

    fn local_addr(&self) -> Endpoint {
        StreamListener::local_addr(self)
    }
}
