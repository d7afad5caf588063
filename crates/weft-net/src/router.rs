//! Event fan-out for the engine's single callback slots.
//!
//! The engine exposes exactly one message callback and one presence
//! callback per instance; registering a second handler silently replaces
//! the first. The [`Router`] owns those two registrations and fans events
//! out to the logical connections sharing the engine, keyed by peer id.
//!
//! The router is held explicitly by its [`Node`](crate::Node) — there is no
//! global engine→router table. Its inner map exists only while at least one
//! connection is registered: the first registration installs the engine
//! callbacks, and the last unregistration removes them again.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use weft_engine::{Engine, PeerId};

use crate::stream::StreamState;

pub(crate) struct Router<E: Engine> {
    engine: Arc<E>,
    inner: Mutex<Option<HashMap<PeerId, Arc<StreamState>>>>,
}

impl<E: Engine> Router<E> {
    pub(crate) fn new(engine: Arc<E>) -> Arc<Self> {
        Arc::new(Self {
            engine,
            inner: Mutex::new(None),
        })
    }

    /// Add a connection to the map. Idempotent per peer id.
    ///
    /// The first registration installs the engine's message and presence
    /// callbacks; later registrations reuse them.
    pub(crate) fn register(self: &Arc<Self>, state: Arc<StreamState>) {
        let mut inner = self.inner.lock().unwrap();
        if inner.is_none() {
            self.install();
        }
        inner
            .get_or_insert_with(HashMap::new)
            .insert(state.peer, state);
    }

    /// Drop a connection from the map.
    ///
    /// When the map empties, the engine callbacks are uninstalled and the
    /// router goes dormant until the next registration.
    pub(crate) fn unregister(&self, peer: PeerId) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(map) = inner.as_mut() {
            map.remove(&peer);
            if map.is_empty() {
                *inner = None;
                self.engine.set_message_handler(None);
                self.engine.set_presence_handler(None);
            }
        }
    }

    /// Number of registered connections.
    pub(crate) fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .as_ref()
            .map(|map| map.len())
            .unwrap_or(0)
    }

    /// Whether the engine callbacks are currently installed.
    pub(crate) fn is_active(&self) -> bool {
        self.inner.lock().unwrap().is_some()
    }

    fn install(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.engine.set_message_handler(Some(Arc::new(move |peer, payload| {
            if let Some(router) = weak.upgrade() {
                router.route_message(peer, payload);
            }
        })));

        let weak = Arc::downgrade(self);
        self.engine.set_presence_handler(Some(Arc::new(move |peer, online| {
            if let Some(router) = weak.upgrade() {
                router.route_presence(peer, online);
            }
        })));
    }

    /// Append a payload to exactly the target connection's inbound queue
    /// and wake its readers. Unrelated connections are never signalled.
    fn route_message(&self, peer: PeerId, payload: &[u8]) {
        let inner = self.inner.lock().unwrap();
        let Some(state) = inner.as_ref().and_then(|map| map.get(&peer)) else {
            tracing::debug!(peer, len = payload.len(), "message for unregistered peer, dropping");
            return;
        };
        state.inbound.lock().unwrap().extend_from_slice(payload);
        state.data_ready.notify_waiters();
    }

    /// Update the connection's connected flag, signalling only on the
    /// offline→online edge. An online→online transition (e.g. the engine
    /// switching transports) must not re-signal.
    fn route_presence(&self, peer: PeerId, online: bool) {
        let inner = self.inner.lock().unwrap();
        let Some(state) = inner.as_ref().and_then(|map| map.get(&peer)) else {
            tracing::debug!(peer, online, "presence for unregistered peer, ignoring");
            return;
        };
        if online {
            if !state.connected.swap(true, Ordering::SeqCst) {
                state.came_online.notify_waiters();
            }
        } else {
            state.connected.store(false, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_engine::testing::LoopbackNet;

    #[test]
    fn callbacks_installed_once_for_many_registrations() {
        let net = LoopbackNet::new();
        let engine = net.engine();
        let router = Router::new(engine.clone());

        for peer in 0..4 {
            router.register(StreamState::stub(peer));
        }
        assert_eq!(router.len(), 4);
        assert_eq!(engine.message_handler_installs(), 1);
        assert_eq!(engine.presence_handler_installs(), 1);
    }

    #[test]
    fn router_retires_at_zero_connections() {
        let net = LoopbackNet::new();
        let engine = net.engine();
        let router = Router::new(engine.clone());

        router.register(StreamState::stub(0));
        router.register(StreamState::stub(1));
        assert!(router.is_active());

        router.unregister(0);
        assert!(router.is_active());
        assert!(engine.has_message_handler());

        router.unregister(1);
        assert!(!router.is_active());
        assert!(!engine.has_message_handler());

        // A later registration re-installs.
        router.register(StreamState::stub(2));
        assert!(engine.has_message_handler());
        assert_eq!(engine.message_handler_installs(), 2);
    }

    #[test]
    fn message_routed_only_to_target_peer() {
        let net = LoopbackNet::new();
        let engine = net.engine();
        let router = Router::new(engine.clone());

        let a = StreamState::stub(7);
        let b = StreamState::stub(9);
        router.register(a.clone());
        router.register(b.clone());

        router.route_message(7, b"payload");
        assert_eq!(&a.inbound.lock().unwrap()[..], b"payload");
        assert!(b.inbound.lock().unwrap().is_empty());
    }

    #[test]
    fn presence_signals_only_on_offline_online_edge() {
        let net = LoopbackNet::new();
        let engine = net.engine();
        let router = Router::new(engine.clone());

        let state = StreamState::stub(3);
        router.register(state.clone());
        assert!(!state.connected.load(Ordering::SeqCst));

        router.route_presence(3, true);
        assert!(state.connected.load(Ordering::SeqCst));
        // Transport switch: still online, flag stays set.
        router.route_presence(3, true);
        assert!(state.connected.load(Ordering::SeqCst));

        router.route_presence(3, false);
        assert!(!state.connected.load(Ordering::SeqCst));
    }

    #[test]
    fn unknown_peer_is_dropped_not_broadcast() {
        let net = LoopbackNet::new();
        let engine = net.engine();
        let router = Router::new(engine.clone());

        let state = StreamState::stub(1);
        router.register(state.clone());

        router.route_message(99, b"stray");
        assert!(state.inbound.lock().unwrap().is_empty());
    }
}
