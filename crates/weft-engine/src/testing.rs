//! Deterministic in-memory engines for tests.
//!
//! [`LoopbackNet`] is a hub of [`LoopbackEngine`]s wired directly to each
//! other: peer requests, presence edges and messages are delivered
//! synchronously and in order. A peer pair flips online exactly when both
//! sides hold each other, which reproduces the engine's offline→online edge
//! without any real networking.
//!
//! Callbacks are always invoked with the hub lock released, so a handler
//! may call back into its engine (an auto-accepting listener does exactly
//! that).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::{
    AntiSpam, Endpoint, Engine, EngineError, MessageHandler, PeerId, PeerState, PresenceHandler,
    PublicKey, RequestHandler, MAX_MESSAGE_LEN,
};

/// A deferred handler invocation, run after the hub lock is dropped.
enum Callback {
    Message(MessageHandler, PeerId, Vec<u8>),
    Presence(PresenceHandler, PeerId, bool),
    Request(RequestHandler, PublicKey, Vec<u8>),
}

impl Callback {
    fn run(self) {
        match self {
            Callback::Message(f, peer, payload) => f(peer, &payload),
            Callback::Presence(f, peer, online) => f(peer, online),
            Callback::Request(f, key, greeting) => f(key, &greeting),
        }
    }
}

#[derive(Default)]
struct Handlers {
    message: Option<MessageHandler>,
    presence: Option<PresenceHandler>,
    request: Option<RequestHandler>,
}

struct PeerEntry {
    public_key: PublicKey,
    online: bool,
}

struct NodeState {
    public_key: PublicKey,
    anti_spam: AntiSpam,
    handlers: Handlers,
    peers: HashMap<PeerId, PeerEntry>,
    next_peer: PeerId,
}

impl NodeState {
    fn peer_by_key(&self, key: &PublicKey) -> Option<PeerId> {
        self.peers
            .iter()
            .find(|(_, entry)| entry.public_key == *key)
            .map(|(id, _)| *id)
    }
}

#[derive(Default)]
struct Hub {
    nodes: Vec<NodeState>,
}

impl Hub {
    fn node_by_key(&self, key: &PublicKey) -> Option<usize> {
        self.nodes.iter().position(|n| n.public_key == *key)
    }

    /// If `a` and `b` both hold each other and the pair is offline, flip it
    /// online and queue a presence edge for each side.
    fn check_mutual(&mut self, a: usize, b: usize, out: &mut Vec<Callback>) {
        let b_key = self.nodes[b].public_key;
        let a_key = self.nodes[a].public_key;
        let Some(a_peer) = self.nodes[a].peer_by_key(&b_key) else {
            return;
        };
        let Some(b_peer) = self.nodes[b].peer_by_key(&a_key) else {
            return;
        };
        if self.nodes[a].peers[&a_peer].online {
            return;
        }

        self.nodes[a].peers.get_mut(&a_peer).unwrap().online = true;
        self.nodes[b].peers.get_mut(&b_peer).unwrap().online = true;
        if let Some(f) = &self.nodes[a].handlers.presence {
            out.push(Callback::Presence(f.clone(), a_peer, true));
        }
        if let Some(f) = &self.nodes[b].handlers.presence {
            out.push(Callback::Presence(f.clone(), b_peer, true));
        }
    }
}

/// An in-memory network of loopback engines.
#[derive(Default)]
pub struct LoopbackNet {
    hub: Arc<Mutex<Hub>>,
}

impl LoopbackNet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a new engine on this network with a deterministic identity.
    pub fn engine(&self) -> Arc<LoopbackEngine> {
        let mut hub = self.hub.lock().unwrap();
        let index = hub.nodes.len();
        let public_key = PublicKey([(index + 1) as u8; 32]);
        let anti_spam = AntiSpam([index as u8, 0xEE, 0xEE, 0xEE]);
        hub.nodes.push(NodeState {
            public_key,
            anti_spam,
            handlers: Handlers::default(),
            peers: HashMap::new(),
            next_peer: 0,
        });
        Arc::new(LoopbackEngine {
            index,
            hub: self.hub.clone(),
            next_message_id: AtomicU32::new(0),
            sends: AtomicUsize::new(0),
            message_installs: AtomicUsize::new(0),
            presence_installs: AtomicUsize::new(0),
            request_installs: AtomicUsize::new(0),
            send_budget: Mutex::new(None),
        })
    }
}

/// One engine instance on a [`LoopbackNet`].
pub struct LoopbackEngine {
    index: usize,
    hub: Arc<Mutex<Hub>>,
    next_message_id: AtomicU32,
    sends: AtomicUsize,
    message_installs: AtomicUsize,
    presence_installs: AtomicUsize,
    request_installs: AtomicUsize,
    /// `Some(n)`: the next `n` sends succeed, everything after fails.
    send_budget: Mutex<Option<usize>>,
}

impl LoopbackEngine {
    /// Make `send_message` fail after `n` further successful sends.
    pub fn fail_sends_after(&self, n: usize) {
        *self.send_budget.lock().unwrap() = Some(n);
    }

    /// Total successful `send_message` calls so far.
    pub fn sends(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }

    /// How many times a message handler has been installed.
    pub fn message_handler_installs(&self) -> usize {
        self.message_installs.load(Ordering::SeqCst)
    }

    /// How many times a presence handler has been installed.
    pub fn presence_handler_installs(&self) -> usize {
        self.presence_installs.load(Ordering::SeqCst)
    }

    /// How many times a request handler has been installed.
    pub fn request_handler_installs(&self) -> usize {
        self.request_installs.load(Ordering::SeqCst)
    }

    /// Whether a message handler is currently installed.
    pub fn has_message_handler(&self) -> bool {
        self.hub.lock().unwrap().nodes[self.index]
            .handlers
            .message
            .is_some()
    }

    fn register_peer(
        &self,
        public_key: &PublicKey,
        request: Option<&[u8]>,
    ) -> Result<PeerId, EngineError> {
        let mut callbacks = Vec::new();
        let peer = {
            let mut hub = self.hub.lock().unwrap();
            if hub.nodes[self.index].public_key == *public_key {
                return Err(EngineError::Internal("cannot add own key".into()));
            }
            if hub.nodes[self.index].peer_by_key(public_key).is_some() {
                return Err(EngineError::AlreadyPeer);
            }

            let node = &mut hub.nodes[self.index];
            let peer = node.next_peer;
            node.next_peer += 1;
            node.peers.insert(
                peer,
                PeerEntry {
                    public_key: *public_key,
                    online: false,
                },
            );

            if let Some(target) = hub.node_by_key(public_key) {
                if let (Some(greeting), Some(f)) =
                    (request, &hub.nodes[target].handlers.request)
                {
                    let local_key = hub.nodes[self.index].public_key;
                    callbacks.push(Callback::Request(f.clone(), local_key, greeting.to_vec()));
                }
                hub.check_mutual(self.index, target, &mut callbacks);
            }
            peer
        };
        for cb in callbacks {
            cb.run();
        }
        Ok(peer)
    }
}

impl Engine for LoopbackEngine {
    fn local_endpoint(&self) -> Endpoint {
        let hub = self.hub.lock().unwrap();
        let node = &hub.nodes[self.index];
        Endpoint::from_key(node.public_key, node.anti_spam)
    }

    fn add_peer(&self, endpoint: &Endpoint, greeting: &[u8]) -> Result<PeerId, EngineError> {
        let key = *endpoint
            .public_key()
            .ok_or_else(|| EngineError::Internal("unset endpoint".into()))?;
        self.register_peer(&key, Some(greeting))
    }

    fn add_peer_by_key(&self, public_key: &PublicKey) -> Result<PeerId, EngineError> {
        self.register_peer(public_key, None)
    }

    fn remove_peer(&self, peer: PeerId) -> Result<(), EngineError> {
        let mut callbacks = Vec::new();
        {
            let mut hub = self.hub.lock().unwrap();
            let entry = hub.nodes[self.index]
                .peers
                .remove(&peer)
                .ok_or(EngineError::PeerNotFound(peer))?;
            let local_key = hub.nodes[self.index].public_key;

            // The remote side sees us drop offline.
            if let Some(target) = hub.node_by_key(&entry.public_key) {
                if let Some(remote_peer) = hub.nodes[target].peer_by_key(&local_key) {
                    let remote = hub.nodes[target].peers.get_mut(&remote_peer).unwrap();
                    if remote.online {
                        remote.online = false;
                        if let Some(f) = &hub.nodes[target].handlers.presence {
                            callbacks.push(Callback::Presence(f.clone(), remote_peer, false));
                        }
                    }
                }
            }
        }
        for cb in callbacks {
            cb.run();
        }
        Ok(())
    }

    fn peers(&self) -> HashMap<PeerId, PeerState> {
        let hub = self.hub.lock().unwrap();
        hub.nodes[self.index]
            .peers
            .iter()
            .map(|(id, entry)| {
                (
                    *id,
                    PeerState {
                        public_key: entry.public_key,
                        online: entry.online,
                    },
                )
            })
            .collect()
    }

    fn send_message(&self, peer: PeerId, payload: &[u8]) -> Result<u32, EngineError> {
        if payload.is_empty() {
            return Err(EngineError::MessageEmpty);
        }
        if payload.len() > MAX_MESSAGE_LEN {
            return Err(EngineError::MessageTooLong {
                len: payload.len(),
                max: MAX_MESSAGE_LEN,
            });
        }
        {
            let mut budget = self.send_budget.lock().unwrap();
            if let Some(left) = budget.as_mut() {
                if *left == 0 {
                    return Err(EngineError::Internal("injected send failure".into()));
                }
                *left -= 1;
            }
        }

        let callback = {
            let hub = self.hub.lock().unwrap();
            let entry = hub.nodes[self.index]
                .peers
                .get(&peer)
                .ok_or(EngineError::PeerNotFound(peer))?;
            if !entry.online {
                return Err(EngineError::PeerOffline(peer));
            }
            let local_key = hub.nodes[self.index].public_key;
            let target = hub
                .node_by_key(&entry.public_key)
                .expect("online peer has a node");
            let remote_peer = hub.nodes[target]
                .peer_by_key(&local_key)
                .expect("online peer holds us");
            hub.nodes[target]
                .handlers
                .message
                .clone()
                .map(|f| Callback::Message(f, remote_peer, payload.to_vec()))
        };
        match callback {
            Some(cb) => cb.run(),
            None => tracing::debug!(peer, "loopback: no message handler installed, dropping"),
        }

        self.sends.fetch_add(1, Ordering::SeqCst);
        Ok(self.next_message_id.fetch_add(1, Ordering::SeqCst))
    }

    fn set_message_handler(&self, handler: Option<MessageHandler>) {
        if handler.is_some() {
            self.message_installs.fetch_add(1, Ordering::SeqCst);
        }
        self.hub.lock().unwrap().nodes[self.index].handlers.message = handler;
    }

    fn set_presence_handler(&self, handler: Option<PresenceHandler>) {
        if handler.is_some() {
            self.presence_installs.fetch_add(1, Ordering::SeqCst);
        }
        self.hub.lock().unwrap().nodes[self.index].handlers.presence = handler;
    }

    fn set_request_handler(&self, handler: Option<RequestHandler>) {
        if handler.is_some() {
            self.request_installs.fetch_add(1, Ordering::SeqCst);
        }
        self.hub.lock().unwrap().nodes[self.index].handlers.request = handler;
    }
}
