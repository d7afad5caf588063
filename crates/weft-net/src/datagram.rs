//! Packet transport bound to a UDP endpoint, with optional per-peer
//! authenticated encryption.

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::pin::pin;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use weft_engine::PublicKey;

use crate::clock::{deadline_passed, Clock, Deadlines, TokioClock};
use crate::config::NetConfig;
use crate::crypto::{self, KeyPair, NONCE_LEN};
use crate::error::NetError;
use crate::PacketConn;

/// Largest UDP payload the receive loops accept.
pub(crate) const MAX_DATAGRAM: usize = 65536;

/// Canonical map key for a network address.
///
/// Loopback and unspecified addresses collapse to the same port-keyed
/// entry, so a peer bound to `0.0.0.0` matches one dialled via `127.0.0.1`
/// or `::1` in local setups.
pub(crate) fn normalize_addr(addr: &SocketAddr) -> String {
    let local = match addr.ip() {
        IpAddr::V4(ip) => ip.is_loopback() || ip.is_unspecified(),
        IpAddr::V6(ip) => ip.is_loopback() || ip.is_unspecified(),
    };
    if local {
        format!(":{}", addr.port())
    } else {
        addr.to_string()
    }
}

/// Bounded inbound queue shared with the receive loop.
pub(crate) struct InboundQueue {
    queue: Mutex<VecDeque<(Vec<u8>, SocketAddr)>>,
    notify: Notify,
    capacity: usize,
}

impl InboundQueue {
    pub(crate) fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity,
        })
    }

    /// Drop-newest backpressure: a full queue discards the incoming datagram.
    pub(crate) fn push(&self, payload: Vec<u8>, from: SocketAddr) {
        let mut queue = self.queue.lock().unwrap();
        if queue.len() >= self.capacity {
            tracing::warn!(from = %from, len = payload.len(), "inbound datagram queue full, dropping");
            return;
        }
        queue.push_back((payload, from));
        drop(queue);
        self.notify.notify_waiters();
    }
}

#[derive(Default)]
struct KeyTable {
    local: Option<KeyPair>,
    peers: HashMap<String, PublicKey>,
}

/// An unreliable datagram socket.
///
/// A background receive loop feeds one bounded inbound queue; the loop is
/// torn down only by [`close`](DatagramSocket::close) — transient receive
/// errors are logged and the loop continues. With encryption enabled,
/// outbound datagrams are sealed per peer key and inbound ones opened when
/// the sender's key is known; anything that cannot be opened passes through
/// as raw bytes.
pub struct DatagramSocket {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    inbound: Arc<InboundQueue>,
    keys: Arc<Mutex<KeyTable>>,
    deadlines: Mutex<Deadlines>,
    clock: Arc<dyn Clock>,
    closed: CancellationToken,
}

impl DatagramSocket {
    /// Bind a socket and start its receive loop.
    pub async fn bind(addr: SocketAddr, config: NetConfig) -> Result<Self, NetError> {
        Self::bind_with_clock(addr, config, Arc::new(TokioClock)).await
    }

    /// Bind with an injected [`Clock`].
    pub async fn bind_with_clock(
        addr: SocketAddr,
        config: NetConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, NetError> {
        let socket = Arc::new(UdpSocket::bind(addr).await.map_err(|e| NetError::Io {
            op: "bind",
            source: e,
        })?);
        let local_addr = socket.local_addr().map_err(|e| NetError::Io {
            op: "bind",
            source: e,
        })?;

        let inbound = InboundQueue::new(config.datagram_recv_queue);
        let keys: Arc<Mutex<KeyTable>> = Arc::default();
        let closed = CancellationToken::new();

        tokio::spawn(recv_loop(
            socket.clone(),
            inbound.clone(),
            keys.clone(),
            closed.clone(),
        ));

        Ok(Self {
            socket,
            local_addr,
            inbound,
            keys,
            deadlines: Mutex::new(Deadlines::default()),
            clock,
            closed,
        })
    }

    /// Receive one datagram.
    ///
    /// Blocks until a datagram, the read deadline or close. A payload
    /// larger than `buf` is truncated with a warning, not an error.
    pub async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), NetError> {
        loop {
            if self.closed.is_cancelled() {
                return Err(NetError::ConnectionClosed { op: "recv_from" });
            }
            let mut wake = pin!(self.inbound.notify.notified());
            wake.as_mut().enable();

            {
                let mut queue = self.inbound.queue.lock().unwrap();
                if let Some((payload, from)) = queue.pop_front() {
                    let n = buf.len().min(payload.len());
                    buf[..n].copy_from_slice(&payload[..n]);
                    if payload.len() > buf.len() {
                        tracing::warn!(
                            from = %from,
                            len = payload.len(),
                            capacity = buf.len(),
                            "datagram truncated to fit buffer"
                        );
                    }
                    return Ok((n, from));
                }
            }

            let deadline = self.deadlines.lock().unwrap().read;
            tokio::select! {
                _ = &mut wake => {}
                _ = self.closed.cancelled() => {
                    return Err(NetError::ConnectionClosed { op: "recv_from" });
                }
                _ = deadline_passed(&self.clock, deadline) => {
                    return Err(NetError::Timeout { op: "recv_from" });
                }
            }
        }
    }

    /// Send one datagram to `addr`.
    ///
    /// With encryption enabled the peer key for the normalized address must
    /// be registered ([`NetError::NoEncryptionKey`] otherwise); the wire
    /// carries `nonce ‖ ciphertext` but the reported length is the
    /// plaintext's.
    pub async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> Result<usize, NetError> {
        if self.closed.is_cancelled() {
            return Err(NetError::ConnectionClosed { op: "send_to" });
        }
        let deadline = self.deadlines.lock().unwrap().write;
        if let Some(at) = deadline {
            if self.clock.now() >= at {
                return Err(NetError::Timeout { op: "send_to" });
            }
        }

        // Seal under the key-table lock, send after releasing it.
        let wire = {
            let keys = self.keys.lock().unwrap();
            match &keys.local {
                Some(local) => {
                    let normalized = normalize_addr(&addr);
                    let peer = keys.peers.get(&normalized).ok_or(NetError::NoEncryptionKey {
                        op: "send_to",
                        addr: normalized,
                    })?;
                    let nonce = crypto::generate_nonce();
                    let ciphertext = crypto::seal(buf, &nonce, peer, &local.secret)?;
                    let mut wire = Vec::with_capacity(NONCE_LEN + ciphertext.len());
                    wire.extend_from_slice(&nonce);
                    wire.extend_from_slice(&ciphertext);
                    Some(wire)
                }
                None => None,
            }
        };

        match wire {
            Some(wire) => {
                self.socket
                    .send_to(&wire, addr)
                    .await
                    .map_err(|e| NetError::Io {
                        op: "send_to",
                        source: e,
                    })?;
                Ok(buf.len())
            }
            None => self
                .socket
                .send_to(buf, addr)
                .await
                .map_err(|e| NetError::Io {
                    op: "send_to",
                    source: e,
                }),
        }
    }

    /// Enable per-peer encryption with this socket's keypair.
    pub fn enable_encryption(&self, keypair: KeyPair) {
        self.keys.lock().unwrap().local = Some(keypair);
    }

    /// Register the encryption key for datagrams to and from `addr`.
    pub fn add_peer_key(&self, addr: SocketAddr, key: PublicKey) {
        self.keys
            .lock()
            .unwrap()
            .peers
            .insert(normalize_addr(&addr), key);
    }

    /// Forget the encryption key for `addr`.
    pub fn remove_peer_key(&self, addr: SocketAddr) {
        self.keys.lock().unwrap().peers.remove(&normalize_addr(&addr));
    }

    /// Stop the receive loop and release the socket. Idempotent.
    pub fn close(&self) -> Result<(), NetError> {
        if self.closed.is_cancelled() {
            return Ok(());
        }
        self.closed.cancel();
        Ok(())
    }

    /// The bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Set both deadlines at once.
    pub fn set_deadline(&self, deadline: Option<Instant>) {
        let mut deadlines = self.deadlines.lock().unwrap();
        deadlines.read = deadline;
        deadlines.write = deadline;
    }

    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.deadlines.lock().unwrap().read = deadline;
    }

    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        self.deadlines.lock().unwrap().write = deadline;
    }
}

impl Drop for DatagramSocket {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

async fn recv_loop(
    socket: Arc<UdpSocket>,
    inbound: Arc<InboundQueue>,
    keys: Arc<Mutex<KeyTable>>,
    closed: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (len, from) = tokio::select! {
            _ = closed.cancelled() => return,
            res = socket.recv_from(&mut buf) => match res {
                Ok(pair) => pair,
                Err(e) => {
                    if closed.is_cancelled() {
                        // Deliberate close: exit silently.
                        return;
                    }
                    // Transient: the loop must survive it.
                    tracing::warn!(error = %e, "datagram receive failed, continuing");
                    continue;
                }
            },
        };
        let payload = open_inbound(&keys, &from, &buf[..len]);
        inbound.push(payload, from);
    }
}

/// Decrypt an inbound datagram when possible.
///
/// An unknown sender or a failed open passes the raw bytes through
/// unmodified — a compatibility fallback, not an authentication result.
fn open_inbound(keys: &Mutex<KeyTable>, from: &SocketAddr, wire: &[u8]) -> Vec<u8> {
    let keys = keys.lock().unwrap();
    let Some(local) = &keys.local else {
        return wire.to_vec();
    };
    let Some(peer) = keys.peers.get(&normalize_addr(from)) else {
        tracing::debug!(from = %from, "no key for sender, passing datagram through");
        return wire.to_vec();
    };
    if wire.len() < NONCE_LEN {
        return wire.to_vec();
    }
    let (nonce, ciphertext) = wire.split_at(NONCE_LEN);
    let nonce: [u8; NONCE_LEN] = nonce.try_into().expect("split at NONCE_LEN");
    match crypto::open(ciphertext, &nonce, peer, &local.secret) {
        Ok(plaintext) => plaintext,
        Err(_) => {
            tracing::debug!(from = %from, "datagram failed to open, passing through raw");
            wire.to_vec()
        }
    }
}

#[async_trait]
impl PacketConn for DatagramSocket {
    type Addr = SocketAddr;

    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), NetError> {
        DatagramSocket::recv_from(self, buf).await
    }

    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> Result<usize, NetError> {
        DatagramSocket::send_to(self, buf, addr).await
    }

    fn close(&self) -> Result<(), NetError> {
        DatagramSocket::close(self)
    }

    fn local_addr(&self) -> SocketAddr {
        DatagramSocket::local_addr(self)
    }

    fn set_deadline(&self, deadline: Option<Instant>) {
        DatagramSocket::set_deadline(self, deadline)
    }

    fn set_read_deadline(&self, deadline: Option<Instant>) {
        DatagramSocket::set_read_deadline(self, deadline)
    }

    fn set_write_deadline(&self, deadline: Option<Instant>) {
        DatagramSocket::set_write_deadline(self, deadline)
    }
}
