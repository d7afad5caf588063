//! Demultiplexing one datagram socket into per-source connections.
//!
//! The listener's receive loop routes datagrams by normalized source
//! address. The first datagram from a new address admits a
//! [`DatagramConn`]; later ones accumulate in that connection's bounded
//! inbound queue. Admission is one-shot: if the accept queue is full the
//! new connection is closed immediately and the datagram lost. No error
//! ever surfaces to the sender — datagram semantics.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::pin::pin;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::clock::{deadline_passed, Clock, Deadlines, TokioClock};
use crate::config::NetConfig;
use crate::datagram::{normalize_addr, MAX_DATAGRAM};
use crate::error::NetError;
use crate::{Conn, Listener};

struct ConnState {
    remote: SocketAddr,
    inbound: Mutex<VecDeque<Vec<u8>>>,
    notify: Notify,
    recv_capacity: usize,
    /// Bounded; drained by this connection's own send loop.
    outbound: mpsc::Sender<Vec<u8>>,
    closed: CancellationToken,
    deadlines: Mutex<Deadlines>,
}

impl ConnState {
    /// Queue an inbound datagram, dropping on overflow.
    fn push(&self, payload: Vec<u8>) {
        let mut inbound = self.inbound.lock().unwrap();
        if inbound.len() >= self.recv_capacity {
            tracing::debug!(from = %self.remote, "connection inbound queue full, dropping datagram");
            return;
        }
        inbound.push_back(payload);
        drop(inbound);
        self.notify.notify_waiters();
    }
}

struct MuxShared {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    clock: Arc<dyn Clock>,
    recv_capacity: usize,
    send_capacity: usize,
    accept_backlog: usize,
    conns: Mutex<HashMap<String, Arc<ConnState>>>,
    ready: Mutex<VecDeque<DatagramConn>>,
    notify: Notify,
    closed: CancellationToken,
}

/// Accepts per-source datagram connections over one shared socket.
///
/// Shares the receive-loop contract of
/// [`DatagramSocket`](crate::DatagramSocket): transient receive errors are
/// logged and the loop continues; only a deliberate close ends it.
/// Encryption is not applied at this layer.
pub struct DatagramListener {
    shared: Arc<MuxShared>,
}

impl DatagramListener {
    /// Bind a socket and start the demultiplexing receive loop.
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

        let shared = Arc::new(MuxShared {
            socket,
            local_addr,
            clock,
            recv_capacity: config.datagram_recv_queue,
            send_capacity: config.datagram_send_queue,
            accept_backlog: config.accept_backlog,
            conns: Mutex::new(HashMap::new()),
            ready: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: CancellationToken::new(),
        });
        tokio::spawn(mux_loop(shared.clone()));

        Ok(Self { shared })
    }

    /// Wait for a connection from a new source address.
    pub async fn accept(&self) -> Result<DatagramConn, NetError> {
        loop {
            if self.shared.closed.is_cancelled() {
                return Err(NetError::ListenerClosed { op: "accept" });
            }
            let mut wake = pin!(self.shared.notify.notified());
            wake.as_mut().enable();

            if let Some(conn) = self.shared.ready.lock().unwrap().pop_front() {
                return Ok(conn);
            }

            tokio::select! {
                _ = &mut wake => {}
                _ = self.shared.closed.cancelled() => {
                    return Err(NetError::ListenerClosed { op: "accept" });
                }
            }
        }
    }

    /// Stop the loop and close every admitted connection. Idempotent.
    pub fn close(&self) -> Result<(), NetError> {
        if self.shared.closed.is_cancelled() {
            return Ok(());
        }
        // Child tokens cancel with the parent, waking every reader.
        self.shared.closed.cancel();

        let queued: Vec<_> = self.shared.ready.lock().unwrap().drain(..).collect();
        for conn in queued {
            let _ = conn.close();
        }
        self.shared.conns.lock().unwrap().clear();
        Ok(())
    }

    /// The bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }
}

impl Drop for DatagramListener {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// One source address's slice of a shared datagram socket.
///
/// Read and write mirror the stream connection's deadline and close
/// semantics but stay message-oriented: one datagram per call, no chunking,
/// and writes never block on backpressure — a full outbound queue fails
/// with [`NetError::BufferFull`] immediately.
pub struct DatagramConn {
    state: Arc<ConnState>,
    shared: Weak<MuxShared>,
    clock: Arc<dyn Clock>,
    local_addr: SocketAddr,
}

impl std::fmt::Debug for DatagramConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatagramConn")
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

impl DatagramConn {
    /// Read the next datagram, truncating (with a warning) if `buf` is short.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, NetError> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if self.state.closed.is_cancelled() {
                return Err(NetError::ConnectionClosed { op: "read" });
            }
            let mut wake = pin!(self.state.notify.notified());
            wake.as_mut().enable();

            {
                let mut inbound = self.state.inbound.lock().unwrap();
                if let Some(payload) = inbound.pop_front() {
                    let n = buf.len().min(payload.len());
                    buf[..n].copy_from_slice(&payload[..n]);
                    if payload.len() > buf.len() {
                        tracing::warn!(
                            from = %self.state.remote,
                            len = payload.len(),
                            capacity = buf.len(),
                            "datagram truncated to fit buffer"
                        );
                    }
                    return Ok(n);
                }
            }

            let deadline = self.state.deadlines.lock().unwrap().read;
            tokio::select! {
                _ = &mut wake => {}
                _ = self.state.closed.cancelled() => {
                    return Err(NetError::ConnectionClosed { op: "read" });
                }
                _ = deadline_passed(&self.clock, deadline) => {
                    return Err(NetError::Timeout { op: "read" });
                }
            }
        }
    }

    /// Queue one datagram for the drain loop. Never blocks on backpressure.
    pub async fn write(&self, buf: &[u8]) -> Result<usize, NetError> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.state.closed.is_cancelled() {
            return Err(NetError::ConnectionClosed { op: "write" });
        }
        let deadline = self.state.deadlines.lock().unwrap().write;
        if let Some(at) = deadline {
            if self.clock.now() >= at {
                return Err(NetError::Timeout { op: "write" });
            }
        }
        match self.state.outbound.try_send(buf.to_vec()) {
            Ok(()) => Ok(buf.len()),
            Err(TrySendError::Full(_)) => Err(NetError::BufferFull { op: "write" }),
            Err(TrySendError::Closed(_)) => Err(NetError::ConnectionClosed { op: "write" }),
        }
    }

    /// Close this connection and remove it from the listener's table.
    /// Idempotent; the shared socket stays up.
    pub fn close(&self) -> Result<(), NetError> {
        if self.state.closed.is_cancelled() {
            return Ok(());
        }
        self.state.closed.cancel();
        if let Some(shared) = self.shared.upgrade() {
            shared
                .conns
                .lock()
                .unwrap()
                .remove(&normalize_addr(&self.state.remote));
        }
        Ok(())
    }

    /// The shared socket's bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The source address this connection belongs to.
    pub fn remote_addr(&self) -> SocketAddr {
        self.state.remote
    }

    /// Set both deadlines at once.
    pub fn set_deadline(&self, deadline: Option<Instant>) {
        let mut deadlines = self.state.deadlines.lock().unwrap();
        deadlines.read = deadline;
        deadlines.write = deadline;
    }

    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.state.deadlines.lock().unwrap().read = deadline;
    }

    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        self.state.deadlines.lock().unwrap().write = deadline;
    }
}

impl Drop for DatagramConn {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

async fn mux_loop(shared: Arc<MuxShared>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (len, from) = tokio::select! {
            _ = shared.closed.cancelled() => return,
            res = shared.socket.recv_from(&mut buf) => match res {
                Ok(pair) => pair,
                Err(e) => {
                    if shared.closed.is_cancelled() {
                        return;
                    }
                    tracing::warn!(error = %e, "datagram receive failed, continuing");
                    continue;
                }
            },
        };
        let payload = buf[..len].to_vec();
        let key = normalize_addr(&from);

        let existing = shared.conns.lock().unwrap().get(&key).cloned();
        if let Some(state) = existing {
            state.push(payload);
            continue;
        }

        // First datagram from a new source: admit a connection.
        let (outbound_tx, outbound_rx) = mpsc::channel(shared.send_capacity);
        let state = Arc::new(ConnState {
            remote: from,
            inbound: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            recv_capacity: shared.recv_capacity,
            outbound: outbound_tx,
            closed: shared.closed.child_token(),
            deadlines: Mutex::new(Deadlines::default()),
        });
        tokio::spawn(drain_outbound(
            shared.socket.clone(),
            from,
            outbound_rx,
            state.closed.clone(),
        ));
        state.push(payload);
        shared.conns.lock().unwrap().insert(key, state.clone());

        let conn = DatagramConn {
            state,
            shared: Arc::downgrade(&shared),
            clock: shared.clock.clone(),
            local_addr: shared.local_addr,
        };

        let mut ready = shared.ready.lock().unwrap();
        if ready.len() >= shared.accept_backlog {
            // One-shot admission: never retried for this source.
            drop(ready);
            tracing::warn!(from = %from, "accept queue full, closing new datagram connection");
            let _ = conn.close();
            continue;
        }
        ready.push_back(conn);
        drop(ready);
        shared.notify.notify_waiters();
    }
}

/// Per-connection send loop: forwards queued datagrams to the socket.
async fn drain_outbound(
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    mut outbound: mpsc::Receiver<Vec<u8>>,
    closed: CancellationToken,
) {
    loop {
        let payload = tokio::select! {
            _ = closed.cancelled() => return,
            payload = outbound.recv() => match payload {
                Some(payload) => payload,
                None => return,
            },
        };
        if let Err(e) = socket.send_to(&payload, remote).await {
            if closed.is_cancelled() {
                return;
            }
            tracing::warn!(error = %e, to = %remote, "datagram send failed, continuing");
        }
    }
}

#[async_trait]
impl Listener for DatagramListener {
    type Conn = DatagramConn;
    type Addr = SocketAddr;

    async fn accept(&self) -> Result<DatagramConn, NetError> {
        DatagramListener::accept(self).await
    }

    fn close(&self) -> Result<(), NetError> {
        DatagramListener::close(self)
    }

    fn local_addr(&self) -> SocketAddr {
        DatagramListener::local_addr(self)
    }
}

#[async_trait]
impl Conn for DatagramConn {
    type Addr = SocketAddr;

    async fn read(&self, buf: &mut [u8]) -> Result<usize, NetError> {
        DatagramConn::read(self, buf).await
    }

    async fn write(&self, buf: &[u8]) -> Result<usize, NetError> {
        DatagramConn::write(self, buf).await
    }

    fn close(&self) -> Result<(), NetError> {
        DatagramConn::close(self)
    }

    fn local_addr(&self) -> SocketAddr {
        DatagramConn::local_addr(self)
    }

    fn remote_addr(&self) -> SocketAddr {
        DatagramConn::remote_addr(self)
    }

    fn set_deadline(&self, deadline: Option<Instant>) {
        DatagramConn::set_deadline(self, deadline)
    }

    fn set_read_deadline(&self, deadline: Option<Instant>) {
        DatagramConn::set_read_deadline(self, deadline)
    }

    fn set_write_deadline(&self, deadline: Option<Instant>) {
        DatagramConn::set_write_deadline(self, deadline)
    }
}
