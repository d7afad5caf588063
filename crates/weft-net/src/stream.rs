//! Ordered byte-stream connection over engine-level messaging.

use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use weft_engine::{Endpoint, Engine, EngineError, PeerId};

use crate::clock::{deadline_passed, Clock, Deadlines};
use crate::config::NetConfig;
use crate::error::NetError;
use crate::router::Router;
use crate::Conn;

/// State shared between a [`StreamConn`] and its router.
pub(crate) struct StreamState {
    pub(crate) peer: PeerId,
    /// Ordered inbound bytes, appended by the router.
    pub(crate) inbound: Mutex<BytesMut>,
    /// Wakes readers when `inbound` grows.
    pub(crate) data_ready: Notify,
    /// Tracks the peer's presence; set by the router.
    pub(crate) connected: AtomicBool,
    /// Wakes writers parked on the offline→online edge.
    pub(crate) came_online: Notify,
    /// Cancelled exactly once, on close.
    closed: CancellationToken,
    deadlines: Mutex<Deadlines>,
}

impl StreamState {
    fn new(peer: PeerId, connected: bool) -> Arc<Self> {
        Arc::new(Self {
            peer,
            inbound: Mutex::new(BytesMut::new()),
            data_ready: Notify::new(),
            connected: AtomicBool::new(connected),
            came_online: Notify::new(),
            closed: CancellationToken::new(),
            deadlines: Mutex::new(Deadlines::default()),
        })
    }

    #[cfg(test)]
    pub(crate) fn stub(peer: PeerId) -> Arc<Self> {
        Self::new(peer, false)
    }
}

/// A reliable ordered byte stream to one peer.
///
/// Reads drain an inbound queue fed by the router; writes are split into
/// chunks below the engine's message ceiling and sent in order. All methods
/// take `&self`; a connection may be read and written concurrently.
pub struct StreamConn<E: Engine> {
    engine: Arc<E>,
    router: Arc<Router<E>>,
    clock: Arc<dyn Clock>,
    state: Arc<StreamState>,
    chunk_size: usize,
    local: Endpoint,
    remote: Endpoint,
    /// Serializes writers so chunk sequences never interleave.
    write_mutex: tokio::sync::Mutex<()>,
}

impl<E: Engine> std::fmt::Debug for StreamConn<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamConn")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

impl<E: Engine> StreamConn<E> {
    /// Build a connection and register it with the router.
    pub(crate) fn attach(
        engine: Arc<E>,
        router: Arc<Router<E>>,
        clock: Arc<dyn Clock>,
        config: &NetConfig,
        peer: PeerId,
        remote: Endpoint,
        connected: bool,
    ) -> Self {
        let state = StreamState::new(peer, connected);
        router.register(state.clone());
        Self {
            local: engine.local_endpoint(),
            engine,
            router,
            clock,
            state,
            chunk_size: config.chunk_size,
            remote,
            write_mutex: tokio::sync::Mutex::new(()),
        }
    }

    /// Read up to `buf.len()` bytes.
    ///
    /// An empty `buf` returns `Ok(0)` without blocking. Otherwise blocks
    /// until data arrives, the read deadline expires ([`NetError::Timeout`])
    /// or the connection closes.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, NetError> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if self.state.closed.is_cancelled() {
                return Err(NetError::ConnectionClosed { op: "read" });
            }

            // Register interest before the queue check: a payload routed in
            // between would otherwise be a missed wakeup.
            let mut data_ready = pin!(self.state.data_ready.notified());
            data_ready.as_mut().enable();

            {
                let mut inbound = self.state.inbound.lock().unwrap();
                if !inbound.is_empty() {
                    let n = buf.len().min(inbound.len());
                    buf[..n].copy_from_slice(&inbound.split_to(n));
                    return Ok(n);
                }
            }

            let deadline = self.state.deadlines.lock().unwrap().read;
            tokio::select! {
                _ = &mut data_ready => {}
                _ = self.state.closed.cancelled() => {
                    return Err(NetError::ConnectionClosed { op: "read" });
                }
                _ = deadline_passed(&self.clock, deadline) => {
                    return Err(NetError::Timeout { op: "read" });
                }
            }
        }
    }

    /// Write all of `buf`, chunked below the engine's message ceiling.
    ///
    /// An empty `buf` is a no-op. If the peer is not yet online, blocks
    /// until the presence edge fires or the write deadline expires. A
    /// failure after some chunks went out reports the exact byte count via
    /// [`NetError::PartialWrite`].
    pub async fn write(&self, buf: &[u8]) -> Result<usize, NetError> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.state.closed.is_cancelled() {
            return Err(NetError::ConnectionClosed { op: "write" });
        }
        let _writer = self.write_mutex.lock().await;

        // Park until the offline→online edge. A wakeup is only a hint; the
        // flag is rechecked every pass.
        loop {
            if self.state.closed.is_cancelled() {
                return Err(NetError::ConnectionClosed { op: "write" });
            }
            let mut came_online = pin!(self.state.came_online.notified());
            came_online.as_mut().enable();

            if self.state.connected.load(Ordering::SeqCst) {
                break;
            }

            let deadline = self.state.deadlines.lock().unwrap().write;
            tokio::select! {
                _ = &mut came_online => {}
                _ = self.state.closed.cancelled() => {
                    return Err(NetError::ConnectionClosed { op: "write" });
                }
                _ = deadline_passed(&self.clock, deadline) => {
                    return Err(NetError::Timeout { op: "write" });
                }
            }
        }

        // The deadline is rechecked between chunks so a long write aborts
        // mid-stream with correct partial accounting.
        let mut sent = 0usize;
        for chunk in buf.chunks(self.chunk_size) {
            if self.state.closed.is_cancelled() {
                return Err(partial(sent, NetError::ConnectionClosed { op: "write" }));
            }
            let deadline = self.state.deadlines.lock().unwrap().write;
            if let Some(at) = deadline {
                if self.clock.now() >= at {
                    return Err(partial(sent, NetError::Timeout { op: "write" }));
                }
            }
            if let Err(e) = self.engine.send_message(self.state.peer, chunk) {
                let cause = match e {
                    EngineError::PeerOffline(_) => NetError::PeerOffline { op: "write" },
                    e => NetError::Engine { op: "write", source: e },
                };
                return Err(partial(sent, cause));
            }
            sent += chunk.len();
        }
        Ok(sent)
    }

    /// Tear the connection down: cancel its token, unregister it from the
    /// router and wake any blocked reader or writer. Idempotent.
    pub fn close(&self) -> Result<(), NetError> {
        if self.state.closed.is_cancelled() {
            return Ok(());
        }
        self.state.closed.cancel();
        self.router.unregister(self.state.peer);
        Ok(())
    }

    /// Whether the peer is currently online.
    pub fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }

    /// This side's identity.
    pub fn local_addr(&self) -> Endpoint {
        self.local
    }

    /// The peer's identity.
    pub fn remote_addr(&self) -> Endpoint {
        self.remote
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

    /// Wait for the peer to come online, bounded by `deadline` and the
    /// dialling node's shutdown token.
    pub(crate) async fn await_online(
        &self,
        deadline: Option<Instant>,
        shutdown: &CancellationToken,
    ) -> Result<(), NetError> {
        loop {
            if self.state.closed.is_cancelled() {
                return Err(NetError::ConnectionClosed { op: "connect" });
            }
            let mut came_online = pin!(self.state.came_online.notified());
            came_online.as_mut().enable();

            if self.state.connected.load(Ordering::SeqCst) {
                return Ok(());
            }

            tokio::select! {
                _ = &mut came_online => {}
                _ = self.state.closed.cancelled() => {
                    return Err(NetError::ConnectionClosed { op: "connect" });
                }
                _ = shutdown.cancelled() => {
                    return Err(NetError::ConnectionClosed { op: "connect" });
                }
                _ = deadline_passed(&self.clock, deadline) => {
                    return Err(NetError::Timeout { op: "connect" });
                }
            }
        }
    }
}

/// Wrap a mid-write failure with the byte count already transmitted.
fn partial(sent: usize, cause: NetError) -> NetError {
    if sent == 0 {
        cause
    } else {
        NetError::PartialWrite {
            op: "write",
            sent,
            source: Box::new(cause),
        }
    }
}

impl<E: Engine> Drop for StreamConn<E> {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[async_trait]
impl<E: Engine> Conn for StreamConn<E> {
    type Addr = Endpoint;

    async fn read(&self, buf: &mut [u8]) -> Result<usize, NetError> {
        StreamConn::read(self, buf).await
    }

    async fn write(&self, buf: &[u8]) -> Result<usize, NetError> {
        StreamConn::write(self, buf).await
    }

    fn close(&self) -> Result<(), NetError> {
        StreamConn::close(self)
    }

    fn local_addr(&self) -> Endpoint {
        StreamConn::local_addr(self)
    }

    fn remote_addr(&self) -> Endpoint {
        StreamConn::remote_addr(self)
    }

    fn set_deadline(&self, deadline: Option<Instant>) {
        StreamConn::set_deadline(self, deadline)
    }

    fn set_read_deadline(&self, deadline: Option<Instant>) {
        StreamConn::set_read_deadline(self, deadline)
    }

    fn set_write_deadline(&self, deadline: Option<Instant>) {
        StreamConn::set_write_deadline(self, deadline)
    }
}
