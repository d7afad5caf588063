use std::time::Duration;

use weft_engine::MAX_MESSAGE_LEN;

/// Headroom kept below the engine's message ceiling when chunking writes.
///
/// The default chunk size of 1300 bytes sits conservatively below the
/// engine's ~1372-byte payload ceiling.
pub const DEFAULT_CHUNK_SIZE: usize = 1300;

/// Configuration for a [`Node`](crate::Node) and the objects it creates.
///
/// All fields have sensible defaults. Use the builder pattern:
///
/// ```rust
/// use weft_net::NetConfig;
/// use std::time::Duration;
///
/// let config = NetConfig::new()
///     .dial_timeout(Duration::from_secs(10))
///     .accept_backlog(32);
/// ```
#[derive(Debug, Clone)]
pub struct NetConfig {
    /// Largest payload handed to the engine per message.
    pub(crate) chunk_size: usize,
    /// How long a dial waits for the peer to come online.
    pub(crate) dial_timeout: Duration,
    /// Greeting sent with outbound peer requests.
    pub(crate) greeting: Vec<u8>,
    /// Capacity of a listener's ready-connection queue.
    pub(crate) accept_backlog: usize,
    /// How long an auto-accepted peer may take to come online.
    pub(crate) accept_window: Duration,
    /// Presence poll interval while waiting out the accept window.
    pub(crate) presence_poll: Duration,
    /// Whether the stream listener admits every inbound request itself.
    pub(crate) auto_accept: bool,
    /// Capacity of a datagram socket's or connection's inbound queue.
    pub(crate) datagram_recv_queue: usize,
    /// Capacity of a datagram connection's outbound queue.
    pub(crate) datagram_send_queue: usize,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl NetConfig {
    /// Create a new config with defaults.
    pub fn new() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            dial_timeout: Duration::from_secs(30),
            greeting: b"weft".to_vec(),
            accept_backlog: 16,
            accept_window: Duration::from_secs(30),
            presence_poll: Duration::from_millis(100),
            auto_accept: true,
            datagram_recv_queue: 64,
            datagram_send_queue: 16,
        }
    }

    /// Set the write chunk size (default: 1300 bytes).
    ///
    /// Values above the engine's message ceiling are clamped to it.
    pub fn chunk_size(mut self, bytes: usize) -> Self {
        self.chunk_size = bytes.clamp(1, MAX_MESSAGE_LEN);
        self
    }

    /// Set how long a dial waits for the remote peer (default: 30 s).
    pub fn dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    /// Set the greeting sent with outbound peer requests (default: `weft`).
    pub fn greeting(mut self, greeting: &[u8]) -> Self {
        self.greeting = greeting.to_vec();
        self
    }

    /// Set the listener's ready-connection queue capacity (default: 16).
    pub fn accept_backlog(mut self, capacity: usize) -> Self {
        self.accept_backlog = capacity.max(1);
        self
    }

    /// Set how long an accepted peer may take to come online (default: 30 s).
    pub fn accept_window(mut self, window: Duration) -> Self {
        self.accept_window = window;
        self
    }

    /// Set the presence poll interval inside the accept window (default: 100 ms).
    pub fn presence_poll(mut self, interval: Duration) -> Self {
        self.presence_poll = interval;
        self
    }

    /// Auto-accept inbound requests (default: true).
    ///
    /// When disabled, requests surface through
    /// [`StreamListener::next_request`](crate::StreamListener::next_request)
    /// and are admitted with
    /// [`StreamListener::approve`](crate::StreamListener::approve).
    pub fn auto_accept(mut self, enabled: bool) -> Self {
        self.auto_accept = enabled;
        self
    }

    /// Set the datagram inbound queue capacity (default: 64).
    pub fn datagram_recv_queue(mut self, capacity: usize) -> Self {
        self.datagram_recv_queue = capacity.max(1);
        self
    }

    /// Set the datagram outbound queue capacity (default: 16).
    pub fn datagram_send_queue(mut self, capacity: usize) -> Self {
        self.datagram_send_queue = capacity.max(1);
        self
    }
}
