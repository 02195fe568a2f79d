//! Type definitions shared by the session, the flow adapters and the
//! lifecycle controller.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::{Duration, Instant};

use uuid::Uuid;

/// Identifier of one tunnelled flow.
///
/// Identifiers are handed out by the flow registry, start at 1 and are never
/// reused within a session. Zero is never a valid identifier on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowId(pub u32);

impl FlowId {
    /// Raw wire value.
    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a tunnel session, used to correlate log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Generate a fresh random session identifier.
    pub fn new() -> Self {
        SessionId(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of an external flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowKind {
    /// Ordered byte stream (TCP)
    Stream,
    /// Datagram session (UDP)
    Datagram,
}

impl fmt::Display for FlowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowKind::Stream => f.write_str("stream"),
            FlowKind::Datagram => f.write_str("datagram"),
        }
    }
}

/// A remote endpoint as carried on the wire: a host name or address plus a port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Endpoint {
            host: host.into(),
            port,
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Endpoint {
            host: addr.ip().to_string(),
            port: addr.port(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Error returned when an endpoint string cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid endpoint: {0:?}")]
pub struct EndpointParseError(pub String);

impl FromStr for Endpoint {
    type Err = EndpointParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || EndpointParseError(s.to_string());
        let (host, port) = s.rsplit_once(':').ok_or_else(err)?;
        let host = match host.strip_prefix('[') {
            Some(inner) => inner.strip_suffix(']').ok_or_else(err)?,
            None => host,
        };
        if host.is_empty() {
            return Err(err());
        }
        let port = port.parse::<u16>().map_err(|_| err())?;
        Ok(Endpoint::new(host, port))
    }
}

/// State of a tunnel session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// The underlying transport is being established
    Connecting,
    /// Configuration has been requested and not yet received
    Configuring,
    /// Flows may be admitted
    Established,
    /// Flows are being force-closed and the transport torn down
    Closing,
    /// Terminal state
    Closed,
}

impl SessionState {
    /// Whether the session has reached closing or closed.
    pub fn is_terminating(self) -> bool {
        matches!(self, SessionState::Closing | SessionState::Closed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Connecting => "connecting",
            SessionState::Configuring => "configuring",
            SessionState::Established => "established",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Statistics for a tunnel session.
#[derive(Debug, Clone)]
pub struct SessionStats {
    /// When the session was created
    pub created_at: Instant,
    /// When a message last crossed the transport
    pub last_active: Instant,
    /// Total bytes written to the transport
    pub bytes_sent: u64,
    /// Total bytes read from the transport
    pub bytes_received: u64,
    /// Framed messages written
    pub messages_sent: u64,
    /// Framed messages decoded
    pub messages_received: u64,
    /// Inbound flow messages discarded because their flow was already closed
    pub messages_discarded: u64,
    /// Flows registered when the snapshot was taken
    pub live_flows: usize,
    /// Current session state
    pub state: SessionState,
}

impl SessionStats {
    pub fn new() -> Self {
        let now = Instant::now();
        SessionStats {
            created_at: now,
            last_active: now,
            bytes_sent: 0,
            bytes_received: 0,
            messages_sent: 0,
            messages_received: 0,
            messages_discarded: 0,
            live_flows: 0,
            state: SessionState::Connecting,
        }
    }

    /// Time since the session was created.
    pub fn uptime(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Record one encoded message written to the transport.
    pub fn record_sent(&mut self, bytes: usize) {
        self.bytes_sent += bytes as u64;
        self.messages_sent += 1;
        self.last_active = Instant::now();
    }

    /// Record raw bytes read from the transport.
    pub fn record_bytes_received(&mut self, bytes: usize) {
        self.bytes_received += bytes as u64;
        self.last_active = Instant::now();
    }

    /// Record one decoded inbound message.
    pub fn record_message_received(&mut self) {
        self.messages_received += 1;
    }

    pub fn record_discarded(&mut self) {
        self.messages_discarded += 1;
    }

    pub fn set_state(&mut self, state: SessionState) {
        self.state = state;
    }
}

impl Default for SessionStats {
    fn default() -> Self {
        Self::new()
    }
}
