//! Application flows carried through the tunnel.
//!
//! The host hands the tunnel an [`ExternalFlow`]: either a byte stream
//! ([`StreamFlow`]) or a datagram session ([`DatagramFlow`]). The registry
//! assigns it an identifier and an adapter task bridges it to the session:
//! [`stream`] for byte streams, [`datagram`] for datagram sessions.

pub mod channel;
pub mod datagram;
pub mod registry;
pub mod stream;

use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use thiserror::Error;

use crate::proto::message::{CloseMode, Message, OpenResultCode};
use crate::session::OutboundSender;
use crate::tunnel::types::{Endpoint, FlowId, FlowKind};

pub use registry::{FlowHandle, FlowInbox, FlowRegistry, FlowState, RegistryError};

/// Reason an external flow was closed by the tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlowError {
    /// The server declined to open the flow
    #[error("Flow open rejected: {0}")]
    OpenRejected(OpenResultCode),

    /// The tunnel session ended while the flow was live
    #[error("Tunnel session closed")]
    SessionClosed,

    /// Reading from or writing to the external flow failed
    #[error("Flow I/O error: {0}")]
    Io(String),
}

impl From<io::Error> for FlowError {
    fn from(err: io::Error) -> Self {
        FlowError::Io(err.to_string())
    }
}

/// A byte-stream flow owned by the host (an intercepted TCP connection).
///
/// `read` must be cancel safe: the adapter races it against inbound tunnel
/// events and drops the pending read whenever an event wins.
#[async_trait]
pub trait StreamFlow: Send + 'static {
    /// Destination the application asked to connect to.
    fn remote_endpoint(&self) -> Endpoint;

    /// Next chunk written by the application. `Ok(None)` at end of stream.
    async fn read(&mut self) -> io::Result<Option<Bytes>>;

    /// Deliver bytes from the tunnel to the application.
    async fn write(&mut self, data: Bytes) -> io::Result<()>;

    /// The remote side finished sending; shut the application's read side.
    async fn shutdown_write(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Close the flow. Called exactly once by the adapter.
    async fn close(&mut self, error: Option<FlowError>);
}

/// One datagram together with its remote endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub endpoint: Endpoint,
    pub payload: Bytes,
}

impl Datagram {
    pub fn new(endpoint: Endpoint, payload: impl Into<Bytes>) -> Self {
        Datagram {
            endpoint,
            payload: payload.into(),
        }
    }
}

/// A datagram flow owned by the host (an intercepted UDP socket).
///
/// `read_datagrams` must be cancel safe, like [`StreamFlow::read`].
#[async_trait]
pub trait DatagramFlow: Send + 'static {
    /// Next batch of datagrams sent by the application. `Ok(None)` when the
    /// application is done with the socket.
    async fn read_datagrams(&mut self) -> io::Result<Option<Vec<Datagram>>>;

    /// Deliver datagrams from the tunnel to the application.
    async fn write_datagrams(&mut self, datagrams: Vec<Datagram>) -> io::Result<()>;

    /// Close the flow. Called exactly once by the adapter.
    async fn close(&mut self, error: Option<FlowError>);
}

/// A new flow handed over by the host, tagged by kind.
pub enum ExternalFlow {
    Stream(Box<dyn StreamFlow>),
    Datagram(Box<dyn DatagramFlow>),
}

impl ExternalFlow {
    pub fn stream(flow: impl StreamFlow) -> Self {
        ExternalFlow::Stream(Box::new(flow))
    }

    pub fn datagram(flow: impl DatagramFlow) -> Self {
        ExternalFlow::Datagram(Box::new(flow))
    }

    pub fn kind(&self) -> FlowKind {
        match self {
            ExternalFlow::Stream(_) => FlowKind::Stream,
            ExternalFlow::Datagram(_) => FlowKind::Datagram,
        }
    }

    /// Destination known at admission time (stream flows only).
    pub fn endpoint(&self) -> Option<Endpoint> {
        match self {
            ExternalFlow::Stream(flow) => Some(flow.remote_endpoint()),
            ExternalFlow::Datagram(_) => None,
        }
    }
}

impl std::fmt::Debug for ExternalFlow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalFlow")
            .field("kind", &self.kind())
            .field("endpoint", &self.endpoint())
            .finish()
    }
}

/// Events routed from the session to one flow adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowEvent {
    OpenResult(Result<(), OpenResultCode>),
    Data(Bytes),
    Datagram(Datagram),
    Close(CloseMode),
    Suspend,
    Resume,
    /// The session is tearing down; the flow has already been unregistered
    SessionClosed,
}

impl FlowEvent {
    /// Split an inbound flow-level message into its target and event.
    ///
    /// Returns `None` for messages a server never addresses to a flow
    /// (`open`, and the session-level types).
    pub fn from_message(message: Message) -> Option<(FlowId, FlowEvent)> {
        match message {
            Message::OpenResult { flow_id, result } => Some((flow_id, FlowEvent::OpenResult(result))),
            Message::Data { flow_id, payload } => Some((flow_id, FlowEvent::Data(payload))),
            Message::Datagram {
                flow_id,
                endpoint,
                payload,
            } => Some((flow_id, FlowEvent::Datagram(Datagram { endpoint, payload }))),
            Message::Close { flow_id, mode } => Some((flow_id, FlowEvent::Close(mode))),
            Message::Suspend { flow_id } => Some((flow_id, FlowEvent::Suspend)),
            Message::Resume { flow_id } => Some((flow_id, FlowEvent::Resume)),
            Message::Open { .. } | Message::FetchConfiguration | Message::Configuration(_) => None,
        }
    }
}

/// What an adapter needs from its session.
#[derive(Clone)]
pub struct FlowContext {
    pub registry: FlowRegistry,
    pub outbound: OutboundSender,
    /// Largest stream payload put in one `data` message
    pub max_data_chunk: usize,
    /// Largest encoded message the session will frame
    pub max_message_size: usize,
}
