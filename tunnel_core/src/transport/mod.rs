//! Transport abstraction underneath the tunnel session.
//!
//! The session only needs an ordered, reliable byte stream that has already
//! been secured by a lower layer. Concrete transports: [`tcp`] for real
//! deployments and [`memory`] for in-process peers.

pub mod memory;
pub mod tcp;

use async_trait::async_trait;
use std::net::SocketAddr;
use thiserror::Error;

pub use memory::{MemoryConnection, MemoryTransport};
pub use tcp::{TcpClient, TcpConnection};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Send error: {0}")]
    Send(String),
    #[error("Receive error: {0}")]
    Receive(String),
    #[error("Close error: {0}")]
    Close(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Operation timed out: {0}")]
    Timeout(String),
    #[error("Generic error: {0}")]
    Generic(String),
}

/// Represents an active connection over a transport protocol.
///
/// `recv_data` must be cancel safe: the session polls it inside
/// `tokio::select!` and drops the future whenever an outbound message is
/// ready, so no bytes may be lost when it is dropped before completion.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Sends data over the connection. All bytes are written before returning.
    async fn send_data(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Receives data from the connection.
    /// Returns `Ok(None)` if the connection was gracefully closed by the peer.
    async fn recv_data(&mut self) -> Result<Option<Vec<u8>>, TransportError>;

    /// Returns the peer's socket address.
    fn peer_addr(&self) -> Result<SocketAddr, TransportError>;

    /// Returns the local socket address.
    fn local_addr(&self) -> Result<SocketAddr, TransportError>;

    /// Closes the connection.
    /// This method consumes the connection object.
    async fn close(self: Box<Self>) -> Result<(), TransportError>;

    /// Split into halves that can be driven from different tasks.
    fn split(self: Box<Self>) -> (Box<dyn ConnectionReader>, Box<dyn ConnectionWriter>);
}

/// Read half of a split [`Connection`].
#[async_trait]
pub trait ConnectionReader: Send {
    /// Same contract as [`Connection::recv_data`].
    async fn recv_data(&mut self) -> Result<Option<Vec<u8>>, TransportError>;
}

/// Write half of a split [`Connection`].
#[async_trait]
pub trait ConnectionWriter: Send {
    /// Same contract as [`Connection::send_data`].
    async fn send_data(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Shut the write direction and release the half.
    async fn close(self: Box<Self>) -> Result<(), TransportError>;
}

/// Trait for client-side transport protocols.
#[async_trait]
pub trait ClientTransport: Send + Sync {
    /// Establishes a connection to a server at the given address.
    /// The address format is transport-specific (e.g., "hostname:port" or "url").
    async fn connect(&self, server_address: &str) -> Result<Box<dyn Connection>, TransportError>;
}
