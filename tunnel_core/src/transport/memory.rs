//! In-process transport built on tokio channels.
//!
//! Useful for hosting the tunnel next to an in-process peer and for tests.
//! Each `send_data` call is delivered to the peer as one `recv_data` chunk.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Mutex;
use tokio::sync::mpsc;

use super::{ClientTransport, Connection, ConnectionReader, ConnectionWriter, TransportError};

const CHANNEL_DEPTH: usize = 64;

/// One end of an in-memory byte pipe.
pub struct MemoryConnection {
    tx: Option<mpsc::Sender<Vec<u8>>>,
    rx: mpsc::Receiver<Vec<u8>>,
    addr: SocketAddr,
}

impl MemoryConnection {
    /// Create two connected ends.
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::channel(CHANNEL_DEPTH);
        let (tx_b, rx_b) = mpsc::channel(CHANNEL_DEPTH);
        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        let a = MemoryConnection {
            tx: Some(tx_a),
            rx: rx_b,
            addr,
        };
        let b = MemoryConnection {
            tx: Some(tx_b),
            rx: rx_a,
            addr,
        };
        (a, b)
    }

    /// Stop sending; the peer observes end of stream once queued chunks drain.
    pub fn shutdown_write(&mut self) {
        self.tx = None;
    }
}

async fn send_chunk(tx: Option<&mpsc::Sender<Vec<u8>>>, data: &[u8]) -> Result<(), TransportError> {
    let tx = tx.ok_or_else(|| TransportError::Send("write half closed".to_string()))?;
    tx.send(data.to_vec())
        .await
        .map_err(|_| TransportError::Send("peer dropped".to_string()))
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn send_data(&mut self, data: &[u8]) -> Result<(), TransportError> {
        send_chunk(self.tx.as_ref(), data).await
    }

    async fn recv_data(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        Ok(self.rx.recv().await)
    }

    fn peer_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.addr)
    }

    fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.addr)
    }

    async fn close(self: Box<Self>) -> Result<(), TransportError> {
        Ok(())
    }

    fn split(self: Box<Self>) -> (Box<dyn ConnectionReader>, Box<dyn ConnectionWriter>) {
        let this = *self;
        (
            Box::new(MemoryReader { rx: this.rx }),
            Box::new(MemoryWriter { tx: this.tx }),
        )
    }
}

struct MemoryReader {
    rx: mpsc::Receiver<Vec<u8>>,
}

#[async_trait]
impl ConnectionReader for MemoryReader {
    async fn recv_data(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        Ok(self.rx.recv().await)
    }
}

struct MemoryWriter {
    tx: Option<mpsc::Sender<Vec<u8>>>,
}

#[async_trait]
impl ConnectionWriter for MemoryWriter {
    async fn send_data(&mut self, data: &[u8]) -> Result<(), TransportError> {
        send_chunk(self.tx.as_ref(), data).await
    }

    async fn close(self: Box<Self>) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Client transport that hands out one pre-built connection.
///
/// The first `connect` returns the connection; later calls fail as if the
/// server were unreachable.
pub struct MemoryTransport {
    connection: Mutex<Option<MemoryConnection>>,
}

impl MemoryTransport {
    pub fn new(connection: MemoryConnection) -> Self {
        MemoryTransport {
            connection: Mutex::new(Some(connection)),
        }
    }

    /// A transport whose every connect attempt fails.
    pub fn unreachable() -> Self {
        MemoryTransport {
            connection: Mutex::new(None),
        }
    }
}

#[async_trait]
impl ClientTransport for MemoryTransport {
    async fn connect(&self, server_address: &str) -> Result<Box<dyn Connection>, TransportError> {
        let connection = self
            .connection
            .lock()
            .map_err(|_| TransportError::Generic("transport lock poisoned".to_string()))?
            .take();
        match connection {
            Some(conn) => Ok(Box::new(conn)),
            None => Err(TransportError::Connection(format!(
                "{} is unreachable",
                server_address
            ))),
        }
    }
}
