//! TCP transport.
//!
//! Plain TCP is used when the deployment secures the path below the tunnel
//! (VPN, stunnel, loopback); the session itself never encrypts.

use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::{debug, info};

use super::{ClientTransport, Connection, ConnectionReader, ConnectionWriter, TransportError};

const READ_BUFFER_SIZE: usize = 16 * 1024;

/// One established TCP connection to the tunnel server.
pub struct TcpConnection {
    stream: TcpStream,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    read_buf: Box<[u8]>,
}

impl TcpConnection {
    pub fn new(stream: TcpStream) -> Result<Self, TransportError> {
        let peer_addr = stream.peer_addr()?;
        let local_addr = stream.local_addr()?;
        stream.set_nodelay(true)?;
        Ok(TcpConnection {
            stream,
            peer_addr,
            local_addr,
            read_buf: vec![0u8; READ_BUFFER_SIZE].into_boxed_slice(),
        })
    }
}

#[async_trait]
impl Connection for TcpConnection {
    async fn send_data(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.stream
            .write_all(data)
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn recv_data(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        // `read` is cancel safe; `read_exact` would not be.
        let n = self
            .stream
            .read(&mut self.read_buf)
            .await
            .map_err(|e| TransportError::Receive(e.to_string()))?;
        if n == 0 {
            debug!(peer = %self.peer_addr, "TCP peer closed the connection");
            return Ok(None);
        }
        Ok(Some(self.read_buf[..n].to_vec()))
    }

    fn peer_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.peer_addr)
    }

    fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.local_addr)
    }

    async fn close(self: Box<Self>) -> Result<(), TransportError> {
        let mut this = self;
        this.stream
            .shutdown()
            .await
            .map_err(|e| TransportError::Close(e.to_string()))
    }

    fn split(self: Box<Self>) -> (Box<dyn ConnectionReader>, Box<dyn ConnectionWriter>) {
        let this = *self;
        let (read, write) = this.stream.into_split();
        let reader = TcpReader {
            read,
            peer_addr: this.peer_addr,
            read_buf: this.read_buf,
        };
        (Box::new(reader), Box::new(TcpWriter { write }))
    }
}

struct TcpReader {
    read: OwnedReadHalf,
    peer_addr: SocketAddr,
    read_buf: Box<[u8]>,
}

#[async_trait]
impl ConnectionReader for TcpReader {
    async fn recv_data(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        let n = self
            .read
            .read(&mut self.read_buf)
            .await
            .map_err(|e| TransportError::Receive(e.to_string()))?;
        if n == 0 {
            debug!(peer = %self.peer_addr, "TCP peer closed the connection");
            return Ok(None);
        }
        Ok(Some(self.read_buf[..n].to_vec()))
    }
}

struct TcpWriter {
    write: OwnedWriteHalf,
}

#[async_trait]
impl ConnectionWriter for TcpWriter {
    async fn send_data(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.write
            .write_all(data)
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn close(self: Box<Self>) -> Result<(), TransportError> {
        let mut this = self;
        this.write
            .shutdown()
            .await
            .map_err(|e| TransportError::Close(e.to_string()))
    }
}

/// Client transport that dials the server over TCP.
#[derive(Debug, Default, Clone)]
pub struct TcpClient;

impl TcpClient {
    pub fn new() -> Self {
        TcpClient
    }
}

#[async_trait]
impl ClientTransport for TcpClient {
    async fn connect(&self, server_address: &str) -> Result<Box<dyn Connection>, TransportError> {
        let stream = TcpStream::connect(server_address)
            .await
            .map_err(|e| TransportError::Connection(format!("{}: {}", server_address, e)))?;
        let connection = TcpConnection::new(stream)?;
        info!(
            peer = %connection.peer_addr,
            local = %connection.local_addr,
            "TCP transport connected"
        );
        Ok(Box::new(connection))
    }
}
