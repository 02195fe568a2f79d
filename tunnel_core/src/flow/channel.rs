//! Channel-backed external flows.
//!
//! A host that intercepts connections somewhere else (another task, another
//! process behind IPC) hands the tunnel a [`ChannelStreamFlow`] or
//! [`ChannelDatagramFlow`] and keeps the matching peer to drive the
//! application side.

use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use tokio::sync::mpsc;

use super::{Datagram, DatagramFlow, FlowError, StreamFlow};
use crate::tunnel::types::Endpoint;

/// What the tunnel did to a stream flow, as seen from the application side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamPeerEvent {
    Data(Bytes),
    /// The remote side finished sending
    ShutdownWrite,
    Closed(Option<FlowError>),
}

/// Tunnel side of a channel-backed byte stream.
pub struct ChannelStreamFlow {
    endpoint: Endpoint,
    from_app: mpsc::Receiver<io::Result<Bytes>>,
    to_app: mpsc::UnboundedSender<StreamPeerEvent>,
}

/// Application side of a [`ChannelStreamFlow`].
pub struct StreamPeer {
    to_tunnel: Option<mpsc::Sender<io::Result<Bytes>>>,
    events: mpsc::UnboundedReceiver<StreamPeerEvent>,
}

/// Create a stream flow towards `endpoint` and its application-side peer.
pub fn stream_pair(endpoint: Endpoint, depth: usize) -> (ChannelStreamFlow, StreamPeer) {
    let (app_tx, app_rx) = mpsc::channel(depth.max(1));
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    (
        ChannelStreamFlow {
            endpoint,
            from_app: app_rx,
            to_app: event_tx,
        },
        StreamPeer {
            to_tunnel: Some(app_tx),
            events: event_rx,
        },
    )
}

impl StreamPeer {
    /// Write bytes into the tunnel.
    pub async fn send(&self, data: impl Into<Bytes>) -> io::Result<()> {
        let tx = self
            .to_tunnel
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "write half finished"))?;
        tx.send(Ok(data.into()))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "flow closed"))
    }

    /// Make the next tunnel-side read fail with `error`.
    pub async fn fail(&self, error: io::Error) -> io::Result<()> {
        let tx = self
            .to_tunnel
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "write half finished"))?;
        tx.send(Err(error))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "flow closed"))
    }

    /// Signal end of stream to the tunnel.
    pub fn finish(&mut self) {
        self.to_tunnel = None;
    }

    pub async fn next_event(&mut self) -> Option<StreamPeerEvent> {
        self.events.recv().await
    }

    /// Collect everything the tunnel delivers until the flow is closed.
    ///
    /// Returns the received bytes and the close reason; `None` as the reason
    /// means an orderly close. If the tunnel drops the flow without closing
    /// it, the reason is `SessionClosed`.
    pub async fn read_to_close(&mut self) -> (Vec<u8>, Option<FlowError>) {
        let mut received = Vec::new();
        while let Some(event) = self.events.recv().await {
            match event {
                StreamPeerEvent::Data(bytes) => received.extend_from_slice(&bytes),
                StreamPeerEvent::ShutdownWrite => {}
                StreamPeerEvent::Closed(reason) => return (received, reason),
            }
        }
        (received, Some(FlowError::SessionClosed))
    }
}

fn app_gone() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "application side dropped")
}

#[async_trait]
impl StreamFlow for ChannelStreamFlow {
    fn remote_endpoint(&self) -> Endpoint {
        self.endpoint.clone()
    }

    async fn read(&mut self) -> io::Result<Option<Bytes>> {
        self.from_app.recv().await.transpose()
    }

    async fn write(&mut self, data: Bytes) -> io::Result<()> {
        self.to_app
            .send(StreamPeerEvent::Data(data))
            .map_err(|_| app_gone())
    }

    async fn shutdown_write(&mut self) -> io::Result<()> {
        self.to_app
            .send(StreamPeerEvent::ShutdownWrite)
            .map_err(|_| app_gone())
    }

    async fn close(&mut self, error: Option<FlowError>) {
        self.from_app.close();
        let _ = self.to_app.send(StreamPeerEvent::Closed(error));
    }
}

/// What the tunnel did to a datagram flow, as seen from the application side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatagramPeerEvent {
    Datagrams(Vec<Datagram>),
    Closed(Option<FlowError>),
}

/// Tunnel side of a channel-backed datagram session.
pub struct ChannelDatagramFlow {
    from_app: mpsc::Receiver<io::Result<Vec<Datagram>>>,
    to_app: mpsc::UnboundedSender<DatagramPeerEvent>,
}

/// Application side of a [`ChannelDatagramFlow`].
pub struct DatagramPeer {
    to_tunnel: Option<mpsc::Sender<io::Result<Vec<Datagram>>>>,
    events: mpsc::UnboundedReceiver<DatagramPeerEvent>,
}

pub fn datagram_pair(depth: usize) -> (ChannelDatagramFlow, DatagramPeer) {
    let (app_tx, app_rx) = mpsc::channel(depth.max(1));
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    (
        ChannelDatagramFlow {
            from_app: app_rx,
            to_app: event_tx,
        },
        DatagramPeer {
            to_tunnel: Some(app_tx),
            events: event_rx,
        },
    )
}

impl DatagramPeer {
    /// Send one batch of datagrams, as returned by a single socket read.
    pub async fn send(&self, datagrams: Vec<Datagram>) -> io::Result<()> {
        let tx = self
            .to_tunnel
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "socket finished"))?;
        tx.send(Ok(datagrams))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "flow closed"))
    }

    /// The application is done with the socket.
    pub fn finish(&mut self) {
        self.to_tunnel = None;
    }

    pub async fn next_event(&mut self) -> Option<DatagramPeerEvent> {
        self.events.recv().await
    }
}

#[async_trait]
impl DatagramFlow for ChannelDatagramFlow {
    async fn read_datagrams(&mut self) -> io::Result<Option<Vec<Datagram>>> {
        self.from_app.recv().await.transpose()
    }

    async fn write_datagrams(&mut self, datagrams: Vec<Datagram>) -> io::Result<()> {
        self.to_app
            .send(DatagramPeerEvent::Datagrams(datagrams))
            .map_err(|_| app_gone())
    }

    async fn close(&mut self, error: Option<FlowError>) {
        self.from_app.close();
        let _ = self.to_app.send(DatagramPeerEvent::Closed(error));
    }
}
