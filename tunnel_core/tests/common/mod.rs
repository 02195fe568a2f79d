//! In-process tunnel server for driving a client session in tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tunnel_core::proto::framing::Decoded;
use tunnel_core::proto::message::{Message, MessageCodec, OpenResultCode};
use tunnel_core::transport::{Connection, MemoryConnection, MemoryTransport};
use tunnel_core::{Endpoint, FlowId, TunnelConfig, TunnelController};

pub const STEP_TIMEOUT: Duration = Duration::from_secs(5);

pub const DNS_CONFIGURATION: &str =
    r#"{"DNS":{"Servers":["10.0.0.1"],"SearchDomains":["corp.example"]}}"#;

/// Server end of a memory transport, speaking the framed protocol.
pub struct FakeServer {
    conn: MemoryConnection,
    codec: MessageCodec,
}

impl FakeServer {
    /// A controller whose transport connects to the returned server.
    pub fn controller() -> (TunnelController, FakeServer) {
        let (client, server) = MemoryConnection::pair();
        let controller = TunnelController::new(Arc::new(MemoryTransport::new(client)));
        let server = FakeServer {
            conn: server,
            codec: MessageCodec::new(),
        };
        (controller, server)
    }

    pub async fn send(&mut self, message: Message) {
        let frame = self.codec.encode(&message).unwrap();
        self.conn.send_data(&frame).await.unwrap();
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.conn.send_data(bytes).await.unwrap();
    }

    /// Next message from the client; `None` once the client hung up.
    pub async fn recv(&mut self) -> Option<Message> {
        loop {
            if let Decoded::Frame(message) = self.codec.next_message().unwrap() {
                return Some(message);
            }
            let chunk = tokio::time::timeout(STEP_TIMEOUT, self.conn.recv_data())
                .await
                .expect("timed out waiting for the client");
            match chunk.unwrap() {
                Some(bytes) => self.codec.feed(&bytes),
                None => return None,
            }
        }
    }

    pub async fn expect(&mut self) -> Message {
        self.recv().await.expect("client closed the connection")
    }

    /// Answer the client's configuration request with `json`.
    pub async fn configure(&mut self, json: &str) {
        assert_eq!(self.expect().await, Message::FetchConfiguration);
        self.send(Message::Configuration(Bytes::copy_from_slice(json.as_bytes())))
            .await;
    }

    /// Wait for an `open` and return its flow and endpoint.
    pub async fn expect_open(&mut self) -> (FlowId, Endpoint) {
        match self.expect().await {
            Message::Open { flow_id, endpoint } => (flow_id, endpoint),
            other => panic!("expected open, got {:?}", other),
        }
    }

    pub async fn accept(&mut self, flow_id: FlowId) {
        self.send(Message::OpenResult {
            flow_id,
            result: Ok(()),
        })
        .await;
    }

    pub async fn reject(&mut self, flow_id: FlowId, code: OpenResultCode) {
        self.send(Message::OpenResult {
            flow_id,
            result: Err(code),
        })
        .await;
    }

    /// Stop sending; the client sees the transport close.
    pub fn hang_up(&mut self) {
        self.conn.shutdown_write();
    }
}

pub fn test_config() -> TunnelConfig {
    TunnelConfig::new("memory")
        .with_connect_timeout(Duration::from_secs(1))
        .with_configuration_timeout(STEP_TIMEOUT)
}

/// A controller with an established session.
pub async fn established(config: TunnelConfig) -> (TunnelController, FakeServer) {
    let (controller, mut server) = FakeServer::controller();
    let (started, ()) = tokio::join!(controller.start(config), server.configure(DNS_CONFIGURATION));
    started.unwrap();
    (controller, server)
}

/// Run `fut` with the step timeout.
pub async fn within<F: std::future::Future>(fut: F) -> F::Output {
    tokio::time::timeout(STEP_TIMEOUT, fut)
        .await
        .expect("timed out")
}
