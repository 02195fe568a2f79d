mod common;

use std::time::Duration;

use bytes::Bytes;
use common::{FakeServer, established, test_config, within};
use tunnel_core::flow::channel::{DatagramPeerEvent, StreamPeerEvent, datagram_pair, stream_pair};
use tunnel_core::proto::message::{CloseMode, Message, OpenResultCode};
use tunnel_core::{
    Datagram, Endpoint, ExternalFlow, FlowError, FlowId, SessionState, SettingsPolicy,
    TunnelError, TunnelEvent,
};
use tokio::sync::broadcast;

/// Wait for the controller to report a cancelled tunnel.
async fn cancelled(events: &mut broadcast::Receiver<TunnelEvent>) -> String {
    loop {
        match within(events.recv()).await.unwrap() {
            TunnelEvent::Cancelled { reason } => return reason,
            TunnelEvent::StateChanged(_) => {}
        }
    }
}

#[tokio::test]
async fn test_start_applies_server_configuration() {
    let (controller, mut server) = FakeServer::controller();
    assert_eq!(controller.state(), SessionState::Closed);

    let (started, ()) = tokio::join!(controller.start(test_config()), async {
        assert_eq!(server.expect().await, Message::FetchConfiguration);
        // Flows are refused until the configuration arrives
        let (flow, mut peer) = stream_pair(Endpoint::new("example.com", 443), 4);
        assert!(!controller.handle_new_flow(ExternalFlow::stream(flow)));
        assert_eq!(peer.next_event().await, None);

        server
            .send(Message::Configuration(Bytes::from_static(
                br#"{"DNS":["10.0.0.1"],"SearchDomains":["corp.example"],"MTU":1400}"#,
            )))
            .await;
    });
    started.unwrap();

    assert_eq!(controller.state(), SessionState::Established);
    let settings = controller.configuration().unwrap();
    assert_eq!(settings.dns_servers(), ["10.0.0.1"]);
    assert_eq!(settings.search_domains(), ["corp.example"]);
    assert_eq!(settings.get("MTU"), Some(&serde_json::json!(1400)));

    within(controller.stop()).await.unwrap();
    assert_eq!(controller.state(), SessionState::Closed);
    assert_eq!(server.recv().await, None);
}

#[tokio::test]
async fn test_flow_refused_without_session() {
    let (controller, _server) = FakeServer::controller();
    let (flow, mut peer) = datagram_pair(4);
    assert!(!controller.handle_new_flow(ExternalFlow::datagram(flow)));
    assert_eq!(peer.next_event().await, None);
}

#[tokio::test]
async fn test_rejected_open_only_closes_that_flow() {
    let (controller, mut server) = established(test_config()).await;

    let (flow, mut refused) = stream_pair(Endpoint::new("10.1.2.3", 22), 4);
    assert!(controller.handle_new_flow(ExternalFlow::stream(flow)));
    let (id, endpoint) = server.expect_open().await;
    assert_eq!(id, FlowId(1));
    assert_eq!(endpoint, Endpoint::new("10.1.2.3", 22));
    server.reject(id, OpenResultCode::ConnectionRefused).await;

    assert_eq!(
        within(refused.read_to_close()).await,
        (
            Vec::new(),
            Some(FlowError::OpenRejected(OpenResultCode::ConnectionRefused))
        )
    );
    assert_eq!(controller.state(), SessionState::Established);

    // The session keeps accepting flows, with fresh identifiers
    let (flow, mut peer) = stream_pair(Endpoint::new("example.com", 80), 4);
    assert!(controller.handle_new_flow(ExternalFlow::stream(flow)));
    let (id, _) = server.expect_open().await;
    assert_eq!(id, FlowId(2));
    server.accept(id).await;
    server
        .send(Message::Data {
            flow_id: id,
            payload: Bytes::from_static(b"HTTP/1.1 200 OK"),
        })
        .await;
    assert_eq!(
        within(peer.next_event()).await,
        Some(StreamPeerEvent::Data(Bytes::from_static(b"HTTP/1.1 200 OK")))
    );
}

#[tokio::test]
async fn test_transport_loss_closes_every_flow_once() {
    let (controller, mut server) = established(test_config()).await;
    let mut events = controller.subscribe();

    let mut peers = Vec::new();
    for port in [80, 443, 8080] {
        let (flow, peer) = stream_pair(Endpoint::new("example.com", port), 4);
        assert!(controller.handle_new_flow(ExternalFlow::stream(flow)));
        let (id, _) = server.expect_open().await;
        server.accept(id).await;
        peers.push(peer);
    }
    assert_eq!(controller.stats().unwrap().live_flows, 3);

    server.hang_up();

    for peer in &mut peers {
        assert_eq!(
            within(peer.next_event()).await,
            Some(StreamPeerEvent::Closed(Some(FlowError::SessionClosed)))
        );
        assert_eq!(within(peer.next_event()).await, None);
    }

    let reason = cancelled(&mut events).await;
    assert!(reason.contains("Transport lost"), "{}", reason);
    assert_eq!(controller.state(), SessionState::Closed);
    assert!(controller.last_error().unwrap().contains("Transport lost"));
    assert!(matches!(
        controller.stop().await,
        Err(TunnelError::AlreadyStopped)
    ));
}

#[tokio::test]
async fn test_late_data_for_closed_flow_is_discarded() {
    let (controller, mut server) = established(test_config()).await;

    let (flow, mut first) = stream_pair(Endpoint::new("example.com", 443), 4);
    assert!(controller.handle_new_flow(ExternalFlow::stream(flow)));
    let (first_id, _) = server.expect_open().await;
    server.accept(first_id).await;
    server
        .send(Message::Close {
            flow_id: first_id,
            mode: CloseMode::All,
        })
        .await;
    assert_eq!(
        within(first.next_event()).await,
        Some(StreamPeerEvent::Closed(None))
    );

    let (flow, mut second) = stream_pair(Endpoint::new("example.com", 443), 4);
    assert!(controller.handle_new_flow(ExternalFlow::stream(flow)));
    let (second_id, _) = server.expect_open().await;

    // In flight before the server saw the close
    server
        .send(Message::Data {
            flow_id: first_id,
            payload: Bytes::from_static(b"stale"),
        })
        .await;
    server.accept(second_id).await;
    server
        .send(Message::Data {
            flow_id: second_id,
            payload: Bytes::from_static(b"fresh"),
        })
        .await;

    assert_eq!(
        within(second.next_event()).await,
        Some(StreamPeerEvent::Data(Bytes::from_static(b"fresh")))
    );
    assert_eq!(within(first.next_event()).await, None);
    assert_eq!(controller.stats().unwrap().messages_discarded, 1);
    assert_eq!(controller.state(), SessionState::Established);
}

#[tokio::test]
async fn test_message_for_unknown_flow_is_fatal() {
    let (controller, mut server) = established(test_config()).await;
    let mut events = controller.subscribe();

    server
        .send(Message::Data {
            flow_id: FlowId(42),
            payload: Bytes::from_static(b"?"),
        })
        .await;

    let reason = cancelled(&mut events).await;
    assert!(reason.contains("Protocol violation"), "{}", reason);
    assert_eq!(server.recv().await, None);
}

#[tokio::test]
async fn test_corrupt_frame_is_fatal() {
    let (controller, mut server) = established(test_config()).await;
    let mut events = controller.subscribe();

    server.send_raw(&[0xC0, 0x01, 0, 0, 0, 1, 0x03, 0xDE, 0xAD, 0xBE, 0xEF]).await;

    let reason = cancelled(&mut events).await;
    assert!(reason.contains("Protocol violation"), "{}", reason);
    assert!(controller.session_id().is_none());
}

#[tokio::test]
async fn test_interleaved_flows_keep_their_bytes() {
    const FLOWS: usize = 8;
    const CHUNKS: usize = 10;

    let config = test_config().with_max_data_chunk(100);
    let (controller, mut server) = established(config).await;

    // Echo every byte back on the flow it arrived on
    let echo = tokio::spawn(async move {
        let mut finished = 0;
        while finished < FLOWS {
            match server.expect().await {
                Message::Open { flow_id, .. } => server.accept(flow_id).await,
                Message::Data { flow_id, payload } => {
                    assert!(payload.len() <= 100);
                    server.send(Message::Data { flow_id, payload }).await;
                }
                Message::Close {
                    flow_id,
                    mode: CloseMode::Write,
                } => {
                    server
                        .send(Message::Close {
                            flow_id,
                            mode: CloseMode::Write,
                        })
                        .await;
                    finished += 1;
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        server
    });

    let mut apps = Vec::new();
    for n in 0..FLOWS {
        let (flow, mut peer) = stream_pair(Endpoint::new(format!("host{}.example", n), 443), 4);
        assert!(controller.handle_new_flow(ExternalFlow::stream(flow)));
        apps.push(tokio::spawn(async move {
            let mut sent = Vec::new();
            for chunk in 0..CHUNKS {
                let data: Vec<u8> = (0..250).map(|i| (n * 31 + chunk * 7 + i) as u8).collect();
                sent.extend_from_slice(&data);
                peer.send(data).await.unwrap();
            }
            peer.finish();
            let (received, reason) = peer.read_to_close().await;
            (sent, received, reason)
        }));
    }

    for (sent, received, reason) in within(futures::future::try_join_all(apps)).await.unwrap() {
        assert_eq!(reason, None);
        assert_eq!(received, sent);
    }
    let _server = within(echo).await.unwrap();

    let stats = controller.stats().unwrap();
    assert_eq!(stats.live_flows, 0);
    assert_eq!(stats.messages_discarded, 0);
}

#[tokio::test]
async fn test_bulk_upload_to_echo_server() {
    const CHUNKS: usize = 4000;
    const CHUNK_SIZE: usize = 1000;

    let config = test_config().with_max_data_chunk(CHUNK_SIZE);
    let (controller, mut server) = established(config).await;

    // Reads one message, then blocks until its echo is written
    let echo = tokio::spawn(async move {
        loop {
            match server.expect().await {
                Message::Open { flow_id, .. } => server.accept(flow_id).await,
                Message::Data { flow_id, payload } => {
                    server.send(Message::Data { flow_id, payload }).await;
                }
                Message::Close {
                    flow_id,
                    mode: CloseMode::Write,
                } => {
                    server
                        .send(Message::Close {
                            flow_id,
                            mode: CloseMode::Write,
                        })
                        .await;
                    return server;
                }
                other => panic!("unexpected {:?}", other),
            }
        }
    });

    let (flow, mut peer) = stream_pair(Endpoint::new("upload.example", 443), 4);
    assert!(controller.handle_new_flow(ExternalFlow::stream(flow)));
    let app = tokio::spawn(async move {
        let mut sent = Vec::with_capacity(CHUNKS * CHUNK_SIZE);
        for chunk in 0..CHUNKS {
            let data = vec![(chunk % 251) as u8; CHUNK_SIZE];
            sent.extend_from_slice(&data);
            peer.send(data).await.unwrap();
        }
        peer.finish();
        let (received, reason) = peer.read_to_close().await;
        (sent, received, reason)
    });

    let (sent, received, reason) = tokio::time::timeout(Duration::from_secs(30), app)
        .await
        .expect("upload stalled")
        .unwrap();
    assert_eq!(reason, None);
    assert_eq!(received.len(), sent.len());
    assert!(received == sent);
    let _server = within(echo).await.unwrap();

    let stats = controller.stats().unwrap();
    assert_eq!(stats.live_flows, 0);
    assert_eq!(controller.state(), SessionState::Established);
}

#[tokio::test]
async fn test_datagrams_map_one_to_one() {
    let (controller, mut server) = established(test_config()).await;

    let (flow, mut peer) = datagram_pair(4);
    assert!(controller.handle_new_flow(ExternalFlow::datagram(flow)));

    let resolver = Endpoint::new("10.0.0.1", 53);
    peer.send(vec![
        Datagram::new(resolver.clone(), &b"query-a"[..]),
        Datagram::new(resolver.clone(), &b"query-aaaa"[..]),
    ])
    .await
    .unwrap();

    // No open handshake for datagram flows
    for payload in ["query-a", "query-aaaa"] {
        match server.expect().await {
            Message::Datagram {
                flow_id,
                endpoint,
                payload: got,
            } => {
                assert_eq!(flow_id, FlowId(1));
                assert_eq!(endpoint, resolver);
                assert_eq!(got, payload);
            }
            other => panic!("expected datagram, got {:?}", other),
        }
    }

    server
        .send(Message::Datagram {
            flow_id: FlowId(1),
            endpoint: resolver.clone(),
            payload: Bytes::from_static(b"answer"),
        })
        .await;
    assert_eq!(
        within(peer.next_event()).await,
        Some(DatagramPeerEvent::Datagrams(vec![Datagram::new(
            resolver,
            &b"answer"[..]
        )]))
    );

    server
        .send(Message::Close {
            flow_id: FlowId(1),
            mode: CloseMode::All,
        })
        .await;
    assert_eq!(
        within(peer.next_event()).await,
        Some(DatagramPeerEvent::Closed(None))
    );
}

#[tokio::test]
async fn test_stop_closes_flows() {
    let (controller, mut server) = established(test_config()).await;

    let (flow, mut peer) = stream_pair(Endpoint::new("example.com", 443), 4);
    assert!(controller.handle_new_flow(ExternalFlow::stream(flow)));
    let (id, _) = server.expect_open().await;
    server.accept(id).await;

    within(controller.stop()).await.unwrap();
    assert_eq!(
        within(peer.read_to_close()).await,
        (Vec::new(), Some(FlowError::SessionClosed))
    );
    assert!(controller.configuration().is_none());
    assert!(controller.last_error().is_none());

    let (flow, _peer) = stream_pair(Endpoint::new("example.com", 443), 4);
    assert!(!controller.handle_new_flow(ExternalFlow::stream(flow)));
}

#[tokio::test]
async fn test_stop_preempts_pending_start() {
    let (controller, mut server) = FakeServer::controller();

    let (started, stopped) = tokio::join!(controller.start(test_config()), async {
        assert_eq!(server.expect().await, Message::FetchConfiguration);
        assert!(matches!(
            controller.start(test_config()).await,
            Err(TunnelError::AlreadyStarting)
        ));
        controller.stop().await
    });

    assert!(matches!(started, Err(TunnelError::Cancelled)));
    assert!(stopped.is_ok());
    assert_eq!(controller.state(), SessionState::Closed);
}

#[tokio::test]
async fn test_configuration_timeout() {
    let (controller, mut server) = FakeServer::controller();
    let config = test_config().with_configuration_timeout(Duration::from_millis(100));

    let result = within(controller.start(config)).await;
    assert!(matches!(result, Err(TunnelError::Timeout(_))));
    assert_eq!(server.expect().await, Message::FetchConfiguration);
    assert_eq!(server.recv().await, None);
}

#[tokio::test]
async fn test_missing_dns_depends_on_policy() {
    let (controller, mut server) = FakeServer::controller();
    let (started, ()) = tokio::join!(
        controller.start(test_config()),
        server.configure(r#"{"MTU":1400}"#)
    );
    started.unwrap();
    assert!(controller.configuration().unwrap().dns_servers().is_empty());

    let (controller, mut server) = FakeServer::controller();
    let strict = test_config().with_settings_policy(SettingsPolicy::strict());
    let (started, ()) = tokio::join!(controller.start(strict), server.configure(r#"{"MTU":1400}"#));
    assert!(matches!(started, Err(TunnelError::ConfigurationInvalid(_))));
    assert_eq!(controller.state(), SessionState::Closed);
}

#[tokio::test]
async fn test_malformed_configuration() {
    let (controller, mut server) = FakeServer::controller();
    let (started, ()) = tokio::join!(controller.start(test_config()), server.configure("not json"));
    assert!(matches!(started, Err(TunnelError::ConfigurationInvalid(_))));
}

#[tokio::test]
async fn test_flow_message_before_configuration() {
    let (controller, mut server) = FakeServer::controller();
    let (started, ()) = tokio::join!(controller.start(test_config()), async {
        assert_eq!(server.expect().await, Message::FetchConfiguration);
        server
            .send(Message::Resume {
                flow_id: FlowId(1),
            })
            .await;
    });
    assert!(matches!(started, Err(TunnelError::ProtocolViolation(_))));
}

#[tokio::test]
async fn test_open_that_cannot_be_framed_only_refuses_that_flow() {
    let (controller, mut server) = established(test_config()).await;

    let (flow, mut peer) = stream_pair(Endpoint::new("h".repeat(70_000), 443), 4);
    assert!(controller.handle_new_flow(ExternalFlow::stream(flow)));
    assert_eq!(
        within(peer.read_to_close()).await,
        (
            Vec::new(),
            Some(FlowError::OpenRejected(OpenResultCode::InvalidParameter))
        )
    );

    let (flow, _peer) = stream_pair(Endpoint::new("example.com", 443), 4);
    assert!(controller.handle_new_flow(ExternalFlow::stream(flow)));
    let (id, endpoint) = server.expect_open().await;
    assert_eq!(id, FlowId(2));
    assert_eq!(endpoint, Endpoint::new("example.com", 443));
    assert_eq!(controller.state(), SessionState::Established);
}

#[tokio::test]
async fn test_datagram_that_cannot_be_framed_is_dropped() {
    let (controller, mut server) = established(test_config()).await;

    let (flow, peer) = datagram_pair(4);
    assert!(controller.handle_new_flow(ExternalFlow::datagram(flow)));
    peer.send(vec![
        Datagram::new(Endpoint::new("h".repeat(70_000), 53), &b"lost"[..]),
        Datagram::new(Endpoint::new("10.0.0.1", 53), &b"kept"[..]),
    ])
    .await
    .unwrap();

    assert!(matches!(
        server.expect().await,
        Message::Datagram { payload, .. } if payload == "kept"
    ));
    assert_eq!(controller.state(), SessionState::Established);
    assert!(controller.last_error().is_none());
}

#[tokio::test]
async fn test_second_stop_while_stopping() {
    let (controller, _server) = established(test_config()).await;

    let (first, second) = tokio::join!(controller.stop(), controller.stop());
    assert!(first.is_ok());
    assert!(matches!(second, Err(TunnelError::AlreadyStopped)));
    assert_eq!(controller.state(), SessionState::Closed);
}

#[tokio::test]
async fn test_transport_loss_fails_pending_start() {
    let (controller, mut server) = FakeServer::controller();

    let (started, ()) = tokio::join!(controller.start(test_config()), async {
        assert_eq!(server.expect().await, Message::FetchConfiguration);
        server.hang_up();
    });

    assert!(matches!(started, Err(TunnelError::TransportLost(_))));
    assert_eq!(controller.state(), SessionState::Closed);
    assert!(controller.last_error().is_some());
}
