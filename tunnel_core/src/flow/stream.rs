//! Stream flow adapter.
//!
//! Bridges one byte-stream external flow to the session:
//!
//! 1. send `open` and hold back local reads until `open-result` arrives;
//!    a negative result closes the external flow with the server's code
//! 2. pump bytes both ways, splitting local reads into `data` chunks
//! 3. honour half-close (`close(write)`) in both directions, `suspend`
//!    and `resume`, and finish on `close(all)` or when both halves are shut
//!
//! The external flow is closed exactly once and the flow is unregistered on
//! every exit path.

use bytes::Bytes;
use std::io;
use tracing::{debug, info, instrument, trace, warn};

use super::{FlowContext, FlowError, FlowEvent, FlowInbox, FlowState, StreamFlow};
use crate::proto::framing::FrameError;
use crate::proto::message::{CloseMode, Message, OpenResultCode};
use crate::tunnel::error::{TunnelError, TunnelResult};
use crate::tunnel::types::FlowId;

enum Exit {
    /// Both halves closed, or the server sent `close(all)`
    Finished,
    Rejected(OpenResultCode),
    /// The `open` message could not be framed, so it was never sent
    Unopenable(FrameError),
    Failed(io::Error),
    SessionGone,
}

struct StreamAdapter {
    id: FlowId,
    flow: Box<dyn StreamFlow>,
    ctx: FlowContext,
    /// The application has not reached end of stream yet
    local_open: bool,
    /// The server has not sent `close(write)` yet
    remote_open: bool,
    suspended: bool,
}

/// Run one stream flow until it closes.
///
/// Returns `FlowOpenRejected` when the server declined the flow and `Closed`
/// when the session ended underneath it. Neither affects other flows.
#[instrument(name = "stream_flow", skip_all, fields(flow_id = %id))]
pub async fn run_stream_flow(
    id: FlowId,
    flow: Box<dyn StreamFlow>,
    mut inbox: FlowInbox,
    ctx: FlowContext,
) -> TunnelResult<()> {
    let mut adapter = StreamAdapter {
        id,
        flow,
        ctx,
        local_open: true,
        remote_open: true,
        suspended: false,
    };
    let exit = adapter.run(&mut inbox).await;
    adapter.finish(exit).await
}

impl StreamAdapter {
    async fn run(&mut self, inbox: &mut FlowInbox) -> Exit {
        let endpoint = self.flow.remote_endpoint();
        debug!(%endpoint, "Opening stream flow");
        let open = Message::Open {
            flow_id: self.id,
            endpoint,
        };
        if let Err(e) = open.check_fits(self.ctx.max_message_size) {
            return Exit::Unopenable(e);
        }
        if self.ctx.outbound.send(open).await.is_err() {
            return Exit::SessionGone;
        }

        let early = match self.await_open(inbox).await {
            Ok(early) => early,
            Err(exit) => return exit,
        };
        // Fails only when the session already force-closed us; the inbox says so next.
        let _ = self.ctx.registry.set_state(self.id, FlowState::Open);
        debug!("Stream flow open");

        for data in early {
            if let Err(e) = self.flow.write(data).await {
                return Exit::Failed(e);
            }
        }
        if !self.remote_open {
            // close(write) arrived while the open was pending
            let _ = self.ctx.registry.set_state(self.id, FlowState::Closing);
            if let Err(e) = self.flow.shutdown_write().await {
                return Exit::Failed(e);
            }
        }
        self.pump(inbox).await
    }

    /// Wait for `open-result`. Inbound data that races ahead of it is kept
    /// and returned in order.
    async fn await_open(&mut self, inbox: &mut FlowInbox) -> Result<Vec<Bytes>, Exit> {
        let mut early = Vec::new();
        loop {
            match inbox.recv().await {
                Some(FlowEvent::OpenResult(Ok(()))) => return Ok(early),
                Some(FlowEvent::OpenResult(Err(code))) => return Err(Exit::Rejected(code)),
                Some(FlowEvent::Data(data)) => early.push(data),
                Some(FlowEvent::Close(CloseMode::Write)) => self.remote_open = false,
                Some(FlowEvent::Close(CloseMode::All)) => {
                    debug!("Server closed flow before answering open");
                    return Err(Exit::Finished);
                }
                Some(FlowEvent::Suspend) => self.suspended = true,
                Some(FlowEvent::Resume) => self.suspended = false,
                Some(FlowEvent::Datagram(_)) => {
                    warn!("Ignoring datagram addressed to a stream flow");
                }
                Some(FlowEvent::SessionClosed) | None => return Err(Exit::SessionGone),
            }
        }
    }

    async fn pump(&mut self, inbox: &mut FlowInbox) -> Exit {
        loop {
            if !self.local_open && !self.remote_open {
                debug!("Both halves closed");
                return Exit::Finished;
            }

            let read_enabled = self.local_open && !self.suspended;
            tokio::select! {
                event = inbox.recv() => match event {
                    Some(FlowEvent::Data(data)) => {
                        trace!(bytes = data.len(), "Delivering data to flow");
                        if let Err(e) = self.flow.write(data).await {
                            return Exit::Failed(e);
                        }
                    }
                    Some(FlowEvent::Close(CloseMode::Write)) => {
                        debug!("Server finished sending");
                        self.remote_open = false;
                        let _ = self.ctx.registry.set_state(self.id, FlowState::Closing);
                        if let Err(e) = self.flow.shutdown_write().await {
                            return Exit::Failed(e);
                        }
                    }
                    Some(FlowEvent::Close(CloseMode::All)) => {
                        debug!("Server closed flow");
                        return Exit::Finished;
                    }
                    Some(FlowEvent::Suspend) => {
                        trace!("Suspending reads");
                        self.suspended = true;
                    }
                    Some(FlowEvent::Resume) => {
                        trace!("Resuming reads");
                        self.suspended = false;
                    }
                    Some(FlowEvent::OpenResult(_)) => {
                        warn!("Ignoring duplicate open-result");
                    }
                    Some(FlowEvent::Datagram(_)) => {
                        warn!("Ignoring datagram addressed to a stream flow");
                    }
                    Some(FlowEvent::SessionClosed) | None => return Exit::SessionGone,
                },
                read = self.flow.read(), if read_enabled => match read {
                    Ok(Some(data)) => {
                        if self.send_data(data).await.is_err() {
                            return Exit::SessionGone;
                        }
                    }
                    Ok(None) => {
                        debug!("Application finished sending");
                        self.local_open = false;
                        let _ = self.ctx.registry.set_state(self.id, FlowState::Closing);
                        let close = Message::Close {
                            flow_id: self.id,
                            mode: CloseMode::Write,
                        };
                        if self.ctx.outbound.send(close).await.is_err() {
                            return Exit::SessionGone;
                        }
                    }
                    Err(e) => return Exit::Failed(e),
                },
            }
        }
    }

    /// Queue `data` as one or more `data` messages, in order.
    async fn send_data(&mut self, mut data: Bytes) -> TunnelResult<()> {
        let chunk_size = self.ctx.max_data_chunk.max(1);
        while !data.is_empty() {
            let payload = data.split_to(data.len().min(chunk_size));
            self.ctx
                .outbound
                .send(Message::Data {
                    flow_id: self.id,
                    payload,
                })
                .await?;
        }
        Ok(())
    }

    async fn finish(mut self, exit: Exit) -> TunnelResult<()> {
        let (reason, result) = match exit {
            Exit::Finished => (None, Ok(())),
            Exit::Rejected(code) => {
                info!(%code, "Server rejected stream flow");
                (
                    Some(FlowError::OpenRejected(code)),
                    Err(TunnelError::FlowOpenRejected(code)),
                )
            }
            Exit::Unopenable(e) => {
                warn!(error = %e, "Refusing stream flow, open cannot be framed");
                let code = OpenResultCode::InvalidParameter;
                (
                    Some(FlowError::OpenRejected(code)),
                    Err(TunnelError::FlowOpenRejected(code)),
                )
            }
            Exit::Failed(e) => {
                warn!(error = %e, "Stream flow I/O failed");
                let close = Message::Close {
                    flow_id: self.id,
                    mode: CloseMode::All,
                };
                let _ = self.ctx.outbound.send(close).await;
                (Some(FlowError::Io(e.to_string())), Err(TunnelError::Io(e)))
            }
            Exit::SessionGone => {
                debug!("Session ended under stream flow");
                (Some(FlowError::SessionClosed), Err(TunnelError::Closed))
            }
        };

        // Unregister first so that late server messages are discarded
        self.ctx.registry.unregister(self.id);
        self.flow.close(reason).await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::channel::{StreamPeerEvent, stream_pair};
    use crate::flow::{FlowRegistry, RegistryError};
    use crate::session::OutboundSender;
    use crate::tunnel::types::{Endpoint, FlowKind};
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;

    struct Harness {
        registry: FlowRegistry,
        id: FlowId,
        outbound: mpsc::Receiver<Message>,
        adapter: JoinHandle<TunnelResult<()>>,
    }

    /// Register a stream flow and start its adapter. `before_start` events are
    /// queued before the adapter runs.
    fn start(
        flow: impl StreamFlow,
        max_data_chunk: usize,
        before_start: Vec<FlowEvent>,
    ) -> Harness {
        let registry = FlowRegistry::new();
        let (handle, inbox) = registry
            .register(FlowKind::Stream, Some(flow.remote_endpoint()))
            .unwrap();
        for event in before_start {
            registry.deliver(handle.id, event).unwrap();
        }
        let (tx, outbound) = mpsc::channel(16);
        let ctx = FlowContext {
            registry: registry.clone(),
            outbound: OutboundSender::new(tx),
            max_data_chunk,
            max_message_size: 64 * 1024,
        };
        let adapter = tokio::spawn(run_stream_flow(handle.id, Box::new(flow), inbox, ctx));
        Harness {
            registry,
            id: handle.id,
            outbound,
            adapter,
        }
    }

    impl Harness {
        async fn next(&mut self) -> Message {
            tokio::time::timeout(Duration::from_secs(5), self.outbound.recv())
                .await
                .expect("timed out waiting for outbound message")
                .expect("outbound queue closed")
        }

        fn deliver(&self, event: FlowEvent) {
            self.registry.deliver(self.id, event).unwrap();
        }
    }

    #[test]
    fn test_adapter_future_can_be_spawned() {
        fn assert_send<T: Send + 'static>(_: T) {}

        let registry = FlowRegistry::new();
        let (flow, _peer) = stream_pair(Endpoint::new("a", 1), 4);
        let (handle, inbox) = registry.register(FlowKind::Stream, None).unwrap();
        let (tx, _outbound) = mpsc::channel(1);
        let ctx = FlowContext {
            registry: registry.clone(),
            outbound: OutboundSender::new(tx),
            max_data_chunk: 16,
            max_message_size: 1024,
        };
        assert_send(run_stream_flow(handle.id, Box::new(flow), inbox, ctx));
    }

    #[tokio::test]
    async fn test_open_then_bidirectional_half_close() {
        let (flow, mut peer) = stream_pair(Endpoint::new("example.com", 443), 4);
        let mut h = start(flow, 1024, vec![]);

        assert_eq!(
            h.next().await,
            Message::Open {
                flow_id: h.id,
                endpoint: Endpoint::new("example.com", 443)
            }
        );
        assert_eq!(h.registry.lookup(h.id).unwrap().state, FlowState::Opening);

        h.deliver(FlowEvent::OpenResult(Ok(())));
        h.deliver(FlowEvent::Data(Bytes::from_static(b"hello")));
        h.deliver(FlowEvent::Close(CloseMode::Write));

        assert_eq!(
            peer.next_event().await,
            Some(StreamPeerEvent::Data(Bytes::from_static(b"hello")))
        );
        assert_eq!(peer.next_event().await, Some(StreamPeerEvent::ShutdownWrite));

        // Our half is still open after the server finished sending
        peer.send(&b"request"[..]).await.unwrap();
        assert_eq!(
            h.next().await,
            Message::Data {
                flow_id: h.id,
                payload: Bytes::from_static(b"request")
            }
        );

        peer.finish();
        assert_eq!(
            h.next().await,
            Message::Close {
                flow_id: h.id,
                mode: CloseMode::Write
            }
        );
        assert_eq!(peer.next_event().await, Some(StreamPeerEvent::Closed(None)));
        assert!(h.adapter.await.unwrap().is_ok());
        assert_eq!(h.registry.lookup(h.id), Err(RegistryError::NotFound(h.id)));
    }

    #[tokio::test]
    async fn test_reads_are_split_into_chunks() {
        let (flow, peer) = stream_pair(Endpoint::new("a", 1), 4);
        let mut h = start(flow, 4, vec![FlowEvent::OpenResult(Ok(()))]);
        assert!(matches!(h.next().await, Message::Open { .. }));

        peer.send(&b"0123456789"[..]).await.unwrap();
        let mut chunks = Vec::new();
        for _ in 0..3 {
            match h.next().await {
                Message::Data { payload, .. } => chunks.push(payload),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(chunks, vec!["0123", "4567", "89"]);
    }

    #[tokio::test]
    async fn test_rejected_open_closes_flow_with_code() {
        let (flow, mut peer) = stream_pair(Endpoint::new("nowhere.invalid", 80), 4);
        let mut h = start(
            flow,
            1024,
            vec![FlowEvent::OpenResult(Err(OpenResultCode::NoSuchHost))],
        );
        assert!(matches!(h.next().await, Message::Open { .. }));

        let result = h.adapter.await.unwrap();
        assert!(matches!(
            result,
            Err(TunnelError::FlowOpenRejected(OpenResultCode::NoSuchHost))
        ));
        assert_eq!(
            peer.read_to_close().await,
            (
                Vec::new(),
                Some(FlowError::OpenRejected(OpenResultCode::NoSuchHost))
            )
        );
        assert!(h.registry.is_empty());
    }

    #[tokio::test]
    async fn test_no_reads_before_open_result() {
        let (flow, peer) = stream_pair(Endpoint::new("a", 1), 4);
        let mut h = start(flow, 1024, vec![]);
        assert!(matches!(h.next().await, Message::Open { .. }));

        peer.send(&b"early"[..]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.outbound.try_recv().is_err());

        h.deliver(FlowEvent::OpenResult(Ok(())));
        assert!(matches!(h.next().await, Message::Data { payload, .. } if payload == "early"));
    }

    #[tokio::test]
    async fn test_close_write_before_open_result_shuts_flow_after_open() {
        let (flow, mut peer) = stream_pair(Endpoint::new("a", 1), 4);
        let mut h = start(
            flow,
            1024,
            vec![
                FlowEvent::Data(Bytes::from_static(b"banner")),
                FlowEvent::Close(CloseMode::Write),
            ],
        );
        assert!(matches!(h.next().await, Message::Open { .. }));

        h.deliver(FlowEvent::OpenResult(Ok(())));
        assert_eq!(
            peer.next_event().await,
            Some(StreamPeerEvent::Data(Bytes::from_static(b"banner")))
        );
        assert_eq!(peer.next_event().await, Some(StreamPeerEvent::ShutdownWrite));
        assert_eq!(h.registry.lookup(h.id).unwrap().state, FlowState::Closing);

        peer.send(&b"reply"[..]).await.unwrap();
        assert!(matches!(h.next().await, Message::Data { payload, .. } if payload == "reply"));
        peer.finish();
        assert!(matches!(
            h.next().await,
            Message::Close {
                mode: CloseMode::Write,
                ..
            }
        ));
        assert!(h.adapter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_unframeable_open_is_refused_locally() {
        let (flow, mut peer) = stream_pair(Endpoint::new("h".repeat(70_000), 443), 4);
        let mut h = start(flow, 1024, vec![]);

        let result = h.adapter.await.unwrap();
        assert!(matches!(
            result,
            Err(TunnelError::FlowOpenRejected(OpenResultCode::InvalidParameter))
        ));
        assert_eq!(
            peer.read_to_close().await,
            (
                Vec::new(),
                Some(FlowError::OpenRejected(OpenResultCode::InvalidParameter))
            )
        );
        assert!(h.outbound.try_recv().is_err());
        assert!(h.registry.is_empty());
    }

    #[tokio::test]
    async fn test_suspend_pauses_reads_until_resume() {
        let (flow, peer) = stream_pair(Endpoint::new("a", 1), 4);
        let mut h = start(
            flow,
            1024,
            vec![FlowEvent::Suspend, FlowEvent::OpenResult(Ok(()))],
        );
        assert!(matches!(h.next().await, Message::Open { .. }));

        peer.send(&b"held"[..]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.outbound.try_recv().is_err());

        h.deliver(FlowEvent::Resume);
        assert!(matches!(h.next().await, Message::Data { payload, .. } if payload == "held"));
    }

    #[tokio::test]
    async fn test_io_error_aborts_flow() {
        let (flow, mut peer) = stream_pair(Endpoint::new("a", 1), 4);
        let mut h = start(flow, 1024, vec![FlowEvent::OpenResult(Ok(()))]);
        assert!(matches!(h.next().await, Message::Open { .. }));

        peer.fail(io::Error::new(io::ErrorKind::ConnectionReset, "reset by app"))
            .await
            .unwrap();
        assert_eq!(
            h.next().await,
            Message::Close {
                flow_id: h.id,
                mode: CloseMode::All
            }
        );
        let (_, reason) = peer.read_to_close().await;
        assert!(matches!(reason, Some(FlowError::Io(_))));
        assert!(matches!(h.adapter.await.unwrap(), Err(TunnelError::Io(_))));
    }

    #[tokio::test]
    async fn test_session_close_reaches_flow_once() {
        let (flow, mut peer) = stream_pair(Endpoint::new("a", 1), 4);
        let mut h = start(flow, 1024, vec![FlowEvent::OpenResult(Ok(()))]);
        assert!(matches!(h.next().await, Message::Open { .. }));

        assert_eq!(h.registry.close_all(), vec![h.id]);
        assert_eq!(
            peer.next_event().await,
            Some(StreamPeerEvent::Closed(Some(FlowError::SessionClosed)))
        );
        assert!(matches!(h.adapter.await.unwrap(), Err(TunnelError::Closed)));
        // The adapter dropped the flow; nothing else follows
        assert_eq!(peer.next_event().await, None);
    }
}
