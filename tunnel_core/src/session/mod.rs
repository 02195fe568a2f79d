//! Tunnel session: one transport connection carrying every flow.
//!
//! A session task owns the connection and walks the states
//! `connecting → configuring → established → closing → closed`:
//!
//! - **connecting**: dial the server through the [`ClientTransport`]
//! - **configuring**: send `fetch-configuration` and wait for exactly one
//!   `configuration` response
//! - **established**: the connection is split. A reader task decodes inbound
//!   messages and routes them to their adapters by identifier while the
//!   session task writes queued outbound messages in submission order. Flow
//!   inboxes are unbounded, so reads never wait on a slow writer.
//! - **closing**: force-close every live flow, then release the transport
//!
//! Flow adapters never touch the connection. They queue messages through an
//! [`OutboundSender`] and receive events through their registry inbox.

use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, instrument, trace, warn};

use crate::flow::datagram::run_datagram_flow;
use crate::flow::stream::run_stream_flow;
use crate::flow::{ExternalFlow, FlowContext, FlowEvent, FlowRegistry};
use crate::proto::framing::Decoded;
use crate::proto::message::{CloseMode, Message, MessageCodec};
use crate::proto::settings::{SettingsPolicy, TunnelSettings};
use crate::transport::{
    ClientTransport, Connection, ConnectionReader, ConnectionWriter, TransportError,
};
use crate::tunnel::config::TunnelConfig;
use crate::tunnel::error::{TunnelError, TunnelResult};
use crate::tunnel::types::{SessionId, SessionState, SessionStats};

/// Queue of messages waiting for the session writer.
///
/// Messages are written in the order they were queued, across all flows.
#[derive(Debug, Clone)]
pub struct OutboundSender {
    tx: mpsc::Sender<Message>,
}

impl OutboundSender {
    pub(crate) fn new(tx: mpsc::Sender<Message>) -> Self {
        OutboundSender { tx }
    }

    /// Queue `message`, waiting while the queue is full.
    ///
    /// Fails with `Closed` once the session has stopped writing.
    pub async fn send(&self, message: Message) -> TunnelResult<()> {
        self.tx.send(message).await.map_err(|_| TunnelError::Closed)
    }
}

/// Progress reported by a session to its owner.
#[derive(Debug)]
pub enum SessionEvent {
    StateChanged(SessionState),
    /// Configuration accepted; flows may be admitted
    Established,
    /// Terminal; carries the error that ended the session, if any
    Closed(Option<TunnelError>),
}

struct SessionShared {
    id: SessionId,
    state: watch::Sender<SessionState>,
    stats: Mutex<SessionStats>,
    settings: OnceLock<TunnelSettings>,
}

impl SessionShared {
    fn stats(&self) -> MutexGuard<'_, SessionStats> {
        self.stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Shared handle to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<SessionShared>,
    registry: FlowRegistry,
    outbound: OutboundSender,
    cancel: CancellationToken,
    max_data_chunk: usize,
    max_message_size: usize,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    /// Watch state transitions.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    /// Configuration received from the server, once configured.
    pub fn settings(&self) -> Option<TunnelSettings> {
        self.shared.settings.get().cloned()
    }

    pub fn stats(&self) -> SessionStats {
        let mut stats = self.shared.stats().clone();
        stats.live_flows = self.registry.len();
        stats
    }

    pub fn registry(&self) -> &FlowRegistry {
        &self.registry
    }

    /// Ask the session to close. Returns immediately; completion is reported
    /// through [`SessionEvent::Closed`].
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Admit a new external flow.
    ///
    /// Returns `false` unless the session is established and the registry
    /// accepted the flow. On success an adapter task now owns the flow.
    pub fn admit(&self, flow: ExternalFlow) -> bool {
        let state = self.state();
        if state != SessionState::Established {
            debug!(session_id = %self.id(), %state, "Refusing flow, session not established");
            return false;
        }

        let kind = flow.kind();
        let (handle, inbox) = match self.registry.register(kind, flow.endpoint()) {
            Ok(registered) => registered,
            Err(e) => {
                warn!(session_id = %self.id(), error = %e, "Refusing flow");
                return false;
            }
        };

        let id = handle.id;
        let ctx = FlowContext {
            registry: self.registry.clone(),
            outbound: self.outbound.clone(),
            max_data_chunk: self.max_data_chunk,
            max_message_size: self.max_message_size,
        };
        let span = info_span!("session", session_id = %self.id());
        match flow {
            ExternalFlow::Stream(stream) => {
                tokio::spawn(
                    async move {
                        if let Err(e) = run_stream_flow(id, stream, inbox, ctx).await {
                            debug!(flow_id = %id, error = %e, "Stream flow ended with error");
                        }
                    }
                    .instrument(span),
                );
            }
            ExternalFlow::Datagram(datagram) => {
                tokio::spawn(
                    async move {
                        if let Err(e) = run_datagram_flow(id, datagram, inbox, ctx).await {
                            debug!(flow_id = %id, error = %e, "Datagram flow ended with error");
                        }
                    }
                    .instrument(span),
                );
            }
        }
        info!(session_id = %self.id(), flow_id = %id, %kind, "Admitted flow");
        true
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("registry", &self.registry)
            .finish()
    }
}

/// Start a session task. Progress is reported on `events`, ending with
/// exactly one [`SessionEvent::Closed`].
///
/// Must be called within a tokio runtime.
pub fn spawn_session(
    transport: Arc<dyn ClientTransport>,
    config: TunnelConfig,
    events: mpsc::UnboundedSender<SessionEvent>,
) -> SessionHandle {
    let (tx, rx) = mpsc::channel(config.outbound_queue_depth.max(1));
    let (state, _) = watch::channel(SessionState::Connecting);
    let shared = Arc::new(SessionShared {
        id: SessionId::new(),
        state,
        stats: Mutex::new(SessionStats::new()),
        settings: OnceLock::new(),
    });
    let registry = FlowRegistry::new();
    let cancel = CancellationToken::new();

    let handle = SessionHandle {
        shared: shared.clone(),
        registry: registry.clone(),
        outbound: OutboundSender::new(tx),
        cancel: cancel.clone(),
        max_data_chunk: config.max_data_chunk,
        max_message_size: config.max_frame_size,
    };

    let span = info_span!("session", session_id = %shared.id);
    let actor = SessionActor {
        encoder: MessageCodec::with_max_frame_size(config.max_frame_size),
        shared,
        config,
        transport,
        registry,
        outbound: rx,
        cancel,
        events,
    };
    tokio::spawn(actor.run().instrument(span));

    handle
}

struct SessionActor {
    shared: Arc<SessionShared>,
    config: TunnelConfig,
    transport: Arc<dyn ClientTransport>,
    registry: FlowRegistry,
    outbound: mpsc::Receiver<Message>,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<SessionEvent>,
    /// Encode side only; inbound bytes are decoded by [`Inbound`]
    encoder: MessageCodec,
}

impl SessionActor {
    async fn run(mut self) {
        let result = match self.connect().await {
            Ok(Some(conn)) => self.serve(conn).await,
            Ok(None) => {
                self.begin_closing();
                Ok(())
            }
            Err(e) => {
                self.begin_closing();
                Err(e)
            }
        };
        self.set_state(SessionState::Closed);

        match &result {
            Ok(()) => info!("Tunnel session closed"),
            Err(e) => warn!(error = %e, "Tunnel session failed"),
        }
        let _ = self.events.send(SessionEvent::Closed(result.err()));
    }

    /// Stop accepting outbound messages and force-close every live flow.
    fn begin_closing(&mut self) {
        self.set_state(SessionState::Closing);
        self.outbound.close();
        let closed = self.registry.close_all();
        debug!(flows_closed = closed.len(), "Closed live flows");
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.shared.state.send_replace(state);
        if previous == state {
            return;
        }
        self.shared.stats().set_state(state);
        debug!(from = %previous, to = %state, "Session state changed");
        let _ = self.events.send(SessionEvent::StateChanged(state));
    }

    /// `Ok(None)` when a stop arrived first.
    #[instrument(level = "debug", skip(self), fields(server = %self.config.server_address))]
    async fn connect(&mut self) -> TunnelResult<Option<Box<dyn Connection>>> {
        let transport = self.transport.clone();
        let address = self.config.server_address.clone();
        let connect_timeout = self.config.connect_timeout;

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                debug!("Stop requested while connecting");
                Ok(None)
            }
            attempt = tokio::time::timeout(connect_timeout, transport.connect(&address)) => match attempt {
                Ok(Ok(conn)) => {
                    info!("Transport connected");
                    Ok(Some(conn))
                }
                Ok(Err(e)) => Err(TunnelError::TransportUnavailable(e)),
                Err(_) => Err(TunnelError::TransportUnavailable(TransportError::Timeout(format!(
                    "no connection to {} within {:?}",
                    address, connect_timeout
                )))),
            },
        }
    }

    /// Configure, then run established until the session ends. The
    /// connection is released before returning.
    async fn serve(&mut self, mut conn: Box<dyn Connection>) -> TunnelResult<()> {
        let mut inbound = Inbound {
            shared: self.shared.clone(),
            registry: self.registry.clone(),
            codec: MessageCodec::with_max_frame_size(self.config.max_frame_size),
        };

        let configured = self.configure(conn.as_mut(), &mut inbound).await;
        let settings = match configured {
            Ok(Some(settings)) => settings,
            other => {
                self.begin_closing();
                if let Err(e) = conn.close().await {
                    debug!(error = %e, "Transport close failed");
                }
                return other.map(|_| ());
            }
        };
        info!(
            dns_servers = ?settings.dns_servers(),
            search_domains = ?settings.search_domains(),
            "Tunnel configured"
        );
        let _ = self.shared.settings.set(settings);

        self.set_state(SessionState::Established);
        let _ = self.events.send(SessionEvent::Established);

        let (reader, mut writer) = conn.split();
        let result = self.dispatch(inbound, reader, writer.as_mut()).await;
        self.begin_closing();
        if let Err(e) = writer.close().await {
            debug!(error = %e, "Transport close failed");
        }
        result
    }

    /// Send `fetch-configuration` and wait for the response. `Ok(None)` when
    /// a stop arrived first.
    async fn configure(
        &mut self,
        conn: &mut dyn Connection,
        inbound: &mut Inbound,
    ) -> TunnelResult<Option<TunnelSettings>> {
        self.set_state(SessionState::Configuring);
        let frame = self.encoder.encode(&Message::FetchConfiguration)?;
        conn.send_data(&frame).await.map_err(TunnelError::TransportLost)?;
        self.shared.stats().record_sent(frame.len());

        let timeout = self.config.configuration_timeout;
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            if let Some(settings) = inbound.take_configuration(&self.config.settings_policy)? {
                return Ok(Some(settings));
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!("Stop requested while configuring");
                    return Ok(None);
                }
                _ = &mut deadline => {
                    return Err(TunnelError::Timeout(format!(
                        "no configuration within {:?}",
                        timeout
                    )));
                }
                chunk = conn.recv_data() => inbound.absorb(chunk)?,
            }
        }
    }

    /// Run the reader task and drain the outbound queue until a stop, a
    /// transport failure or a protocol violation.
    async fn dispatch(
        &mut self,
        inbound: Inbound,
        reader: Box<dyn ConnectionReader>,
        writer: &mut dyn ConnectionWriter,
    ) -> TunnelResult<()> {
        let cancel = self.cancel.clone();
        let mut reader_task = tokio::spawn(inbound.run(reader).in_current_span());

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Stop requested");
                Ok(())
            }
            joined = &mut reader_task => match joined {
                Ok(result) => result,
                Err(e) => Err(TunnelError::TransportLost(TransportError::Receive(format!(
                    "reader task failed: {}",
                    e
                )))),
            },
            written = self.write_outbound(writer) => written,
        };
        reader_task.abort();
        result
    }

    /// Write queued messages in order until the queue closes.
    async fn write_outbound(&mut self, writer: &mut dyn ConnectionWriter) -> TunnelResult<()> {
        while let Some(message) = self.outbound.recv().await {
            self.write_message(writer, &message).await?;
        }
        Ok(())
    }

    async fn write_message(
        &mut self,
        writer: &mut dyn ConnectionWriter,
        message: &Message,
    ) -> TunnelResult<()> {
        let frame = match self.encoder.encode(message) {
            Ok(frame) => frame,
            Err(e) => return self.drop_unencodable(writer, message, e.into()).await,
        };
        self.send_frame(writer, &frame, message).await
    }

    /// A flow message that cannot be framed costs that flow, not the session.
    async fn drop_unencodable(
        &mut self,
        writer: &mut dyn ConnectionWriter,
        message: &Message,
        error: TunnelError,
    ) -> TunnelResult<()> {
        let Some(flow_id) = message.flow_id() else {
            return Err(error);
        };
        warn!(
            %flow_id,
            frame_type = %message.message_type(),
            error = %error,
            "Dropping unencodable message and closing its flow"
        );
        let _ = self.registry.deliver(flow_id, FlowEvent::Close(CloseMode::All));
        if matches!(message, Message::Open { .. }) {
            // The server never heard of this flow
            return Ok(());
        }
        let close = Message::Close {
            flow_id,
            mode: CloseMode::All,
        };
        let frame = self.encoder.encode(&close)?;
        self.send_frame(writer, &frame, &close).await
    }

    async fn send_frame(
        &mut self,
        writer: &mut dyn ConnectionWriter,
        frame: &[u8],
        message: &Message,
    ) -> TunnelResult<()> {
        writer
            .send_data(frame)
            .await
            .map_err(TunnelError::TransportLost)?;
        self.shared.stats().record_sent(frame.len());
        trace!(
            frame_type = %message.message_type(),
            flow_id = ?message.flow_id(),
            bytes = frame.len(),
            "Sent message"
        );
        Ok(())
    }
}

/// Inbound half of a session: decodes transport bytes and routes each
/// message to its flow.
struct Inbound {
    shared: Arc<SessionShared>,
    registry: FlowRegistry,
    codec: MessageCodec,
}

impl Inbound {
    /// Read until the connection fails or the server breaks the protocol.
    async fn run(mut self, mut reader: Box<dyn ConnectionReader>) -> TunnelResult<()> {
        // Messages that arrived in the same read as the configuration
        self.route_buffered()?;
        loop {
            let chunk = reader.recv_data().await;
            self.absorb(chunk)?;
            self.route_buffered()?;
        }
    }

    /// Feed one transport read into the codec.
    fn absorb(&mut self, chunk: Result<Option<Vec<u8>>, TransportError>) -> TunnelResult<()> {
        match chunk {
            Ok(Some(bytes)) => {
                self.shared.stats().record_bytes_received(bytes.len());
                self.codec.feed(&bytes);
                Ok(())
            }
            Ok(None) => Err(TunnelError::TransportLost(TransportError::Receive(
                "connection closed by server".to_string(),
            ))),
            Err(e) => Err(TunnelError::TransportLost(e)),
        }
    }

    /// Decode the next buffered message, which must be the configuration.
    fn take_configuration(
        &mut self,
        policy: &SettingsPolicy,
    ) -> TunnelResult<Option<TunnelSettings>> {
        match self.codec.next_message()? {
            Decoded::NeedMoreData => Ok(None),
            Decoded::Frame(Message::Configuration(json)) => {
                self.shared.stats().record_message_received();
                let settings = TunnelSettings::parse(&json)?;
                policy.check(&settings)?;
                Ok(Some(settings))
            }
            Decoded::Frame(other) => Err(TunnelError::ProtocolViolation(format!(
                "{} received before configuration",
                other.message_type()
            ))),
        }
    }

    fn route_buffered(&mut self) -> TunnelResult<()> {
        while let Decoded::Frame(message) = self.codec.next_message()? {
            self.shared.stats().record_message_received();
            self.route(message)?;
        }
        Ok(())
    }

    /// Hand one inbound message to its flow.
    fn route(&mut self, message: Message) -> TunnelResult<()> {
        let message_type = message.message_type();
        let (id, event) = match FlowEvent::from_message(message) {
            Some(routed) => routed,
            None => {
                return Err(TunnelError::ProtocolViolation(format!(
                    "unexpected {} from server",
                    message_type
                )));
            }
        };

        match self.registry.deliver(id, event) {
            Ok(()) => {
                trace!(flow_id = %id, frame_type = %message_type, "Routed message");
                Ok(())
            }
            Err(_) if self.registry.was_issued(id) => {
                // The flow closed on this side while the server was still sending
                debug!(flow_id = %id, frame_type = %message_type, "Discarding message for closed flow");
                self.shared.stats().record_discarded();
                Ok(())
            }
            Err(_) => Err(TunnelError::ProtocolViolation(format!(
                "{} for unknown flow {}",
                message_type, id
            ))),
        }
    }
}
