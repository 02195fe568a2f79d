//! Tunnel lifecycle controller.
//!
//! The controller is the host's surface: `start`, `stop` and
//! `handle_new_flow`. It owns at most one session at a time and keeps one
//! completion slot for a pending start and one for a pending stop. A slot
//! holds a oneshot sender, so resolving consumes it and a completion can
//! never fire twice.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, instrument, warn};

use crate::flow::ExternalFlow;
use crate::proto::settings::TunnelSettings;
use crate::session::{SessionEvent, SessionHandle, spawn_session};
use crate::transport::ClientTransport;
use crate::tunnel::config::TunnelConfig;
use crate::tunnel::error::{TunnelError, TunnelResult};
use crate::tunnel::types::{SessionId, SessionState, SessionStats};

const EVENT_CHANNEL_DEPTH: usize = 64;

/// Notifications published to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelEvent {
    StateChanged(SessionState),
    /// The session ended with neither a start nor a stop waiting on it
    Cancelled { reason: String },
}

/// A pending start or stop.
struct Completion {
    tx: oneshot::Sender<TunnelResult<()>>,
}

impl Completion {
    fn new() -> (Self, oneshot::Receiver<TunnelResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Completion { tx }, rx)
    }

    fn resolve(self, result: TunnelResult<()>) {
        // The caller may have given up waiting
        let _ = self.tx.send(result);
    }
}

#[derive(Default)]
struct ControllerState {
    session: Option<SessionHandle>,
    pending_start: Option<Completion>,
    pending_stop: Option<Completion>,
    last_error: Option<String>,
}

fn lock(state: &Mutex<ControllerState>) -> MutexGuard<'_, ControllerState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Starts, stops and feeds one tunnel at a time.
pub struct TunnelController {
    transport: Arc<dyn ClientTransport>,
    state: Arc<Mutex<ControllerState>>,
    events: broadcast::Sender<TunnelEvent>,
}

impl TunnelController {
    pub fn new(transport: Arc<dyn ClientTransport>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_DEPTH);
        TunnelController {
            transport,
            state: Arc::new(Mutex::new(ControllerState::default())),
            events,
        }
    }

    /// Connect and configure a new session.
    ///
    /// Resolves once the session is established, or with the error that
    /// stopped it. A `stop` issued meanwhile resolves it with `Cancelled`.
    #[instrument(skip(self, config), fields(server = %config.server_address))]
    pub async fn start(&self, config: TunnelConfig) -> TunnelResult<()> {
        let pending = {
            let mut state = lock(&self.state);
            if state.pending_start.is_some() {
                return Err(TunnelError::AlreadyStarting);
            }
            if let Some(session) = &state.session {
                return Err(TunnelError::InvalidState(format!(
                    "session {} is {}",
                    session.id(),
                    session.state()
                )));
            }
            config.validate()?;

            let (completion, pending) = Completion::new();
            let (event_tx, event_rx) = mpsc::unbounded_channel();
            let session = spawn_session(self.transport.clone(), config, event_tx);
            info!(session_id = %session.id(), "Starting tunnel");

            tokio::spawn(watch_session(
                session.id(),
                self.state.clone(),
                self.events.clone(),
                event_rx,
            ));
            state.pending_start = Some(completion);
            state.last_error = None;
            state.session = Some(session);
            pending
        };

        pending.await.unwrap_or(Err(TunnelError::Closed))
    }

    /// Close the current session.
    ///
    /// Pre-empts a pending start. Resolves once every flow is closed and the
    /// transport is released: `Ok` for a clean stop, or the error the session
    /// had already run into.
    #[instrument(skip(self))]
    pub async fn stop(&self) -> TunnelResult<()> {
        let pending = {
            let mut state = lock(&self.state);
            if state.pending_stop.is_some() {
                return Err(TunnelError::AlreadyStopped);
            }
            let session = match &state.session {
                Some(session) => session.clone(),
                None => return Err(TunnelError::AlreadyStopped),
            };
            if let Some(start) = state.pending_start.take() {
                info!(session_id = %session.id(), "Stop cancels pending start");
                start.resolve(Err(TunnelError::Cancelled));
            }

            let (completion, pending) = Completion::new();
            state.pending_stop = Some(completion);
            info!(session_id = %session.id(), "Stopping tunnel");
            session.close();
            pending
        };

        pending.await.unwrap_or(Err(TunnelError::Closed))
    }

    /// Hand a newly intercepted flow to the tunnel.
    ///
    /// Returns `false` when no session is established; the host keeps
    /// ownership of nothing in either case, a refused flow is dropped.
    pub fn handle_new_flow(&self, flow: ExternalFlow) -> bool {
        let session = lock(&self.state).session.clone();
        match session {
            Some(session) => session.admit(flow),
            None => {
                debug!(?flow, "Refusing flow, no tunnel session");
                false
            }
        }
    }

    /// State of the current session; `Closed` when there is none.
    pub fn state(&self) -> SessionState {
        lock(&self.state)
            .session
            .as_ref()
            .map(SessionHandle::state)
            .unwrap_or(SessionState::Closed)
    }

    pub fn session_id(&self) -> Option<SessionId> {
        lock(&self.state).session.as_ref().map(SessionHandle::id)
    }

    /// Configuration of the current session, once it is established.
    pub fn configuration(&self) -> Option<TunnelSettings> {
        lock(&self.state)
            .session
            .as_ref()
            .and_then(SessionHandle::settings)
    }

    pub fn stats(&self) -> Option<SessionStats> {
        lock(&self.state).session.as_ref().map(SessionHandle::stats)
    }

    /// Error that ended the previous session, if it failed.
    pub fn last_error(&self) -> Option<String> {
        lock(&self.state).last_error.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.events.subscribe()
    }
}

impl std::fmt::Debug for TunnelController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelController")
            .field("state", &self.state())
            .finish()
    }
}

/// Resolve completions and publish events as one session progresses.
async fn watch_session(
    session_id: SessionId,
    state: Arc<Mutex<ControllerState>>,
    events: broadcast::Sender<TunnelEvent>,
    mut session_events: mpsc::UnboundedReceiver<SessionEvent>,
) {
    while let Some(event) = session_events.recv().await {
        match event {
            SessionEvent::StateChanged(session_state) => {
                let _ = events.send(TunnelEvent::StateChanged(session_state));
            }
            SessionEvent::Established => {
                let start = lock(&state).pending_start.take();
                if let Some(start) = start {
                    info!(%session_id, "Tunnel established");
                    start.resolve(Ok(()));
                }
            }
            SessionEvent::Closed(error) => {
                let (start, stop) = {
                    let mut guard = lock(&state);
                    if guard.session.as_ref().map(SessionHandle::id) == Some(session_id) {
                        guard.session = None;
                    }
                    guard.last_error = error.as_ref().map(ToString::to_string);
                    (guard.pending_start.take(), guard.pending_stop.take())
                };
                resolve_closed(session_id, error, start, stop, &events);
                return;
            }
        }
    }

    // The session task went away without reporting; treat it as a failure
    warn!(%session_id, "Session ended without reporting closure");
    let (start, stop) = {
        let mut guard = lock(&state);
        if guard.session.as_ref().map(SessionHandle::id) == Some(session_id) {
            guard.session = None;
        }
        (guard.pending_start.take(), guard.pending_stop.take())
    };
    resolve_closed(session_id, Some(TunnelError::Closed), start, stop, &events);
}

fn resolve_closed(
    session_id: SessionId,
    error: Option<TunnelError>,
    start: Option<Completion>,
    stop: Option<Completion>,
    events: &broadcast::Sender<TunnelEvent>,
) {
    match (start, stop) {
        (start, Some(stop)) => {
            if let Some(start) = start {
                start.resolve(Err(TunnelError::Cancelled));
            }
            stop.resolve(error.map_or(Ok(()), Err));
        }
        (Some(start), None) => {
            start.resolve(Err(error.unwrap_or(TunnelError::Closed)));
        }
        (None, None) => {
            let reason = error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "session closed".to_string());
            warn!(%session_id, %reason, "Tunnel cancelled");
            let _ = events.send(TunnelEvent::Cancelled { reason });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryTransport, TransportError};

    /// Run `watch_session` over `script` with the given slots pending.
    async fn watch(
        pending_start: Option<Completion>,
        pending_stop: Option<Completion>,
        script: Vec<SessionEvent>,
    ) -> broadcast::Receiver<TunnelEvent> {
        let state = Arc::new(Mutex::new(ControllerState {
            pending_start,
            pending_stop,
            ..ControllerState::default()
        }));
        let (events, subscriber) = broadcast::channel(8);
        let (tx, rx) = mpsc::unbounded_channel();
        for event in script {
            tx.send(event).unwrap();
        }
        drop(tx);
        watch_session(SessionId::new(), state, events, rx).await;
        subscriber
    }

    fn transport_lost() -> TunnelError {
        TunnelError::TransportLost(TransportError::Receive("reset".to_string()))
    }

    #[tokio::test]
    async fn test_completion_resolves_once() {
        let (completion, pending) = Completion::new();
        completion.resolve(Err(TunnelError::Cancelled));
        assert!(matches!(pending.await.unwrap(), Err(TunnelError::Cancelled)));
    }

    #[tokio::test]
    async fn test_pending_stop_gets_transport_error() {
        let (stop, stopped) = Completion::new();
        let mut events = watch(
            None,
            Some(stop),
            vec![SessionEvent::Closed(Some(transport_lost()))],
        )
        .await;
        assert!(matches!(
            stopped.await.unwrap(),
            Err(TunnelError::TransportLost(_))
        ));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_pending_start_gets_transport_error() {
        let (start, started) = Completion::new();
        watch(
            Some(start),
            None,
            vec![
                SessionEvent::StateChanged(SessionState::Configuring),
                SessionEvent::Closed(Some(transport_lost())),
            ],
        )
        .await;
        assert!(matches!(
            started.await.unwrap(),
            Err(TunnelError::TransportLost(_))
        ));
    }

    #[tokio::test]
    async fn test_unwatched_failure_is_published() {
        let mut events = watch(None, None, vec![SessionEvent::Closed(Some(transport_lost()))]).await;
        match events.recv().await.unwrap() {
            TunnelEvent::Cancelled { reason } => assert!(reason.contains("reset"), "{}", reason),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_silent_session_exit_fails_pending_stop() {
        let (stop, stopped) = Completion::new();
        watch(None, Some(stop), vec![]).await;
        assert!(matches!(stopped.await.unwrap(), Err(TunnelError::Closed)));
    }

    #[tokio::test]
    async fn test_stop_without_session() {
        let controller = TunnelController::new(Arc::new(MemoryTransport::unreachable()));
        assert!(matches!(
            controller.stop().await,
            Err(TunnelError::AlreadyStopped)
        ));
        assert_eq!(controller.state(), SessionState::Closed);
        assert!(controller.configuration().is_none());
    }

    #[tokio::test]
    async fn test_start_with_unreachable_transport() {
        let controller = TunnelController::new(Arc::new(MemoryTransport::unreachable()));
        let result = controller.start(TunnelConfig::new("memory")).await;
        assert!(matches!(result, Err(TunnelError::TransportUnavailable(_))));
        assert_eq!(controller.state(), SessionState::Closed);
        assert!(controller.last_error().is_some());

        // Nothing left to stop
        assert!(matches!(
            controller.stop().await,
            Err(TunnelError::AlreadyStopped)
        ));
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let controller = TunnelController::new(Arc::new(MemoryTransport::unreachable()));
        let result = controller.start(TunnelConfig::new("")).await;
        assert!(matches!(result, Err(TunnelError::Config(_))));
        assert!(controller.session_id().is_none());
    }
}
