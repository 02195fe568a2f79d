//! Flow registry: the identifier → flow mapping of one session.
//!
//! This is the only state touched by more than one task (admission, inbound
//! dispatch and adapter teardown). Every access goes through one mutex and
//! no lock is held across an await point.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::FlowEvent;
use crate::tunnel::types::{Endpoint, FlowId, FlowKind};

/// Receiving end of one flow's event queue.
///
/// The queue is unbounded so the session reader never waits on a slow flow;
/// `suspend`/`resume` are the protocol's answer to backpressure.
pub type FlowInbox = mpsc::UnboundedReceiver<FlowEvent>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// No live flow has this identifier
    #[error("Flow {0} not found")]
    NotFound(FlowId),

    /// The session is tearing down and admits no new flows
    #[error("Flow registry is closed")]
    Closed,

    /// Every identifier of this session has been handed out
    #[error("Flow identifiers exhausted")]
    Exhausted,
}

/// Lifecycle state of a registered flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    /// Stream flow waiting for its open-result
    Opening,
    Open,
    /// Half closed in at least one direction
    Closing,
}

/// Snapshot of one registered flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowHandle {
    pub id: FlowId,
    pub kind: FlowKind,
    pub endpoint: Option<Endpoint>,
    pub state: FlowState,
}

struct FlowEntry {
    handle: FlowHandle,
    events: mpsc::UnboundedSender<FlowEvent>,
}

struct RegistryInner {
    flows: HashMap<FlowId, FlowEntry>,
    /// Highest identifier handed out so far; identifiers are never reused
    last_issued: u32,
    closed: bool,
}

/// Shared handle to the registry of one session.
#[derive(Clone)]
pub struct FlowRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl FlowRegistry {
    pub fn new() -> Self {
        FlowRegistry {
            inner: Arc::new(Mutex::new(RegistryInner {
                flows: HashMap::new(),
                last_issued: 0,
                closed: false,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        // A panic while holding the lock cannot leave the map half-updated:
        // every critical section is a single insert/remove.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a new flow under a fresh identifier.
    pub fn register(
        &self,
        kind: FlowKind,
        endpoint: Option<Endpoint>,
    ) -> Result<(FlowHandle, FlowInbox), RegistryError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(RegistryError::Closed);
        }
        let raw = inner
            .last_issued
            .checked_add(1)
            .ok_or(RegistryError::Exhausted)?;
        inner.last_issued = raw;

        let id = FlowId(raw);
        let state = match kind {
            FlowKind::Stream => FlowState::Opening,
            FlowKind::Datagram => FlowState::Open,
        };
        let handle = FlowHandle {
            id,
            kind,
            endpoint,
            state,
        };
        let (events, inbox) = mpsc::unbounded_channel();
        inner.flows.insert(
            id,
            FlowEntry {
                handle: handle.clone(),
                events,
            },
        );
        debug!(flow_id = %id, kind = %kind, live_flows = inner.flows.len(), "Registered flow");
        Ok((handle, inbox))
    }

    /// Snapshot of a live flow.
    pub fn lookup(&self, id: FlowId) -> Result<FlowHandle, RegistryError> {
        self.lock()
            .flows
            .get(&id)
            .map(|entry| entry.handle.clone())
            .ok_or(RegistryError::NotFound(id))
    }

    /// Remove a flow. Returns whether it was still registered; removing an
    /// already removed flow is a no-op.
    pub fn unregister(&self, id: FlowId) -> bool {
        let mut inner = self.lock();
        let removed = inner.flows.remove(&id).is_some();
        if removed {
            debug!(flow_id = %id, live_flows = inner.flows.len(), "Unregistered flow");
        }
        removed
    }

    pub fn set_state(&self, id: FlowId, state: FlowState) -> Result<(), RegistryError> {
        let mut inner = self.lock();
        let entry = inner.flows.get_mut(&id).ok_or(RegistryError::NotFound(id))?;
        entry.handle.state = state;
        Ok(())
    }

    /// Queue an event for a live flow.
    ///
    /// Fails with `NotFound` when the flow was unregistered or its adapter
    /// already stopped listening.
    pub fn deliver(&self, id: FlowId, event: FlowEvent) -> Result<(), RegistryError> {
        let inner = self.lock();
        let entry = inner.flows.get(&id).ok_or(RegistryError::NotFound(id))?;
        entry.events.send(event).map_err(|_| RegistryError::NotFound(id))
    }

    /// Whether `id` was ever handed out by this registry (live or released).
    pub fn was_issued(&self, id: FlowId) -> bool {
        id.get() != 0 && id.get() <= self.lock().last_issued
    }

    /// Refuse new flows, drop every live flow and tell each adapter to finish.
    ///
    /// Each adapter receives exactly one `SessionClosed` event. Returns the
    /// identifiers that were live.
    pub fn close_all(&self) -> Vec<FlowId> {
        let drained: Vec<(FlowId, FlowEntry)> = {
            let mut inner = self.lock();
            inner.closed = true;
            inner.flows.drain().collect()
        };

        let mut ids = Vec::with_capacity(drained.len());
        for (id, entry) in drained {
            if entry.events.send(FlowEvent::SessionClosed).is_err() {
                warn!(flow_id = %id, "Adapter already gone while force-closing flow");
            }
            ids.push(id);
        }
        ids.sort();
        if !ids.is_empty() {
            info!(flows = ids.len(), "Force-closed all live flows");
        }
        ids
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Identifiers of all live flows, ascending.
    pub fn ids(&self) -> Vec<FlowId> {
        let mut ids: Vec<FlowId> = self.lock().flows.keys().copied().collect();
        ids.sort();
        ids
    }
}

impl Default for FlowRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FlowRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("FlowRegistry")
            .field("live_flows", &inner.flows.len())
            .field("last_issued", &inner.last_issued)
            .field("closed", &inner.closed)
            .finish()
    }
}
