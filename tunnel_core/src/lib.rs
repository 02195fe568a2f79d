//! Client side of a flow-multiplexing tunnel.
//!
//! Many application flows (byte streams and datagram sessions) are carried
//! over one secured transport connection as framed, flow-tagged messages.
//! The host intercepts flows and hands them to a [`TunnelController`], which
//! admits them only once the session has fetched its configuration.

pub mod config;
pub mod flow;
pub mod lifecycle;
pub mod logging;
pub mod proto;
pub mod session;
pub mod transport;
pub mod tunnel;

// Re-export commonly used items for convenience
pub use config::{Config, ConfigManager};
pub use flow::{Datagram, DatagramFlow, ExternalFlow, FlowError, StreamFlow};
pub use lifecycle::{TunnelController, TunnelEvent};
pub use proto::framing;
pub use proto::settings::{SettingsPolicy, TunnelSettings};
pub use tunnel::{Endpoint, FlowId, FlowKind, SessionState, TunnelConfig, TunnelError, TunnelResult};
