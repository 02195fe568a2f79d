//! Configuration, errors and shared types of the tunnel client.
//!
//! The protocol machinery lives in [`crate::session`] and
//! [`crate::lifecycle`]; this module holds what they and the host share.

pub mod config;
pub mod error;
pub mod types;

pub use config::TunnelConfig;
pub use error::{TunnelError, TunnelResult};
pub use types::{Endpoint, FlowId, FlowKind, SessionId, SessionState, SessionStats};
