//! Wire protocol of the tunnel.
//!
//! `framing` delimits messages on the byte stream, `message` defines the
//! typed messages carried in frames, and `settings` interprets the session
//! configuration payload.

pub mod framing;
pub mod message;
pub mod settings;

pub use framing::{Decoded, FrameError};
pub use message::{CloseMode, Message, MessageCodec, MessageType, OpenResultCode};
pub use settings::{DnsSettings, SettingsError, SettingsPolicy, TunnelSettings};
