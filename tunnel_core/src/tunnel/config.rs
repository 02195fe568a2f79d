//! Runtime configuration of one tunnel session.

use std::time::Duration;

use crate::config::{Config as GlobalConfig, DATA_MESSAGE_OVERHEAD, MIN_FRAME_SIZE};
use crate::proto::framing::DEFAULT_MAX_FRAME_SIZE;
use crate::proto::settings::SettingsPolicy;
use crate::tunnel::error::{TunnelError, TunnelResult};

/// Configuration for a tunnel session, passed to
/// [`TunnelController::start`](crate::lifecycle::TunnelController::start).
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Server address handed to the transport
    pub server_address: String,

    /// Time allowed for the transport to connect
    pub connect_timeout: Duration,

    /// Time allowed for the configuration response once connected
    pub configuration_timeout: Duration,

    /// Largest message carried by one frame, in both directions
    pub max_frame_size: usize,

    /// Largest stream payload put in one `data` message
    pub max_data_chunk: usize,

    /// Outbound messages queued ahead of the transport writer
    pub outbound_queue_depth: usize,

    /// How strictly the configuration response is checked
    pub settings_policy: SettingsPolicy,
}

impl TunnelConfig {
    /// Create a configuration for `server_address` with default limits.
    pub fn new(server_address: impl Into<String>) -> Self {
        TunnelConfig {
            server_address: server_address.into(),
            connect_timeout: Duration::from_secs(10),
            configuration_timeout: Duration::from_secs(10),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_data_chunk: 16 * 1024,
            outbound_queue_depth: 256,
            settings_policy: SettingsPolicy::default(),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_configuration_timeout(mut self, timeout: Duration) -> Self {
        self.configuration_timeout = timeout;
        self
    }

    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    pub fn with_max_data_chunk(mut self, size: usize) -> Self {
        self.max_data_chunk = size;
        self
    }

    pub fn with_outbound_queue_depth(mut self, depth: usize) -> Self {
        self.outbound_queue_depth = depth;
        self
    }

    pub fn with_settings_policy(mut self, policy: SettingsPolicy) -> Self {
        self.settings_policy = policy;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> TunnelResult<()> {
        if self.server_address.trim().is_empty() {
            return Err(TunnelError::Config(
                "Server address cannot be empty".to_string(),
            ));
        }
        if self.connect_timeout.is_zero() || self.configuration_timeout.is_zero() {
            return Err(TunnelError::Config("Timeouts must be non-zero".to_string()));
        }
        if self.max_frame_size < MIN_FRAME_SIZE || self.max_frame_size > u32::MAX as usize {
            return Err(TunnelError::Config(format!(
                "Maximum frame size {} out of range",
                self.max_frame_size
            )));
        }
        let chunk_message = self.max_data_chunk.checked_add(DATA_MESSAGE_OVERHEAD);
        if self.max_data_chunk == 0 || chunk_message.is_none_or(|len| len > self.max_frame_size) {
            return Err(TunnelError::Config(format!(
                "Data chunk size {} does not fit a {} byte frame",
                self.max_data_chunk, self.max_frame_size
            )));
        }
        if self.outbound_queue_depth == 0 {
            return Err(TunnelError::Config(
                "Outbound queue depth must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Create a tunnel configuration from the global configuration.
    pub fn from_global_config(config: &GlobalConfig) -> TunnelResult<Self> {
        let server_address = config.client.server_address.clone().ok_or_else(|| {
            TunnelError::Config("Client configuration missing server_address".to_string())
        })?;

        let tunnel_config = TunnelConfig::new(server_address)
            .with_connect_timeout(config.client.connect_timeout())
            .with_configuration_timeout(config.client.configuration_timeout())
            .with_max_frame_size(config.protocol.max_frame_size)
            .with_max_data_chunk(config.protocol.max_data_chunk)
            .with_outbound_queue_depth(config.protocol.outbound_queue_depth)
            .with_settings_policy(SettingsPolicy {
                require_dns: config.settings.require_dns,
            });

        tunnel_config.validate()?;
        Ok(tunnel_config)
    }
}
