//! Session configuration delivered by the server.
//!
//! The `configuration` message carries a JSON object mapping setting names
//! to values. DNS settings are understood in two shapes:
//!
//! ```text
//! {"DNS": {"Servers": ["10.0.0.1"], "SearchDomains": ["corp.example"]}}
//! {"DNS": ["10.0.0.1"], "SearchDomains": ["corp.example"]}
//! ```
//!
//! Every other key is kept verbatim and can be read with [`TunnelSettings::get`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

pub const DNS_KEY: &str = "DNS";
pub const SERVERS_KEY: &str = "Servers";
pub const SEARCH_DOMAINS_KEY: &str = "SearchDomains";

/// Errors raised while interpreting a configuration payload.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// Payload is not a JSON object
    #[error("Configuration is not a JSON object: {0}")]
    Malformed(String),

    /// A known key has the wrong shape
    #[error("Configuration key {key} is malformed: {message}")]
    InvalidField { key: String, message: String },

    /// The deployment requires a setting that the server did not send
    #[error("Configuration is missing required setting {0}")]
    Missing(&'static str),
}

/// DNS settings pushed by the server.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DnsSettings {
    #[serde(rename = "Servers")]
    pub servers: Vec<String>,
    #[serde(rename = "SearchDomains", default, skip_serializing_if = "Vec::is_empty")]
    pub search_domains: Vec<String>,
}

impl DnsSettings {
    pub fn new(servers: Vec<String>) -> Self {
        DnsSettings {
            servers,
            search_domains: Vec::new(),
        }
    }

    pub fn with_search_domains(mut self, domains: Vec<String>) -> Self {
        self.search_domains = domains;
        self
    }
}

#[derive(Deserialize)]
struct DnsDictionary {
    #[serde(rename = "Servers")]
    servers: Option<Vec<String>>,
    #[serde(rename = "SearchDomains")]
    search_domains: Option<Vec<String>>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DnsField {
    Servers(Vec<String>),
    Dictionary(DnsDictionary),
}

/// Configuration received once per session.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TunnelSettings {
    dns: Option<DnsSettings>,
    raw: Map<String, Value>,
}

impl TunnelSettings {
    /// Build settings locally, e.g. for a test server.
    pub fn new(dns: Option<DnsSettings>) -> Self {
        let mut raw = Map::new();
        if let Some(dns) = &dns {
            if let Ok(value) = serde_json::to_value(dns) {
                raw.insert(DNS_KEY.to_string(), value);
            }
        }
        TunnelSettings { dns, raw }
    }

    /// Add an arbitrary setting.
    pub fn with_setting(mut self, key: impl Into<String>, value: Value) -> Self {
        self.raw.insert(key.into(), value);
        self
    }

    /// Interpret a `configuration` payload.
    ///
    /// Absent DNS data is not an error here; see [`SettingsPolicy`].
    pub fn parse(payload: &[u8]) -> Result<Self, SettingsError> {
        let value: Value = serde_json::from_slice(payload)
            .map_err(|e| SettingsError::Malformed(e.to_string()))?;
        let raw = match value {
            Value::Object(map) => map,
            other => {
                return Err(SettingsError::Malformed(format!(
                    "expected an object, got {}",
                    json_kind(&other)
                )));
            }
        };

        let dns = match raw.get(DNS_KEY) {
            None => None,
            Some(value) => {
                let field: DnsField =
                    serde_json::from_value(value.clone()).map_err(|e| SettingsError::InvalidField {
                        key: DNS_KEY.to_string(),
                        message: e.to_string(),
                    })?;
                match field {
                    DnsField::Servers(servers) => {
                        let search_domains = match raw.get(SEARCH_DOMAINS_KEY) {
                            None => Vec::new(),
                            Some(value) => serde_json::from_value(value.clone()).map_err(|e| {
                                SettingsError::InvalidField {
                                    key: SEARCH_DOMAINS_KEY.to_string(),
                                    message: e.to_string(),
                                }
                            })?,
                        };
                        Some(DnsSettings {
                            servers,
                            search_domains,
                        })
                    }
                    DnsField::Dictionary(dict) => dict.servers.map(|servers| DnsSettings {
                        servers,
                        search_domains: dict.search_domains.unwrap_or_default(),
                    }),
                }
            }
        };

        Ok(TunnelSettings { dns, raw })
    }

    /// Serialize to the payload of a `configuration` message.
    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(&self.raw).unwrap_or_else(|_| b"{}".to_vec())
    }

    pub fn dns(&self) -> Option<&DnsSettings> {
        self.dns.as_ref()
    }

    pub fn dns_servers(&self) -> &[String] {
        self.dns.as_ref().map(|d| d.servers.as_slice()).unwrap_or(&[])
    }

    pub fn search_domains(&self) -> &[String] {
        self.dns
            .as_ref()
            .map(|d| d.search_domains.as_slice())
            .unwrap_or(&[])
    }

    /// Raw value of any setting.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.raw.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.raw.keys()
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// How strictly a received configuration is checked.
///
/// The default is lenient: a configuration without DNS servers is accepted
/// with a warning because not every deployment pushes DNS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SettingsPolicy {
    /// Fail the start when the server sends no DNS servers
    #[serde(default)]
    pub require_dns: bool,
}

impl SettingsPolicy {
    pub fn strict() -> Self {
        SettingsPolicy { require_dns: true }
    }

    pub fn check(&self, settings: &TunnelSettings) -> Result<(), SettingsError> {
        if settings.dns_servers().is_empty() {
            if self.require_dns {
                return Err(SettingsError::Missing("DNS servers"));
            }
            warn!("Server configuration carries no DNS servers, continuing without DNS settings");
        }
        Ok(())
    }
}
