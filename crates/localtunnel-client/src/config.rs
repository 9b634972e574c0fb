//! Client configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;
use url::Url;

/// Public rendezvous server used when none is configured
pub const DEFAULT_SERVER_URL: &str = "http://localtunnel.me";

/// Path segment asking the server to pick any free subdomain
pub const NEW_SUBDOMAIN: &str = "?new";

/// Timeout for the assignment request
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Configuration errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid server url '{url}': {reason}")]
    InvalidServerUrl { url: String, reason: String },

    #[error("Invalid proxy url '{url}': {reason}")]
    InvalidProxy { url: String, reason: String },
}

/// HTTP proxy used to reach the rendezvous server with `CONNECT`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
}

impl ProxyConfig {
    /// Read the proxy from `HTTP_PROXY`, falling back to `http_proxy`.
    ///
    /// An unparseable value is logged and ignored.
    pub fn from_env() -> Option<Self> {
        let raw = std::env::var("HTTP_PROXY")
            .or_else(|_| std::env::var("http_proxy"))
            .ok()?;

        if raw.trim().is_empty() {
            return None;
        }

        match Self::parse(&raw) {
            Ok(proxy) => Some(proxy),
            Err(e) => {
                warn!("Ignoring proxy from environment: {}", e);
                None
            }
        }
    }

    /// Parse a proxy url such as `http://proxy.local:3128` or `proxy.local:3128`
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let raw = raw.trim();
        let with_scheme = if raw.contains("://") {
            raw.to_string()
        } else {
            format!("http://{}", raw)
        };

        let url = Url::parse(&with_scheme).map_err(|e| ConfigError::InvalidProxy {
            url: raw.to_string(),
            reason: e.to_string(),
        })?;

        let host = url.host_str().ok_or_else(|| ConfigError::InvalidProxy {
            url: raw.to_string(),
            reason: "missing host".to_string(),
        })?;

        let port = url
            .port_or_known_default()
            .ok_or_else(|| ConfigError::InvalidProxy {
                url: raw.to_string(),
                reason: "missing port".to_string(),
            })?;

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    /// `host:port` form used for dialing
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Tunnel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Rendezvous server base url
    pub server_url: String,
    /// Requested subdomain; `None` lets the server assign one
    pub subdomain: Option<String>,
    pub local_host: String,
    pub local_port: u16,
    /// Log contained relay failures
    pub debug: bool,
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,
    #[serde(default, with = "option_duration_secs")]
    pub connect_timeout: Option<Duration>,
    #[serde(default)]
    pub proxy: Option<ProxyConfig>,
}

/// Helper module for serializing Duration as seconds
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

mod option_duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&d.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = Option::<u64>::deserialize(deserializer)?;
        Ok(secs.map(Duration::from_secs))
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            subdomain: None,
            local_host: "localhost".to_string(),
            local_port: 0,
            debug: false,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            connect_timeout: None,
            proxy: None,
        }
    }
}

impl TunnelConfig {
    pub fn builder() -> TunnelConfigBuilder {
        TunnelConfigBuilder::default()
    }

    /// Host part of the server url; relay connections dial this host
    pub fn remote_host(&self) -> Result<String, ConfigError> {
        remote_host_of(&self.server_url)
    }
}

/// Extract the host that relay connections must dial from a server base url
pub fn remote_host_of(server_url: &str) -> Result<String, ConfigError> {
    let url = Url::parse(server_url).map_err(|e| ConfigError::InvalidServerUrl {
        url: server_url.to_string(),
        reason: e.to_string(),
    })?;

    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(ConfigError::InvalidServerUrl {
            url: server_url.to_string(),
            reason: format!("unsupported scheme '{}'", url.scheme()),
        });
    }

    url.host_str()
        .map(str::to_string)
        .ok_or_else(|| ConfigError::InvalidServerUrl {
            url: server_url.to_string(),
            reason: "missing host".to_string(),
        })
}

/// Builder for TunnelConfig
#[derive(Default)]
pub struct TunnelConfigBuilder {
    config: TunnelConfig,
}

impl TunnelConfigBuilder {
    pub fn server_url(mut self, url: impl Into<String>) -> Self {
        self.config.server_url = url.into();
        self
    }

    pub fn subdomain(mut self, subdomain: Option<String>) -> Self {
        self.config.subdomain = subdomain.filter(|s| !s.is_empty());
        self
    }

    pub fn local_host(mut self, host: impl Into<String>) -> Self {
        self.config.local_host = host.into();
        self
    }

    pub fn local_port(mut self, port: u16) -> Self {
        self.config.local_port = port;
        self
    }

    pub fn debug(mut self, enabled: bool) -> Self {
        self.config.debug = enabled;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn proxy(mut self, proxy: Option<ProxyConfig>) -> Self {
        self.config.proxy = proxy;
        self
    }

    pub fn build(self) -> Result<TunnelConfig, ConfigError> {
        remote_host_of(&self.config.server_url)?;
        Ok(self.config)
    }
}
