//! Command-line surface for the `lt` binary

use anyhow::{Context, Result};
use clap::Parser;
use localtunnel_client::{ProxyConfig, TunnelConfig, DEFAULT_SERVER_URL};
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const TYPICAL_USAGE: &str = "EXAMPLES:
  lt --port 8080
  lt -p 8080 -s myapp
  lt -p 8080 -u https://tunnel.example.com

ENVIRONMENT VARIABLES:
  LT_PORT       Local port to expose
  LT_SUBDOMAIN  Requested subdomain
  LT_SERVER     Rendezvous server url
  HTTP_PROXY    Reach the rendezvous server through this HTTP proxy";

/// lt - Expose a local port through a localtunnel server
#[derive(Parser, Debug)]
#[command(name = "lt")]
#[command(about = "Expose a local port through a localtunnel server")]
#[command(after_help = TYPICAL_USAGE)]
#[command(version)]
pub struct Cli {
    /// Local port to expose (0 - 65535)
    #[arg(short, long, env = "LT_PORT")]
    pub port: u16,

    /// Request this subdomain (default: let the server pick one)
    #[arg(short, long, env = "LT_SUBDOMAIN")]
    pub subdomain: Option<String>,

    /// Rendezvous server url
    #[arg(short = 'u', long = "url", env = "LT_SERVER", default_value = DEFAULT_SERVER_URL)]
    pub server_url: String,

    /// Host of the local service
    #[arg(long, default_value = "localhost")]
    pub local_host: String,

    /// Connect timeout for relay sockets, in seconds (default: none)
    #[arg(long, value_name = "SECONDS")]
    pub connect_timeout: Option<u64>,

    /// Log relay failures (implies --log-level debug)
    #[arg(short, long)]
    pub debug: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl Cli {
    /// Effective log level
    pub fn log_level(&self) -> &str {
        if self.debug {
            "debug"
        } else {
            &self.log_level
        }
    }

    /// Build the tunnel configuration; the proxy comes from `HTTP_PROXY`/`http_proxy`
    pub fn tunnel_config(&self) -> Result<TunnelConfig> {
        self.tunnel_config_with_proxy(ProxyConfig::from_env())
    }

    pub fn tunnel_config_with_proxy(&self, proxy: Option<ProxyConfig>) -> Result<TunnelConfig> {
        TunnelConfig::builder()
            .server_url(self.server_url.clone())
            .subdomain(self.subdomain.clone())
            .local_host(self.local_host.clone())
            .local_port(self.port)
            .debug(self.debug)
            .connect_timeout(self.connect_timeout.map(Duration::from_secs))
            .proxy(proxy)
            .build()
            .context("Invalid tunnel configuration")
    }
}

pub fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))
        .context("Failed to initialize logging filter")?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}
