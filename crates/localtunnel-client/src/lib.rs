//! localtunnel client library
//!
//! Exposes a local service through a localtunnel rendezvous server: resolve an
//! assignment, then keep a pool of raw TCP relay connections between the
//! server and the local port.

pub mod assignment;
pub mod config;
pub mod pool;
pub mod proxy;
pub mod relay;
pub mod session;

pub use assignment::{
    resolve_assignment, AssignmentClient, AssignmentError, AssignmentRecord, MAX_CONNECTION_COUNT,
};
pub use config::{
    ConfigError, ProxyConfig, TunnelConfig, TunnelConfigBuilder, DEFAULT_SERVER_URL,
    NEW_SUBDOMAIN,
};
pub use pool::{PoolCommand, PoolError, PoolSummary, TunnelPool};
pub use relay::{
    Direction, RelayCompletion, RelayConnection, RelayError, RelaySocketError, RelayState,
    RelayTarget, CHUNK_SIZE,
};
pub use session::SessionController;
