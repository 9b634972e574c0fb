//! Tunnel pool
//!
//! Spawns `max_conn_count` relay connections for one assignment and waits
//! until they all complete or a stop command arrives. Connections that end
//! early are not restarted.

use crate::assignment::{
    AssignmentClient, AssignmentError, AssignmentRecord, MAX_CONNECTION_COUNT,
};
use crate::config::{remote_host_of, ConfigError, TunnelConfig};
use crate::relay::{dial, RelayCompletion, RelayConnection, RelayError, RelayTarget};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Tunnel pool errors
#[derive(Debug, Error)]
pub enum PoolError {
    #[error(transparent)]
    Assignment(#[from] AssignmentError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Cannot connect to local port {port}: {source}")]
    LocalPortUnreachable {
        port: u16,
        #[source]
        source: RelayError,
    },

    #[error("No assignment resolved; call resolve_url before start")]
    NoAssignment,
}

/// Control messages for a running pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolCommand {
    Stop,
}

/// Outcome of one `start` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSummary {
    /// Relay connections spawned
    pub spawned: usize,
    /// Completion signals counted before the wait ended
    pub completed: usize,
    /// The wait ended because of a stop command
    pub stopped: bool,
}

#[derive(Default)]
struct PoolState {
    assignment: Option<AssignmentRecord>,
    remote_host: Option<String>,
    local_port: Option<u16>,
    connections: Vec<RelayConnection>,
    stopping: bool,
}

/// Pool of parallel relay connections for one assignment
pub struct TunnelPool {
    config: TunnelConfig,
    state: Mutex<PoolState>,
    command_tx: mpsc::UnboundedSender<PoolCommand>,
    command_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<PoolCommand>>,
}

impl TunnelPool {
    /// Create a pool. Local host, proxy, timeouts and debug logging come from `config`.
    pub fn new(config: TunnelConfig) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        Self {
            config,
            state: Mutex::new(PoolState::default()),
            command_tx,
            command_rx: tokio::sync::Mutex::new(command_rx),
        }
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    pub fn assignment(&self) -> Option<AssignmentRecord> {
        self.state().assignment.clone()
    }

    pub fn local_port(&self) -> Option<u16> {
        self.state().local_port
    }

    /// Relay connections spawned by the last `start`
    pub fn connections(&self) -> Vec<RelayConnection> {
        self.state().connections.clone()
    }

    /// Request an assignment and store it. Returns the public url.
    pub async fn resolve_url(
        &self,
        requested_subdomain: Option<&str>,
        base_url: &str,
    ) -> Result<String, PoolError> {
        let remote_host = remote_host_of(base_url)?;
        let client = AssignmentClient::new(self.config.request_timeout)?;
        let record = client
            .resolve_assignment(requested_subdomain, base_url)
            .await?;
        let url = record.url.clone();

        self.assign(record, remote_host).await;
        Ok(url)
    }

    /// Install an assignment directly, replacing the previous one and
    /// forgetting its connections.
    pub async fn assign(&self, record: AssignmentRecord, remote_host: impl Into<String>) {
        {
            let mut state = self.state();
            state.assignment = Some(record);
            state.remote_host = Some(remote_host.into());
            state.connections.clear();
            state.stopping = false;
        }

        // A stop posted for the previous assignment must not end the next start.
        let mut command_rx = self.command_rx.lock().await;
        while command_rx.try_recv().is_ok() {}
    }

    /// Check the local service, spawn the relay connections and wait.
    ///
    /// Returns once every connection has completed or `stop` was called.
    pub async fn start(&self, local_port: u16) -> Result<PoolSummary, PoolError> {
        let (assignment, remote_host) = {
            let mut state = self.state();
            state.local_port = Some(local_port);
            match (state.assignment.clone(), state.remote_host.clone()) {
                (Some(assignment), Some(remote_host)) => (assignment, remote_host),
                _ => return Err(PoolError::NoAssignment),
            }
        };

        let pool_size = assignment.max_connection_count;
        if pool_size == 0 || pool_size > MAX_CONNECTION_COUNT {
            return Err(AssignmentError::Format(format!(
                "max_conn_count {} is outside 1..={}",
                pool_size, MAX_CONNECTION_COUNT
            ))
            .into());
        }

        self.check_local_port(local_port).await?;

        let target = RelayTarget::new(remote_host, assignment.remote_port, local_port)
            .with_local_host(self.config.local_host.clone())
            .with_proxy(self.config.proxy.clone())
            .with_connect_timeout(self.config.connect_timeout)
            .with_debug(self.config.debug);

        let (completion_tx, mut completion_rx) = mpsc::channel::<RelayCompletion>(pool_size);
        let mut command_rx = self.command_rx.lock().await;

        {
            let mut state = self.state();
            if state.stopping {
                info!("Tunnel pool stopped before start");
                return Ok(PoolSummary {
                    spawned: 0,
                    completed: 0,
                    stopped: true,
                });
            }

            state.connections = (0..pool_size)
                .map(|id| RelayConnection::new(id, target.clone()))
                .collect();

            for connection in &state.connections {
                let connection = connection.clone();
                let completion_tx = completion_tx.clone();
                tokio::spawn(async move { connection.relay(completion_tx).await });
            }
        }
        drop(completion_tx);

        info!(
            "Started {} relay connection(s) to {} for localhost:{}",
            pool_size,
            target.remote_address(),
            local_port
        );

        let mut completed = 0;
        let mut stopped = false;

        while completed < pool_size {
            tokio::select! {
                biased;
                command = command_rx.recv() => {
                    if let Some(PoolCommand::Stop) = command {
                        debug!("Tunnel pool received stop command");
                    }
                    stopped = true;
                    break;
                }
                completion = completion_rx.recv() => match completion {
                    Some(completion) => {
                        completed += 1;
                        debug!(
                            "Relay connection {} completed ({}/{}): established={}, in={}, out={}, errors={}",
                            completion.id,
                            completed,
                            pool_size,
                            completion.established,
                            completion.bytes_remote_to_local,
                            completion.bytes_local_to_remote,
                            completion.errors
                        );
                    }
                    None => break,
                },
            }
        }

        info!(
            "Tunnel pool finished: {}/{} connection(s) completed{}",
            completed,
            pool_size,
            if stopped { " (stopped)" } else { "" }
        );

        Ok(PoolSummary {
            spawned: pool_size,
            completed,
            stopped,
        })
    }

    /// Unblock `start`, stop every relay connection and wait for their sockets
    /// to close. Idempotent; safe before `start` or after it returned.
    pub async fn stop(&self) {
        let connections = {
            let mut state = self.state();
            state.stopping = true;
            state.connections.clone()
        };

        if self.config.debug {
            match self.local_port() {
                Some(port) => info!("Stopping tunnel for local port {}", port),
                None => info!("Stopping tunnel"),
            }
        }

        // Unbounded: posting never waits on the pool.
        let _ = self.command_tx.send(PoolCommand::Stop);

        for connection in &connections {
            connection.request_stop();
        }
        for connection in &connections {
            connection.closed().await;
        }

        debug!("Tunnel pool stopped {} connection(s)", connections.len());
    }

    async fn check_local_port(&self, port: u16) -> Result<(), PoolError> {
        let address = format!("{}:{}", self.config.local_host, port);
        let probe = dial(&address, self.config.connect_timeout)
            .await
            .map_err(|source| PoolError::LocalPortUnreachable { port, source })?;
        drop(probe);
        debug!("Local service reachable at {}", address);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(max: usize) -> AssignmentRecord {
        AssignmentRecord {
            assigned_id: "abc".to_string(),
            url: "https://abc.loca.lt".to_string(),
            remote_port: 9000,
            max_connection_count: max,
        }
    }

    #[tokio::test]
    async fn test_start_without_assignment() {
        let pool = TunnelPool::new(TunnelConfig::default());
        let result = pool.start(8080).await;
        assert!(matches!(result, Err(PoolError::NoAssignment)));
    }

    #[tokio::test]
    async fn test_stop_without_start() {
        let pool = TunnelPool::new(TunnelConfig::default());
        pool.stop().await;
        pool.stop().await;
        assert!(pool.connections().is_empty());
    }

    #[tokio::test]
    async fn test_assign_clears_previous_stop() {
        let pool = TunnelPool::new(TunnelConfig::default());
        pool.stop().await;
        pool.assign(record(2), "127.0.0.1").await;

        assert!(!pool.state().stopping);
        assert!(pool.command_rx.lock().await.try_recv().is_err());
        assert_eq!(pool.assignment(), Some(record(2)));
    }

    #[tokio::test]
    async fn test_start_rejects_pool_size_out_of_range() {
        let pool = TunnelPool::new(TunnelConfig::default());

        for max in [0, MAX_CONNECTION_COUNT + 1, 1 << 62] {
            pool.assign(record(max), "127.0.0.1").await;
            let result = pool.start(8080).await;
            assert!(matches!(
                result,
                Err(PoolError::Assignment(AssignmentError::Format(_)))
            ));
            assert!(pool.connections().is_empty());
        }
    }
}
