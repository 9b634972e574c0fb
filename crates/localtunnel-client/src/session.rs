//! Session orchestration: one assignment, one pool run, clean teardown

use crate::config::TunnelConfig;
use crate::pool::{PoolError, PoolSummary, TunnelPool};
use std::future::Future;
use std::sync::Arc;
use tracing::info;

/// Drives a tunnel session from the assignment handshake to pool teardown
pub struct SessionController {
    config: TunnelConfig,
    pool: Arc<TunnelPool>,
}

impl SessionController {
    pub fn new(config: TunnelConfig) -> Self {
        let pool = Arc::new(TunnelPool::new(config.clone()));
        Self { config, pool }
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    /// Shared handle to the pool, e.g. for stopping it from another task
    pub fn pool(&self) -> Arc<TunnelPool> {
        self.pool.clone()
    }

    /// Resolve the assignment and return the public url
    pub async fn connect(&self) -> Result<String, PoolError> {
        self.pool
            .resolve_url(self.config.subdomain.as_deref(), &self.config.server_url)
            .await
    }

    /// Run the pool until its connections finish or `shutdown` resolves.
    ///
    /// The pool is always torn down before returning.
    pub async fn serve<F>(&self, shutdown: F) -> Result<PoolSummary, PoolError>
    where
        F: Future<Output = ()>,
    {
        let start = self.pool.start(self.config.local_port);
        tokio::pin!(start);
        tokio::pin!(shutdown);

        let result = tokio::select! {
            result = &mut start => result,
            _ = &mut shutdown => {
                info!("Shutdown requested, stopping tunnel");
                self.pool.stop().await;
                start.await
            }
        };

        self.pool.stop().await;
        result
    }

    /// `connect` followed by `serve`
    pub async fn run<F>(&self, shutdown: F) -> Result<PoolSummary, PoolError>
    where
        F: Future<Output = ()>,
    {
        let url = self.connect().await?;
        info!("Tunnel available at {}", url);
        self.serve(shutdown).await
    }
}
