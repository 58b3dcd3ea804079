//! Orchestration of the proxy fleet: concurrent start with partial
//! failure tolerated, concurrent bounded stop.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;

use crate::proxy::ProxyInstance;

/// Aggregate bound on winding down the whole fleet.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

pub struct ProxyManager {
    proxies: Vec<Arc<ProxyInstance>>,
    shutdown_timeout: Duration,
}

impl ProxyManager {
    pub fn new(proxies: Vec<Arc<ProxyInstance>>) -> Self {
        Self::with_shutdown_timeout(proxies, DEFAULT_SHUTDOWN_TIMEOUT)
    }

    pub fn with_shutdown_timeout(
        proxies: Vec<Arc<ProxyInstance>>,
        shutdown_timeout: Duration,
    ) -> Self {
        Self {
            proxies,
            shutdown_timeout,
        }
    }

    pub fn proxies(&self) -> &[Arc<ProxyInstance>] {
        &self.proxies
    }

    /// Start every instance concurrently. Individual failures are logged
    /// and tolerated; returns how many instances came up.
    pub async fn start_all(&self) -> usize {
        let mut tasks = JoinSet::new();
        for proxy in &self.proxies {
            let proxy = proxy.clone();
            tasks.spawn(async move {
                let node = proxy.node_name().to_string();
                (node, proxy.start().await)
            });
        }

        let mut started = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((node, Ok(()))) => {
                    started += 1;
                    tracing::info!(node = %node, "started proxy");
                }
                Ok((node, Err(e))) => {
                    tracing::error!(node = %node, error = %e, "failed to start proxy");
                }
                Err(e) => {
                    tracing::error!(error = %e, "proxy start task panicked");
                }
            }
        }
        started
    }

    /// Stop every instance concurrently. Each stop bounds itself; the
    /// fan-in is additionally bounded so shutdown never blocks
    /// indefinitely, even if an instance hangs past its own timeout.
    pub async fn stop_all(&self) {
        let mut tasks = JoinSet::new();
        for proxy in &self.proxies {
            let proxy = proxy.clone();
            tasks.spawn(async move {
                let node = proxy.node_name().to_string();
                (node, proxy.stop().await)
            });
        }

        let drain = async {
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((node, Ok(()))) => {
                        tracing::info!(node = %node, "proxy stopped cleanly");
                    }
                    Ok((node, Err(e))) => {
                        tracing::warn!(node = %node, error = %e, "proxy did not stop cleanly");
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "proxy stop task panicked");
                    }
                }
            }
        };

        match tokio::time::timeout(self.shutdown_timeout, drain).await {
            Ok(()) => tracing::info!("all proxies stopped"),
            Err(_) => tracing::warn!("timeout waiting for proxies to stop"),
        }
    }
}
