//! Mock tailnet backend with scriptable failures.
//!
//! Sessions listen on plain loopback TCP (lifecycle tests never speak
//! TLS) and keep release accounting so tests can assert at-most-once
//! resource release.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::net::TcpListener;

use webtail_tailnet::{NodeListener, NodeSession, NodeStream, TailnetBackend, TailnetError};

pub struct MockTailnet {
    tailnet_domain: Option<String>,
    fail_bringup: RwLock<HashSet<String>>,
    fail_listen: RwLock<HashSet<String>>,
    hang_on_close: RwLock<HashSet<String>>,
    close_counts: Arc<RwLock<HashMap<String, usize>>>,
}

impl MockTailnet {
    /// Backend that certifies `<node>.mock.ts.net` for every node.
    pub fn new() -> Arc<Self> {
        Self::with_domain(Some("mock.ts.net"))
    }

    /// Backend that reports zero certified domains.
    pub fn without_domains() -> Arc<Self> {
        Self::with_domain(None)
    }

    pub fn with_domain(domain: Option<&str>) -> Arc<Self> {
        Arc::new(Self {
            tailnet_domain: domain.map(str::to_string),
            fail_bringup: RwLock::new(HashSet::new()),
            fail_listen: RwLock::new(HashSet::new()),
            hang_on_close: RwLock::new(HashSet::new()),
            close_counts: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Make bring_up fail for this node.
    pub fn fail_bringup(&self, node: &str) {
        self.fail_bringup.write().insert(node.to_string());
    }

    /// Make listen_tls fail for this node.
    pub fn fail_listen(&self, node: &str) {
        self.fail_listen.write().insert(node.to_string());
    }

    /// Make this node's session hang forever in close().
    pub fn hang_on_close(&self, node: &str) {
        self.hang_on_close.write().insert(node.to_string());
    }

    /// How many times this node's session was closed.
    pub fn close_count(&self, node: &str) -> usize {
        self.close_counts.read().get(node).copied().unwrap_or(0)
    }
}

#[async_trait]
impl TailnetBackend for MockTailnet {
    async fn bring_up(
        &self,
        node_name: &str,
        auth_key: &str,
        _ephemeral: bool,
    ) -> Result<Box<dyn NodeSession>, TailnetError> {
        if auth_key.is_empty() {
            return Err(TailnetError::Bringup {
                node: node_name.to_string(),
                reason: "auth key is empty".to_string(),
            });
        }
        if self.fail_bringup.read().contains(node_name) {
            return Err(TailnetError::Bringup {
                node: node_name.to_string(),
                reason: "scripted bringup failure".to_string(),
            });
        }

        Ok(Box::new(MockSession {
            node_name: node_name.to_string(),
            domains: self
                .tailnet_domain
                .as_ref()
                .map(|d| vec![format!("{}.{}", node_name, d)])
                .unwrap_or_default(),
            fail_listen: self.fail_listen.read().contains(node_name),
            hang_on_close: self.hang_on_close.read().contains(node_name),
            close_counts: self.close_counts.clone(),
        }))
    }
}

struct MockSession {
    node_name: String,
    domains: Vec<String>,
    fail_listen: bool,
    hang_on_close: bool,
    close_counts: Arc<RwLock<HashMap<String, usize>>>,
}

#[async_trait]
impl NodeSession for MockSession {
    async fn listen_tls(&self, _port: u16) -> Result<Box<dyn NodeListener>, TailnetError> {
        if self.fail_listen {
            return Err(TailnetError::Listener(std::io::Error::new(
                std::io::ErrorKind::AddrInUse,
                "scripted listen failure",
            )));
        }

        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .map_err(TailnetError::Listener)?;
        Ok(Box::new(MockListener { listener }))
    }

    fn certified_domains(&self) -> Vec<String> {
        self.domains.clone()
    }

    async fn close(&self) {
        *self
            .close_counts
            .write()
            .entry(self.node_name.clone())
            .or_insert(0) += 1;

        if self.hang_on_close {
            std::future::pending::<()>().await;
        }
    }
}

struct MockListener {
    listener: TcpListener,
}

#[async_trait]
impl NodeListener for MockListener {
    async fn accept(&self) -> std::io::Result<(Box<dyn NodeStream>, SocketAddr)> {
        let (stream, peer) = self.listener.accept().await?;
        Ok((Box::new(stream), peer))
    }

    fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}
