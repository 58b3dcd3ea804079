//! Loopback tailnet backend for development and tests.
//!
//! Stands in for a real overlay stack: every node gets a 127.0.0.1
//! listener with a freshly self-signed certificate instead of a tailnet
//! address with an issued one. Name collisions and empty credentials are
//! rejected the way a real control plane would reject them.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

use crate::backend::{NodeListener, NodeSession, NodeStream, TailnetBackend};
use crate::error::TailnetError;
use crate::tls::{self_signed_node_cert, server_config_from_pem};

/// Node names with a live session, shared between backend and sessions.
type NodeRegistry = Arc<Mutex<HashSet<String>>>;

/// Development backend that terminates TLS on loopback sockets.
pub struct LoopbackTailnet {
    tailnet_domain: Option<String>,
    active: NodeRegistry,
}

impl LoopbackTailnet {
    pub fn new(tailnet_domain: Option<String>) -> Arc<Self> {
        Arc::new(Self {
            tailnet_domain,
            active: Arc::new(Mutex::new(HashSet::new())),
        })
    }
}

#[async_trait]
impl TailnetBackend for LoopbackTailnet {
    async fn bring_up(
        &self,
        node_name: &str,
        auth_key: &str,
        ephemeral: bool,
    ) -> Result<Box<dyn NodeSession>, TailnetError> {
        if auth_key.is_empty() {
            return Err(TailnetError::Bringup {
                node: node_name.to_string(),
                reason: "auth key is empty".to_string(),
            });
        }

        {
            let mut active = self.active.lock();
            if !active.insert(node_name.to_string()) {
                return Err(TailnetError::Bringup {
                    node: node_name.to_string(),
                    reason: "node name already in use on this tailnet".to_string(),
                });
            }
        }

        let domain = self
            .tailnet_domain
            .as_ref()
            .map(|d| format!("{}.{}", node_name, d));

        let mut san_names = vec![node_name.to_string(), "localhost".to_string()];
        if let Some(d) = &domain {
            san_names.push(d.clone());
        }

        let acceptor = match self_signed_node_cert(&san_names)
            .and_then(|(cert_pem, key_pem)| server_config_from_pem(&cert_pem, &key_pem))
        {
            Ok(config) => TlsAcceptor::from(Arc::new(config)),
            Err(e) => {
                // Bringup never completed; free the name again.
                self.active.lock().remove(node_name);
                return Err(e);
            }
        };

        tracing::info!(node = %node_name, ephemeral, "loopback node online");

        Ok(Box::new(LoopbackSession {
            node_name: node_name.to_string(),
            ephemeral,
            domain,
            acceptor,
            registry: self.active.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

struct LoopbackSession {
    node_name: String,
    ephemeral: bool,
    domain: Option<String>,
    acceptor: TlsAcceptor,
    registry: NodeRegistry,
    closed: AtomicBool,
}

#[async_trait]
impl NodeSession for LoopbackSession {
    async fn listen_tls(&self, port: u16) -> Result<Box<dyn NodeListener>, TailnetError> {
        // The well-known port stays symbolic here: binding 443 on loopback
        // would need privileges, so the dev backend always takes an
        // ephemeral port and reports it.
        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .map_err(TailnetError::Listener)?;
        let local = listener.local_addr().map_err(TailnetError::Listener)?;

        tracing::info!(
            node = %self.node_name,
            requested_port = port,
            bound = %local,
            "loopback TLS listener ready"
        );

        Ok(Box::new(LoopbackListener {
            listener,
            acceptor: self.acceptor.clone(),
        }))
    }

    fn certified_domains(&self) -> Vec<String> {
        self.domain.clone().into_iter().collect()
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.registry.lock().remove(&self.node_name);
        if self.ephemeral {
            tracing::debug!(node = %self.node_name, "ephemeral node deregistered");
        } else {
            tracing::debug!(node = %self.node_name, "node session closed");
        }
    }
}

struct LoopbackListener {
    listener: TcpListener,
    acceptor: TlsAcceptor,
}

#[async_trait]
impl NodeListener for LoopbackListener {
    async fn accept(&self) -> std::io::Result<(Box<dyn NodeStream>, SocketAddr)> {
        let (stream, peer) = self.listener.accept().await?;
        let tls_stream = self.acceptor.accept(stream).await?;
        Ok((Box::new(tls_stream), peer))
    }

    fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}
