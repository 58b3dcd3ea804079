//! Traits describing what the proxy core needs from an overlay network:
//! bring a named node online, hand back a TLS-terminating listener, and
//! report the node's TLS-certified domain names.
//!
//! Implementations own identity provisioning, auth, and the encrypted
//! transport. The in-tree [`crate::LoopbackTailnet`] is a development
//! backend; a real overlay stack plugs in behind the same traits.

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::TailnetError;

/// Byte stream handed out by a node listener, already TLS-terminated.
pub trait NodeStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> NodeStream for T {}

/// A TLS-terminating listener bound on the overlay network.
#[async_trait]
pub trait NodeListener: Send + Sync {
    /// Accept one inbound connection and terminate TLS on it.
    async fn accept(&self) -> std::io::Result<(Box<dyn NodeStream>, SocketAddr)>;

    /// The locally observable address of the listener.
    fn local_addr(&self) -> std::io::Result<SocketAddr>;
}

/// A live node session on the overlay network.
#[async_trait]
pub trait NodeSession: Send + Sync {
    /// Bind a TLS-terminating listener on the node's `port`.
    async fn listen_tls(&self, port: u16) -> Result<Box<dyn NodeListener>, TailnetError>;

    /// The TLS-certified domain names the overlay network vouches for.
    /// May be empty when the network has not issued any certificate.
    fn certified_domains(&self) -> Vec<String>;

    /// End the session and release the node. Must be safe to call once
    /// per session; callers guard against repeats.
    async fn close(&self);
}

impl std::fmt::Debug for dyn NodeSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("NodeSession")
    }
}

/// Provisions node sessions on an overlay network.
#[async_trait]
pub trait TailnetBackend: Send + Sync {
    /// Bring the named node online using the shared credential.
    async fn bring_up(
        &self,
        node_name: &str,
        auth_key: &str,
        ephemeral: bool,
    ) -> Result<Box<dyn NodeSession>, TailnetError>;
}
