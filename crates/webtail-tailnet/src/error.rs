use thiserror::Error;

/// Errors at the overlay-network boundary
#[derive(Debug, Error)]
pub enum TailnetError {
    #[error("failed to join tailnet as '{node}': {reason}")]
    Bringup { node: String, reason: String },

    #[error("failed to bind TLS listener: {0}")]
    Listener(#[from] std::io::Error),

    #[error("TLS setup failed: {0}")]
    Tls(String),
}
