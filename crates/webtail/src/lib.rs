//! Webtail proxy library
//!
//! Core components for exposing backend endpoints as TLS-terminated
//! tailnet nodes. The binary wires these together; tests and embedders
//! can drive them directly with their own tailnet backend.

mod config;
mod forwarder;
mod manager;
mod proxy;

// Re-export public types
pub use config::{Config, ConfigError, ServiceSpec, TailnetSettings};
pub use forwarder::{ForwardError, RequestForwarder, RewriteError, RewriteResult};
pub use manager::{ProxyManager, DEFAULT_SHUTDOWN_TIMEOUT};
pub use proxy::{ProxyInstance, StartError, StopError, DEFAULT_STOP_TIMEOUT};
