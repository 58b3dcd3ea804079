mod backend;
mod error;
mod loopback;
mod tls;

pub use backend::{NodeListener, NodeSession, NodeStream, TailnetBackend};
pub use error::TailnetError;
pub use loopback::LoopbackTailnet;
pub use tls::{self_signed_node_cert, server_config_from_pem};
