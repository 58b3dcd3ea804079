//! Test support for webtail end-to-end tests.

mod mock_service;
mod mock_tailnet;

pub use mock_service::{MockHttpService, RecordedRequest};
pub use mock_tailnet::MockTailnet;
