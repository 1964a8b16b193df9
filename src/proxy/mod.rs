//! Relay implementation
//!
//! This module provides the relay functionality including:
//! - Round-robin upstream pool
//! - Target resolution from the `url` query parameter
//! - Plain-HTTP relay through the upstream's forward proxying
//! - CONNECT tunnel with TLS re-origination for HTTPS targets

pub mod handler;
pub mod http_relay;
pub mod pool;
pub mod response;
pub mod server;
pub mod target;
pub mod transport;
pub mod tunnel;

#[cfg(test)]
pub(crate) mod test_support;

pub use handler::{Relay, RelayConfig};
pub use pool::UpstreamPool;
pub use response::{empty_body, full_body, RelayBody};
pub use server::ProxyServer;
pub use target::{TargetResolver, TargetScheme};
pub use tunnel::{default_tls_config, TunnelStage};
