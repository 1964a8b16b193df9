//! Upstream Relay - rotating fetch relay
//!
//! Fetches a target URL on behalf of a caller through a pool of
//! authenticated upstream HTTP proxies.
//!
//! ## Features
//!
//! - Strict round-robin rotation across upstream proxies
//! - Plain-HTTP targets relayed as absolute-form proxy requests
//! - HTTPS targets re-originated over a CONNECT tunnel with TLS
//! - Streaming responses with permissive CORS
//! - Admin API exposing health and per-upstream counters

pub mod api;
pub mod config;
pub mod error;
pub mod models;
pub mod proxy;

pub use config::Config;
pub use error::{RelayError, Result};
pub use proxy::{ProxyServer, Relay, RelayConfig, UpstreamPool};
