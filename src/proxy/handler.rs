//! Relay request handler
//!
//! Resolves the target, picks an upstream, dispatches by scheme and maps
//! every failure to a client response.

use std::sync::Arc;
use std::time::{Duration, Instant};

use http::{Method, Request, Response, Uri};
use rustls::ClientConfig;
use tracing::{info, instrument, warn};
use url::Url;

use crate::error::Result;
use crate::models::{ProxyEndpoint, RequestRecord};
use crate::proxy::http_relay::HttpRelay;
use crate::proxy::pool::{elapsed_ms, UpstreamPool};
use crate::proxy::response::{apply_cors, empty_body, RelayBody};
use crate::proxy::target::{
    RelayRequest, TargetResolver, TargetScheme, BROWSER_USER_AGENT, DEFAULT_IMAGE_HOSTS,
};
use crate::proxy::tunnel::{default_tls_config, TlsTunnelRelay};

/// Configuration for the relay handler
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Timeout for each upstream stage
    pub upstream_timeout: Duration,
    /// User-Agent sent on every outbound request
    pub user_agent: String,
    /// Host substrings that mark a target as an image
    pub image_hosts: Vec<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            upstream_timeout: Duration::from_secs(10),
            user_agent: BROWSER_USER_AGENT.to_string(),
            image_hosts: DEFAULT_IMAGE_HOSTS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Fetches targets through the upstream pool
pub struct Relay {
    pool: Arc<UpstreamPool>,
    config: RelayConfig,
    http: HttpRelay,
    tunnel: TlsTunnelRelay,
}

impl Relay {
    /// Create a relay trusting the bundled webpki roots
    pub fn new(pool: Arc<UpstreamPool>, config: RelayConfig) -> Result<Self> {
        Ok(Self::with_tls_config(pool, config, default_tls_config()?))
    }

    pub fn with_tls_config(
        pool: Arc<UpstreamPool>,
        config: RelayConfig,
        tls_config: Arc<ClientConfig>,
    ) -> Self {
        let http = HttpRelay::new(config.upstream_timeout, config.user_agent.clone());
        let tunnel = TlsTunnelRelay::new(
            tls_config,
            config.upstream_timeout,
            config.user_agent.clone(),
        );

        Self {
            pool,
            config,
            http,
            tunnel,
        }
    }

    pub fn pool(&self) -> &Arc<UpstreamPool> {
        &self.pool
    }

    /// Fetch `target` through the next upstream in rotation.
    ///
    /// This is the entry point for in-process callers; the response body
    /// streams straight from the upstream.
    pub async fn fetch(&self, target: &Url) -> Result<Response<RelayBody>> {
        let request = RelayRequest::new(target.clone(), &self.config.image_hosts)?;
        let endpoint = self.pool.next();

        let start = Instant::now();
        let result = match request.scheme {
            TargetScheme::Http => self.http.relay(&request, &endpoint).await,
            TargetScheme::Https => self.tunnel.relay(&request, &endpoint).await,
        };

        self.record(&request, &endpoint, &result, start.elapsed());
        result
    }

    /// Handle an inbound request; never fails, errors become responses
    #[instrument(skip(self, req), fields(method = %req.method(), uri = %req.uri()))]
    pub async fn handle<B>(&self, req: Request<B>) -> Response<RelayBody> {
        let mut response = if req.method() == Method::OPTIONS {
            Response::new(empty_body())
        } else {
            match self.relay_uri(req.uri()).await {
                Ok(response) => response,
                Err(e) => {
                    if e.is_client_error() {
                        info!("Rejected request: {}", e);
                    } else {
                        warn!("Relay failed: {}", e);
                    }
                    e.into_response()
                }
            }
        };

        apply_cors(response.headers_mut());
        response
    }

    async fn relay_uri(&self, uri: &Uri) -> Result<Response<RelayBody>> {
        let raw = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        let target = TargetResolver::resolve(raw)?;
        self.fetch(&target).await
    }

    fn record(
        &self,
        request: &RelayRequest,
        endpoint: &ProxyEndpoint,
        result: &Result<Response<RelayBody>>,
        elapsed: Duration,
    ) {
        let record = attempt_record(request, endpoint, result, elapsed);
        let timestamp = record.timestamp.to_rfc3339();

        if record.success {
            info!(
                upstream = %record.upstream_address,
                target = %record.target,
                status = record.status_code,
                elapsed_ms = record.response_time,
                success = true,
                timestamp = %timestamp,
                "Relayed request"
            );
        } else {
            warn!(
                upstream = %record.upstream_address,
                target = %record.target,
                status = record.status_code,
                elapsed_ms = record.response_time,
                success = false,
                timestamp = %timestamp,
                error = record.error_message.as_deref().unwrap_or_default(),
                "Relay attempt failed"
            );
        }

        self.pool.record(&record);
    }
}

/// Summarize one relay attempt; errors carry the status the client will see
fn attempt_record(
    request: &RelayRequest,
    endpoint: &ProxyEndpoint,
    result: &Result<Response<RelayBody>>,
    elapsed: Duration,
) -> RequestRecord {
    let (success, status_code, error_message) = match result {
        Ok(response) => (true, response.status().as_u16(), None),
        Err(e) => (false, e.status_code().as_u16(), Some(e.to_string())),
    };

    RequestRecord {
        upstream_id: endpoint.id,
        upstream_address: endpoint.address(),
        target: request.target.to_string(),
        scheme: request.scheme.as_str().to_string(),
        success,
        response_time: elapsed_ms(elapsed),
        status_code,
        error_message,
        timestamp: chrono::Utc::now(),
    }
}
