//! Plain-HTTP relay through an upstream's own forward proxying

use std::time::Duration;

use bytes::Bytes;
use http::header::{ACCEPT, CONTENT_TYPE, HOST, PROXY_AUTHORIZATION, USER_AGENT};
use http::{HeaderValue, Method, Request, Response};
use http_body_util::{BodyExt, Empty};
use hyper_util::rt::TokioIo;
use tracing::{debug, instrument};

use crate::error::{RelayError, Result};
use crate::models::ProxyEndpoint;
use crate::proxy::response::{strip_hop_by_hop, RelayBody};
use crate::proxy::target::RelayRequest;
use crate::proxy::transport::UpstreamTransport;

/// Forwards `http` targets as absolute-form GETs to the upstream proxy
#[derive(Debug, Clone)]
pub struct HttpRelay {
    timeout: Duration,
    user_agent: String,
}

impl HttpRelay {
    pub fn new(timeout: Duration, user_agent: impl Into<String>) -> Self {
        Self {
            timeout,
            user_agent: user_agent.into(),
        }
    }

    /// Relay `request` through `endpoint`, streaming the response body.
    ///
    /// The timeout covers dialing the upstream and receiving the response
    /// head; the body streams without a deadline.
    #[instrument(skip_all, fields(upstream = %endpoint.address(), target = %request.target))]
    pub async fn relay(
        &self,
        request: &RelayRequest,
        endpoint: &ProxyEndpoint,
    ) -> Result<Response<RelayBody>> {
        let response = tokio::time::timeout(self.timeout, self.send(request, endpoint))
            .await
            .map_err(|_| RelayError::UpstreamTimeout)??;

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        if !parts.headers.contains_key(CONTENT_TYPE) {
            parts.headers.insert(
                CONTENT_TYPE,
                HeaderValue::from_static(request.fallback_content_type()),
            );
        }

        debug!(status = %parts.status, "Upstream responded");
        Ok(Response::from_parts(parts, body.boxed()))
    }

    async fn send(
        &self,
        request: &RelayRequest,
        endpoint: &ProxyEndpoint,
    ) -> Result<Response<hyper::body::Incoming>> {
        let stream = UpstreamTransport::dial(endpoint).await?;

        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| RelayError::UpstreamConnect(format!("Handshake failed: {}", e)))?;

        // Spawn connection handler
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("Upstream connection ended: {}", e);
            }
        });

        // Absolute-form request line: the upstream fetches the target itself.
        let outbound = Request::builder()
            .method(Method::GET)
            .uri(request.target.as_str())
            .header(HOST, request.host_header())
            .header(USER_AGENT, self.user_agent.as_str())
            .header(ACCEPT, request.accept())
            .header(PROXY_AUTHORIZATION, endpoint.proxy_authorization())
            .body(Empty::<Bytes>::new())
            .map_err(|e| RelayError::Internal(format!("Failed to build request: {}", e)))?;

        sender
            .send_request(outbound)
            .await
            .map_err(|e| RelayError::Transport(format!("Request failed: {}", e)))
    }
}
