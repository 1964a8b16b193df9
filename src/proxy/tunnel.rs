//! HTTPS relay over an upstream CONNECT tunnel
//!
//! The upstream only understands CONNECT, so the relay opens a raw tunnel to
//! the target and re-originates its own TLS session and GET over it instead
//! of splicing client bytes.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use http::header::{ACCEPT, CONNECTION, HOST, USER_AGENT};
use http::{Method, Request, Response};
use http_body_util::{BodyExt, Empty};
use hyper::body::{Body, Frame, Incoming, SizeHint};
use hyper_util::rt::TokioIo;
use pin_project_lite::pin_project;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{debug, instrument};

use crate::error::{RelayError, Result};
use crate::models::ProxyEndpoint;
use crate::proxy::response::{strip_hop_by_hop, RelayBody};
use crate::proxy::target::RelayRequest;
use crate::proxy::transport::UpstreamTransport;

/// Stages of one tunnelled relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelStage {
    Connecting,
    TunnelEstablished,
    RequestSent,
    ResponseStreaming,
    Done,
    Failed,
}

impl TunnelStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelStage::Connecting => "connecting",
            TunnelStage::TunnelEstablished => "tunnel_established",
            TunnelStage::RequestSent => "request_sent",
            TunnelStage::ResponseStreaming => "response_streaming",
            TunnelStage::Done => "done",
            TunnelStage::Failed => "failed",
        }
    }

    /// Whether `next` is a legal successor of this stage
    pub fn can_advance_to(&self, next: TunnelStage) -> bool {
        use TunnelStage::*;
        matches!(
            (self, next),
            (Connecting, TunnelEstablished)
                | (TunnelEstablished, RequestSent)
                | (RequestSent, ResponseStreaming)
                | (ResponseStreaming, Done)
                | (Connecting | TunnelEstablished | RequestSent | ResponseStreaming, Failed)
        )
    }
}

impl std::fmt::Display for TunnelStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Tracks the current stage of a single tunnelled relay
#[derive(Debug)]
struct TunnelProgress {
    stage: TunnelStage,
}

impl TunnelProgress {
    fn new() -> Self {
        Self {
            stage: TunnelStage::Connecting,
        }
    }

    fn advance(&mut self, next: TunnelStage) {
        debug_assert!(
            self.stage.can_advance_to(next),
            "illegal tunnel transition {} -> {}",
            self.stage,
            next
        );
        debug!(from = %self.stage, to = %next, "Tunnel stage");
        self.stage = next;
    }
}

/// Builds the default client TLS config (webpki roots, HTTP/1.1 ALPN)
pub fn default_tls_config() -> Result<Arc<ClientConfig>> {
    let mut root_store = RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let mut config =
        ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|e| RelayError::InvalidConfig(format!("TLS setup failed: {}", e)))?
            .with_root_certificates(root_store)
            .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}

/// Relays `https` targets by re-originating TLS+HTTP over a CONNECT tunnel
#[derive(Clone)]
pub struct TlsTunnelRelay {
    timeout: Duration,
    user_agent: String,
    connector: TlsConnector,
}

impl TlsTunnelRelay {
    pub fn new(
        tls_config: Arc<ClientConfig>,
        timeout: Duration,
        user_agent: impl Into<String>,
    ) -> Self {
        Self {
            timeout,
            user_agent: user_agent.into(),
            connector: TlsConnector::from(tls_config),
        }
    }

    /// Relay `request` through a tunnel opened by `endpoint`.
    ///
    /// The CONNECT stage and the re-originated request stage each get the
    /// full timeout. A non-200 CONNECT reply is returned as
    /// [`RelayError::ConnectRejected`] and nothing further is sent.
    #[instrument(skip_all, fields(upstream = %endpoint.address(), target = %request.target))]
    pub async fn relay(
        &self,
        request: &RelayRequest,
        endpoint: &ProxyEndpoint,
    ) -> Result<Response<RelayBody>> {
        let mut progress = TunnelProgress::new();

        match self.run(request, endpoint, &mut progress).await {
            Ok(response) => Ok(response),
            Err(e) => {
                debug!(stage = %progress.stage, error = %e, "Tunnel relay failed");
                progress.advance(TunnelStage::Failed);
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        request: &RelayRequest,
        endpoint: &ProxyEndpoint,
        progress: &mut TunnelProgress,
    ) -> Result<Response<RelayBody>> {
        let authority = request.connect_authority();

        let tunnel = tokio::time::timeout(self.timeout, async {
            let stream = UpstreamTransport::dial(endpoint).await?;
            UpstreamTransport::open_tunnel(stream, endpoint, &authority).await
        })
        .await
        .map_err(|_| RelayError::UpstreamTimeout)??;
        progress.advance(TunnelStage::TunnelEstablished);

        let server_name = ServerName::try_from(request.host().to_string())
            .map_err(|e| RelayError::Transport(format!("Invalid TLS server name: {}", e)))?;

        let response = tokio::time::timeout(self.timeout, async {
            let tls = self
                .connector
                .connect(server_name, tunnel)
                .await
                .map_err(|e| RelayError::Transport(format!("TLS handshake failed: {}", e)))?;

            let (mut sender, conn) =
                hyper::client::conn::http1::handshake(TokioIo::new(tls)).await?;

            // Spawn connection handler
            tokio::spawn(async move {
                if let Err(e) = conn.await {
                    debug!("Tunnel connection ended: {}", e);
                }
            });

            let outbound = Request::builder()
                .method(Method::GET)
                .uri(request.origin_form())
                .header(HOST, request.host_header())
                .header(ACCEPT, request.accept())
                .header(CONNECTION, "close")
                .header(USER_AGENT, self.user_agent.as_str())
                .body(Empty::<Bytes>::new())
                .map_err(|e| RelayError::Internal(format!("Failed to build request: {}", e)))?;

            let pending = sender.send_request(outbound);
            progress.advance(TunnelStage::RequestSent);
            pending
                .await
                .map_err(|e| RelayError::Transport(format!("Request failed: {}", e)))
        })
        .await
        .map_err(|_| RelayError::UpstreamTimeout)??;
        progress.advance(TunnelStage::ResponseStreaming);

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        debug!(status = %parts.status, "Origin responded through tunnel");

        let body = StagedBody {
            inner: body,
            stage: TunnelStage::ResponseStreaming,
        };
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

pin_project! {
    /// Response body that marks the tunnel done or failed when streaming ends
    struct StagedBody {
        #[pin]
        inner: Incoming,
        stage: TunnelStage,
    }
}

impl Body for StagedBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Bytes>, hyper::Error>>> {
        let this = self.project();
        let polled = this.inner.poll_frame(cx);

        match &polled {
            Poll::Ready(None) if *this.stage == TunnelStage::ResponseStreaming => {
                *this.stage = TunnelStage::Done;
                debug!(stage = %this.stage, "Tunnel stage");
            }
            Poll::Ready(Some(Err(e))) if *this.stage == TunnelStage::ResponseStreaming => {
                *this.stage = TunnelStage::Failed;
                debug!(stage = %this.stage, error = %e, "Tunnel stream aborted");
            }
            _ => {}
        }

        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
