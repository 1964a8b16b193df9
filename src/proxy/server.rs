//! Inbound relay server using hyper
//!
//! Accepts `GET /?url=...` requests and relays them through the upstream pool.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument};

use crate::config::RelayServerConfig;
use crate::error::{RelayError, Result};
use crate::proxy::handler::Relay;

/// Relay server
pub struct ProxyServer {
    config: RelayServerConfig,
    relay: Arc<Relay>,
}

impl ProxyServer {
    pub fn new(config: RelayServerConfig, relay: Arc<Relay>) -> Self {
        Self { config, relay }
    }

    /// Bind the configured address and serve until shutdown
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let addr: SocketAddr = self.config.addr().parse().map_err(|_| {
            RelayError::InvalidConfig(format!("Invalid relay address: {}", self.config.addr()))
        })?;

        let listener = TcpListener::bind(addr).await?;
        info!("Relay server listening on {}", addr);

        self.serve(listener, shutdown).await
    }

    /// Serve connections from an already bound listener
    pub async fn serve(
        &self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, client_addr)) => {
                            let relay = self.relay.clone();

                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(stream, client_addr, relay).await {
                                    debug!("Connection error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Relay server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Handle a single connection
    async fn handle_connection(
        stream: TcpStream,
        client_addr: SocketAddr,
        relay: Arc<Relay>,
    ) -> Result<()> {
        debug!(client = %client_addr, "Accepted connection");
        let io = TokioIo::new(stream);

        let service = service_fn(move |req: Request<Incoming>| {
            let relay = relay.clone();
            async move { Ok::<_, Infallible>(relay.handle(req).await) }
        });

        http1::Builder::new()
            .serve_connection(io, service)
            .await
            .map_err(|e| RelayError::Transport(e.to_string()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::handler::RelayConfig;
    use crate::proxy::pool::UpstreamPool;
    use crate::proxy::test_support::{endpoint_for, spawn_canned_upstream};
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::task::JoinHandle;

    struct Running {
        addr: SocketAddr,
        shutdown: watch::Sender<bool>,
        task: JoinHandle<Result<()>>,
    }

    async fn start(upstream: SocketAddr) -> Running {
        let pool = Arc::new(UpstreamPool::new(vec![endpoint_for(upstream)]).unwrap());
        let relay = Arc::new(Relay::new(pool, RelayConfig::default()).unwrap());
        let server = ProxyServer::new(RelayServerConfig::default(), relay);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(async move { server.serve(listener, rx).await });

        Running {
            addr,
            shutdown,
            task,
        }
    }

    async fn roundtrip(addr: SocketAddr, method: &str, target: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "{} {} HTTP/1.1\r\nHost: relay.test\r\nConnection: close\r\n\r\n",
            method, target
        );
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut raw = Vec::new();
        stream.read_to_end(&mut raw).await.unwrap();
        String::from_utf8_lossy(&raw).into_owned()
    }

    #[tokio::test]
    async fn test_options_preflight_gets_cors_and_no_body() {
        let (upstream, accepted, _) = spawn_canned_upstream(b"HTTP/1.1 200 OK\r\n\r\n").await;
        let running = start(upstream).await;

        let response = roundtrip(running.addr, "OPTIONS", "/").await;
        let lower = response.to_lowercase();

        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(lower.contains("access-control-allow-origin: *\r\n"));
        assert!(lower.contains("access-control-allow-methods: get, post, options\r\n"));
        assert!(lower.contains("access-control-allow-headers: content-type\r\n"));
        assert!(response.ends_with("\r\n\r\n"));
        assert_eq!(accepted.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_url_is_bad_request() {
        let (upstream, _, _) = spawn_canned_upstream(b"HTTP/1.1 200 OK\r\n\r\n").await;
        let running = start(upstream).await;

        let response = roundtrip(running.addr, "GET", "/fetch?other=1").await;

        assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(response
            .to_lowercase()
            .contains("access-control-allow-origin: *\r\n"));
        assert!(response.ends_with("missing url parameter"));
    }

    #[tokio::test]
    async fn test_relays_http_target_end_to_end() {
        let (upstream, _, heads) = spawn_canned_upstream(
            b"HTTP/1.1 201 Created\r\nContent-Type: text/plain\r\nContent-Length: 7\r\n\r\nrelayed",
        )
        .await;
        let running = start(upstream).await;

        let response = roundtrip(
            running.addr,
            "GET",
            "/?url=http%3A%2F%2Forigin.test%2Fpath%3Fa%3D1",
        )
        .await;

        assert!(response.starts_with("HTTP/1.1 201 Created\r\n"));
        assert!(response.to_lowercase().contains("content-type: text/plain\r\n"));
        assert!(response.ends_with("relayed"));
        assert!(heads.lock().unwrap()[0].starts_with("GET http://origin.test/path?a=1 HTTP/1.1"));
    }

    #[tokio::test]
    async fn test_shutdown_stops_accept_loop() {
        let (upstream, _, _) = spawn_canned_upstream(b"HTTP/1.1 200 OK\r\n\r\n").await;
        let running = start(upstream).await;

        running.shutdown.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(2), running.task)
            .await
            .unwrap()
            .unwrap();

        assert!(result.is_ok());
    }
}
