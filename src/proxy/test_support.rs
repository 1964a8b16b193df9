//! In-process mock upstreams and origins shared by relay tests

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

use crate::models::ProxyEndpoint;

/// Read a request or response head, up to and including the blank line
pub async fn read_head(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    while !buf.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).await.unwrap();
        if n == 0 {
            break;
        }
        buf.push(byte[0]);
    }
    String::from_utf8_lossy(&buf).into_owned()
}

pub fn endpoint_for(addr: SocketAddr) -> ProxyEndpoint {
    ProxyEndpoint::new(0, addr.ip().to_string(), addr.port(), "user:pass")
}

/// Upstream that answers every request with a canned response
///
/// Returns its address, the number of connections it accepted, and every
/// request head it received.
pub async fn spawn_canned_upstream(
    reply: &'static [u8],
) -> (SocketAddr, Arc<AtomicUsize>, Arc<Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let heads = Arc::new(Mutex::new(Vec::new()));

    let accepted_task = accepted.clone();
    let heads_task = heads.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            accepted_task.fetch_add(1, Ordering::SeqCst);
            let heads = heads_task.clone();
            tokio::spawn(async move {
                let head = read_head(&mut stream).await;
                heads.lock().unwrap().push(head);
                let _ = stream.write_all(reply).await;
                let _ = stream.shutdown().await;
            });
        }
    });

    (addr, accepted, heads)
}

/// Upstream that accepts connections and never answers
pub async fn spawn_silent_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    addr
}

/// Upstream that accepts CONNECT, then splices the tunnel to `origin`
/// regardless of the requested authority.
pub async fn spawn_connect_upstream(
    origin: SocketAddr,
) -> (SocketAddr, Arc<AtomicUsize>, Arc<Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let heads = Arc::new(Mutex::new(Vec::new()));

    let accepted_task = accepted.clone();
    let heads_task = heads.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut client, _)) = listener.accept().await else {
                return;
            };
            accepted_task.fetch_add(1, Ordering::SeqCst);
            let heads = heads_task.clone();
            tokio::spawn(async move {
                let head = read_head(&mut client).await;
                heads.lock().unwrap().push(head);

                let mut server = TcpStream::connect(origin).await.unwrap();
                client
                    .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
                    .await
                    .unwrap();
                let _ = tokio::io::copy_bidirectional(&mut client, &mut server).await;
            });
        }
    });

    (addr, accepted, heads)
}

/// Self-signed TLS origin for `server_name` serving one fixed response
pub struct TlsOrigin {
    pub addr: SocketAddr,
    pub cert_der: CertificateDer<'static>,
    pub requests: Arc<Mutex<Vec<Request<()>>>>,
}

impl TlsOrigin {
    pub async fn spawn(server_name: &str, content_type: &'static str, body: &'static [u8]) -> Self {
        let cert = rcgen::generate_simple_self_signed(vec![server_name.to_string()]).unwrap();
        let cert_der = cert.cert.der().clone();
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der()));

        let config = rustls::ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der.clone()], key)
        .unwrap();
        let acceptor = TlsAcceptor::from(Arc::new(config));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));

        let requests_task = requests.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let acceptor = acceptor.clone();
                let requests = requests_task.clone();
                tokio::spawn(async move {
                    let Ok(tls) = acceptor.accept(stream).await else {
                        return;
                    };
                    let service = service_fn(move |req: Request<Incoming>| {
                        let requests = requests.clone();
                        async move {
                            let (parts, _) = req.into_parts();
                            requests.lock().unwrap().push(Request::from_parts(parts, ()));
                            Ok::<_, std::convert::Infallible>(
                                Response::builder()
                                    .status(200)
                                    .header("Content-Type", content_type)
                                    .header("X-Origin", "tls")
                                    .body(Full::new(Bytes::from_static(body)))
                                    .unwrap(),
                            )
                        }
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(tls), service)
                        .await;
                });
            }
        });

        Self {
            addr,
            cert_der,
            requests,
        }
    }

    /// Client config trusting only this origin's certificate
    pub fn client_config(&self) -> Arc<rustls::ClientConfig> {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.add(self.cert_der.clone()).unwrap();

        let mut config = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(root_store)
        .with_no_client_auth();
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Arc::new(config)
    }
}
