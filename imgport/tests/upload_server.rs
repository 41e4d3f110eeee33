//! End-to-end upload-server tests over real sockets.
//!
//! Mirrors the production wiring: a bound listener, a hyper client,
//! and (for the TLS cases) throwaway CAs minted per test.

use std::sync::Arc;
use std::time::Duration;

use http::{Request, StatusCode};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper_util::rt::TokioIo;
use imgport::{ServerConfig, TlsMaterial, UploadServer};
use rcgen::{CertificateParams, DnType, KeyPair};
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

const UPLOAD_SYNC: &str = "/v1beta1/upload";
const UPLOAD_ASYNC: &str = "/v1beta1/upload-async";

// ============================================================================
// TEST FIXTURES
// ============================================================================

async fn start_server(server: &Arc<UploadServer>) -> (u16, JoinHandle<()>) {
    let run = {
        let server = Arc::clone(server);
        tokio::spawn(async move {
            server.run().await.expect("server run failed");
        })
    };
    for _ in 0..200 {
        let port = server.local_port();
        if port != 0 {
            return (port, run);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("server never bound a port");
}

fn post(path: &str, body: &[u8]) -> Request<Full<Bytes>> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header("host", "localhost")
        .body(Full::new(Bytes::from(body.to_vec())))
        .unwrap()
}

async fn send_plain(port: u16, request: Request<Full<Bytes>>) -> StatusCode {
    let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(async move {
        let _ = conn.await;
    });
    sender.send_request(request).await.unwrap().status()
}

struct TestCa {
    cert: rcgen::Certificate,
    key: KeyPair,
}

fn new_ca(cn: &str) -> TestCa {
    let key = KeyPair::generate().unwrap();
    let mut params = CertificateParams::new(Vec::new()).unwrap();
    params.distinguished_name.push(DnType::CommonName, cn);
    params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    TestCa {
        cert: params.self_signed(&key).unwrap(),
        key,
    }
}

fn issue(ca: &TestCa, cn: &str, sans: Vec<String>) -> (rcgen::Certificate, KeyPair) {
    let key = KeyPair::generate().unwrap();
    let mut params = CertificateParams::new(sans).unwrap();
    params.distinguished_name.push(DnType::CommonName, cn);
    let cert = params.signed_by(&key, &ca.cert, &ca.key).unwrap();
    (cert, key)
}

fn client_tls_config(
    server_ca: &TestCa,
    cert: &rcgen::Certificate,
    key: &KeyPair,
) -> Arc<rustls::ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    roots.add(server_ca.cert.der().clone()).unwrap();
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(
            vec![cert.der().clone()],
            rustls::pki_types::PrivatePkcs8KeyDer::from(key.serialize_der()).into(),
        )
        .unwrap();
    Arc::new(config)
}

async fn send_tls(
    port: u16,
    config: Arc<rustls::ClientConfig>,
    request: Request<Full<Bytes>>,
) -> StatusCode {
    let tcp = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let connector = tokio_rustls::TlsConnector::from(config);
    let server_name = rustls::pki_types::ServerName::try_from("localhost".to_string()).unwrap();
    let tls = connector.connect(server_name, tcp).await.unwrap();
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(tls))
        .await
        .unwrap();
    tokio::spawn(async move {
        let _ = conn.await;
    });
    sender.send_request(request).await.unwrap().status()
}

// ============================================================================
// PLAIN HTTP
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sync_upload_end_to_end() {
    let dir = TempDir::new().unwrap();
    let mut config = ServerConfig::new("127.0.0.1", 0, dir.path());
    config.scratch_dir = dir.path().join("scratch");
    let server = UploadServer::new(config);
    let (port, run) = start_server(&server).await;

    let body = b"streamed raw image bytes".to_vec();
    let status = send_plain(port, post(UPLOAD_SYNC, &body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(std::fs::read(dir.path().join("disk.img")).unwrap(), body);

    // A finished sync upload shuts the server down.
    tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("server did not stop after completion")
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_async_upload_end_to_end() {
    let dir = TempDir::new().unwrap();
    let mut config = ServerConfig::new("127.0.0.1", 0, dir.path());
    config.scratch_dir = dir.path().join("scratch");
    let server = UploadServer::new(config);
    let (port, run) = start_server(&server).await;

    // Readiness probe first.
    let head = Request::builder()
        .method("HEAD")
        .uri(UPLOAD_ASYNC)
        .header("host", "localhost")
        .body(Full::new(Bytes::new()))
        .unwrap();
    assert_eq!(send_plain(port, head).await, StatusCode::OK);

    let body = b"async streamed bytes".to_vec();
    let status = send_plain(port, post(UPLOAD_ASYNC, &body)).await;
    assert_eq!(status, StatusCode::OK);

    // The background resume finishes the pipeline and stops the server.
    tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("server did not stop after resume")
        .unwrap();
    assert_eq!(std::fs::read(dir.path().join("disk.img")).unwrap(), body);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_stops_idle_server() {
    let dir = TempDir::new().unwrap();
    let server = UploadServer::new(ServerConfig::new("127.0.0.1", 0, dir.path()));
    let (_, run) = start_server(&server).await;

    server.shutdown();
    tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("server did not stop on shutdown")
        .unwrap();
}

// ============================================================================
// MUTUAL TLS
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_mtls_client_identity() {
    let server_ca = new_ca("server-ca");
    let (server_cert, server_key) =
        issue(&server_ca, "localhost", vec!["localhost".to_string()]);
    let client_ca = new_ca("client-ca");

    let dir = TempDir::new().unwrap();
    let mut config = ServerConfig::new("127.0.0.1", 0, dir.path());
    config.scratch_dir = dir.path().join("scratch");
    config.tls = Some(TlsMaterial {
        key_pem: server_key.serialize_pem(),
        cert_pem: server_cert.pem(),
        client_ca_pem: client_ca.cert.pem(),
    });
    config.expected_client_name = Some("client".to_string());
    let server = UploadServer::new(config);
    let (port, run) = start_server(&server).await;

    // A certificate with the wrong Common Name passes the handshake
    // (same CA) but fails the identity check.
    let (foo_cert, foo_key) = issue(&client_ca, "foo", Vec::new());
    let foo_config = client_tls_config(&server_ca, &foo_cert, &foo_key);
    let status = send_tls(port, foo_config, post(UPLOAD_SYNC, b"data")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // The expected Common Name is accepted.
    let (client_cert, client_key) = issue(&client_ca, "client", Vec::new());
    let client_config = client_tls_config(&server_ca, &client_cert, &client_key);
    let status = send_tls(port, client_config, post(UPLOAD_SYNC, b"data")).await;
    assert_eq!(status, StatusCode::OK);

    tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("server did not stop after completion")
        .unwrap();
    assert_eq!(std::fs::read(dir.path().join("disk.img")).unwrap(), b"data");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_mtls_rejects_unknown_ca() {
    let server_ca = new_ca("server-ca");
    let (server_cert, server_key) =
        issue(&server_ca, "localhost", vec!["localhost".to_string()]);
    let client_ca = new_ca("client-ca");
    let rogue_ca = new_ca("rogue-ca");

    let dir = TempDir::new().unwrap();
    let mut config = ServerConfig::new("127.0.0.1", 0, dir.path());
    config.tls = Some(TlsMaterial {
        key_pem: server_key.serialize_pem(),
        cert_pem: server_cert.pem(),
        client_ca_pem: client_ca.cert.pem(),
    });
    config.expected_client_name = Some("client".to_string());
    let server = UploadServer::new(config);
    let (port, _run) = start_server(&server).await;

    // A client certificate from a different CA never completes the
    // exchange.
    let (rogue_cert, rogue_key) = issue(&rogue_ca, "client", Vec::new());
    let rogue_config = client_tls_config(&server_ca, &rogue_cert, &rogue_key);

    let tcp = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let connector = tokio_rustls::TlsConnector::from(rogue_config);
    let server_name = rustls::pki_types::ServerName::try_from("localhost".to_string()).unwrap();
    let result = async {
        let tls = connector.connect(server_name, tcp).await?;
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(tls)).await?;
        tokio::spawn(async move {
            let _ = conn.await;
        });
        let response = sender.send_request(post(UPLOAD_SYNC, b"data")).await?;
        Ok::<_, Box<dyn std::error::Error>>(response.status())
    }
    .await;
    assert!(result.is_err(), "rogue client should be rejected");

    server.shutdown();
}
