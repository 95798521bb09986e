//! Shared utilities for integration tests.
#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

use http_transport::config::{ListenerConfiguration, SslConfig, TransportConfig};
use http_transport::handler::{DownstreamError, SourceHandler};
use http_transport::http::{IncomingRequest, OutgoingResponse};
use http_transport::services::TransportServices;
use http_transport::{HttpTransport, Shutdown};

/// Downstream answering `ok`, tagging each response with the request path.
/// Paths starting with `/slow` take 100ms.
#[derive(Default)]
pub struct TestHandler {
    pub calls: AtomicUsize,
}

#[async_trait]
impl SourceHandler for TestHandler {
    async fn on_request(&self, request: IncomingRequest) -> Result<OutgoingResponse, DownstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let path = request.target.path().to_string();
        if path.starts_with("/slow") {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Ok(OutgoingResponse::ok()
            .with_header("x-path".parse().unwrap(), path.parse().unwrap())
            .with_body("ok"))
    }
}

pub fn listener(port: u16) -> ListenerConfiguration {
    ListenerConfiguration {
        id: format!("listener-{}", port),
        host: "127.0.0.1".into(),
        port,
        ..Default::default()
    }
}

/// Start a transport serving `config` and wait until every listener accepts.
pub async fn start_transport(config: TransportConfig, handler: Arc<dyn SourceHandler>) -> Shutdown {
    let ports: Vec<u16> = config.listeners.iter().map(|l| l.port).collect();
    let services = Arc::new(TransportServices::new(&config.transport, config.request_size).unwrap());
    let transport = HttpTransport::with_handler(config, services, handler).unwrap();

    let shutdown = Shutdown::new();
    let server_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let _ = transport.run(server_shutdown).await;
    });

    for port in ports {
        wait_until_listening(port).await;
    }
    shutdown
}

pub async fn wait_until_listening(port: u16) {
    for _ in 0..100 {
        if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("transport never started listening on port {}", port);
}

/// Write `request` and collect everything the server sends until it closes
/// the connection (or resets it, or goes quiet for two seconds).
pub async fn raw_exchange(port: u16, request: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream.write_all(request).await.unwrap();
    read_until_close(&mut stream).await
}

pub async fn read_until_close(stream: &mut TcpStream) -> Vec<u8> {
    let mut received = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf)).await {
            Ok(Ok(0)) | Ok(Err(_)) | Err(_) => break,
            Ok(Ok(n)) => received.extend_from_slice(&buf[..n]),
        }
    }
    received
}

/// Self-signed `localhost` certificate written to `dir`.
pub fn write_tls_material(dir: &Path) -> SslConfig {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_path = dir.join("cert.pem");
    let key_path = dir.join("key.pem");
    std::fs::write(&cert_path, cert.serialize_pem().unwrap()).unwrap();
    std::fs::write(&key_path, cert.serialize_private_key_pem()).unwrap();

    SslConfig {
        cert_path: cert_path.to_string_lossy().into_owned(),
        key_path: key_path.to_string_lossy().into_owned(),
        cipher_suites: Vec::new(),
        protocols: Vec::new(),
        client_auth: Default::default(),
        trust_store_path: None,
    }
}

/// TLS connector trusting the certificate in `ssl` and offering `alpn`.
pub fn tls_connector(ssl: &SslConfig, alpn: &[&[u8]]) -> TlsConnector {
    let pem = std::fs::read(&ssl.cert_path).unwrap();
    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
        roots.add(cert.unwrap()).unwrap();
    }

    let provider = Arc::new(tokio_rustls::rustls::crypto::ring::default_provider());
    let mut config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    TlsConnector::from(Arc::new(config))
}

pub async fn tls_connect(
    port: u16,
    ssl: &SslConfig,
    alpn: &[&[u8]],
) -> tokio_rustls::client::TlsStream<TcpStream> {
    let tcp = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let name = ServerName::try_from("localhost").unwrap();
    tls_connector(ssl, alpn).connect(name, tcp).await.unwrap()
}

/// Start a transport with the downstream named in `config.handler`.
pub async fn start_configured_transport(config: TransportConfig) -> Shutdown {
    let ports: Vec<u16> = config.listeners.iter().map(|l| l.port).collect();
    let transport = HttpTransport::new(config).unwrap();

    let shutdown = Shutdown::new();
    let server_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let _ = transport.run(server_shutdown).await;
    });

    for port in ports {
        wait_until_listening(port).await;
    }
    shutdown
}

pub fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

pub async fn read_more(stream: &mut TcpStream, buf: &mut Vec<u8>) {
    let mut chunk = [0u8; 4096];
    let n = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut chunk))
        .await
        .expect("server went quiet")
        .unwrap();
    assert!(n > 0, "connection closed early");
    buf.extend_from_slice(&chunk[..n]);
}

pub const FRAME_DATA: u8 = 0x0;
pub const FRAME_HEADERS: u8 = 0x1;
pub const FRAME_SETTINGS: u8 = 0x4;
pub const FRAME_GOAWAY: u8 = 0x7;
pub const FLAG_ACK: u8 = 0x1;
pub const FLAG_END_STREAM: u8 = 0x1;

/// One HTTP/2 frame as read off the wire.
#[derive(Debug)]
pub struct Frame {
    pub kind: u8,
    pub flags: u8,
    pub stream_id: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn is_settings_ack(&self) -> bool {
        self.kind == FRAME_SETTINGS && self.flags & FLAG_ACK != 0
    }
}

/// Next frame from `stream`, using `buf` for bytes already read.
pub async fn read_frame(stream: &mut TcpStream, buf: &mut Vec<u8>) -> Frame {
    while buf.len() < 9 {
        read_more(stream, buf).await;
    }
    let len = ((buf[0] as usize) << 16) | ((buf[1] as usize) << 8) | buf[2] as usize;
    while buf.len() < 9 + len {
        read_more(stream, buf).await;
    }
    let frame = Frame {
        kind: buf[3],
        flags: buf[4],
        stream_id: u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) & 0x7fff_ffff,
        payload: buf[9..9 + len].to_vec(),
    };
    buf.drain(..9 + len);
    frame
}

/// Upgrade `stream` to h2c with a GET for `path`, then send the client
/// preface and an empty SETTINGS frame. Returns the bytes read past the 101.
pub async fn upgrade_to_h2c(stream: &mut TcpStream, path: &str) -> Vec<u8> {
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: h\r\nConnection: Upgrade, HTTP2-Settings\r\n\
Upgrade: h2c\r\nHTTP2-Settings: AAMAAABkAAQAAP__\r\n\r\n",
        path
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut buf = Vec::new();
    let head_end = loop {
        if let Some(pos) = find(&buf, b"\r\n\r\n") {
            break pos + 4;
        }
        read_more(stream, &mut buf).await;
    };
    let head = String::from_utf8_lossy(&buf[..head_end]).to_ascii_lowercase();
    assert!(head.starts_with("http/1.1 101"), "unexpected head: {}", head);
    assert!(head.contains("upgrade: h2c"));
    buf.drain(..head_end);

    let mut preface = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n".to_vec();
    preface.extend_from_slice(&[0, 0, 0, FRAME_SETTINGS, 0, 0, 0, 0, 0]);
    stream.write_all(&preface).await.unwrap();
    buf
}
