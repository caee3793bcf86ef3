//! Shared utilities for the end-to-end tests.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderValue, Request, Response};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use conduit::config::schema::SslOptions;
use conduit::config::ServerConfig;
use conduit::http::{FnDispatcher, HttpServer, ServerError};
use conduit::lifecycle::Shutdown;
use conduit::net::PemContextProvider;
use conduit::observability::{AccessLogEntry, AccessLogSink};
use conduit::pipeline::ConnectionInfo;
use conduit::security::ForwardedChain;
use conduit::Services;

/// Access sink that keeps entries for assertions.
#[derive(Debug, Default)]
pub struct CapturingAccessLog {
    entries: Mutex<Vec<AccessLogEntry>>,
}

impl CapturingAccessLog {
    pub fn entries(&self) -> Vec<AccessLogEntry> {
        self.entries.lock().unwrap().clone()
    }
}

impl AccessLogSink for CapturingAccessLog {
    fn log(&self, entry: &AccessLogEntry) {
        self.entries.lock().unwrap().push(entry.clone());
    }
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub shutdown: Shutdown,
    pub access: Arc<CapturingAccessLog>,
    pub handle: JoinHandle<Result<(), ServerError>>,
    pub reload: mpsc::UnboundedSender<ServerConfig>,
}

impl TestServer {
    pub async fn stop(self) {
        self.shutdown.trigger();
        self.handle.await.unwrap().unwrap();
    }
}

/// Echoes what the dispatcher saw, one `key=value` per line. `/big/<n>`
/// answers with `n` bytes.
pub async fn echo(request: Request<Bytes>) -> Response<Bytes> {
    if let Some(size) = request.uri().path().strip_prefix("/big/") {
        let size: usize = size.parse().unwrap_or(0);
        return Response::new(Bytes::from(vec![b'x'; size]));
    }

    let mut body = format!("method={}\npath={}\n", request.method(), request.uri().path());
    if let Some(info) = request.extensions().get::<ConnectionInfo>() {
        body.push_str(&format!("protocol={}\nsecure={}\n", info.protocol, info.secure));
    }
    if let Some(client) = request.extensions().get::<ForwardedChain>().and_then(ForwardedChain::client) {
        body.push_str(&format!("client={}\n", client));
    }
    if !request.body().is_empty() {
        body.push_str(&format!("body={}\n", String::from_utf8_lossy(request.body())));
    }
    let mut response = Response::new(Bytes::from(body));
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}

/// Starts a server on an ephemeral loopback port with the echo dispatcher.
pub async fn start(mut config: ServerConfig) -> TestServer {
    config.listener.bind_address = "127.0.0.1:0".to_string();
    config.listener.shutdown_timeout_secs = 5;

    let access = Arc::new(CapturingAccessLog::default());
    let services = Services::new(
        Arc::new(FnDispatcher(echo)),
        access.clone(),
        Arc::new(PemContextProvider::new()),
    );
    let server = HttpServer::bind(config, services).await.unwrap();
    let addr = server.local_addr();
    let shutdown = server.shutdown_handle();
    let (reload, reloads) = mpsc::unbounded_channel();
    let handle = tokio::spawn(server.run(Some(reloads)));

    TestServer {
        addr,
        shutdown,
        access,
        handle,
        reload,
    }
}

/// Writes `request`, half-closes, and reads until the server closes.
pub async fn exchange_bytes(addr: SocketAddr, request: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request).await.unwrap();
    stream.shutdown().await.unwrap();
    let mut out = Vec::new();
    stream.read_to_end(&mut out).await.unwrap();
    out
}

pub async fn exchange(addr: SocketAddr, request: &[u8]) -> String {
    String::from_utf8_lossy(&exchange_bytes(addr, request).await).into_owned()
}

/// Writes a self-signed `localhost` certificate to a fresh temp directory.
pub fn self_signed_ssl() -> SslOptions {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let dir: PathBuf = std::env::temp_dir().join(format!(
        "conduit-test-{}-{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::SeqCst)
    ));
    std::fs::create_dir_all(&dir).unwrap();

    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_path = dir.join("cert.pem");
    let key_path = dir.join("key.pem");
    std::fs::write(&cert_path, certified.cert.pem()).unwrap();
    std::fs::write(&key_path, certified.key_pair.serialize_pem()).unwrap();

    SslOptions {
        cert_path: Some(cert_path.to_string_lossy().into_owned()),
        key_path: Some(key_path.to_string_lossy().into_owned()),
        ..SslOptions::default()
    }
}

/// TLS connector that trusts any certificate and offers `alpn`.
pub fn tls_connector(alpn: &[&[u8]]) -> tokio_rustls::TlsConnector {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .unwrap()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert(provider)))
        .with_no_client_auth();
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    tokio_rustls::TlsConnector::from(Arc::new(config))
}

pub fn localhost() -> ServerName<'static> {
    ServerName::try_from("localhost").unwrap()
}

#[derive(Debug)]
struct AcceptAnyCert(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
