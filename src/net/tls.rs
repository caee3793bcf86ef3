//! TLS termination as a pipeline stage.
//!
//! # Responsibilities
//! - Load certificates and keys into a cached `rustls::ServerConfig`
//! - Drive a `rustls::ServerConnection` from chain bytes (sans-IO)
//! - Record ALPN and announce the finished handshake downstream
//! - Report handshake failures through the process-wide limiter
//!
//! # State Machine
//! ```text
//! Uninitialized ──first bytes──► Handshaking ──► Established
//!                                     │
//!                                     └──error──► Failed
//! ```

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ServerConfig, ServerConnection};

use crate::config::schema::SslOptions;
use crate::observability::{metrics, HandshakeLogLimiter};
use crate::pipeline::{Inbound, Outbound, PipelineError, PipelineEvent, Stage, StageContext};

pub const ALPN_H2: &[u8] = b"h2";
pub const ALPN_HTTP11: &[u8] = b"http/1.1";

const PLAINTEXT_METHODS: [&[u8]; 10] = [
    b"GET ", b"POST ", b"PUT ", b"HEAD ", b"DELETE ", b"OPTIONS ", b"PATCH ", b"TRACE ", b"CONNECT ", b"PRI ",
];

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("TLS handshake failed: {0}")]
    Handshake(rustls::Error),

    #[error("plaintext HTTP request received on a TLS port")]
    PlaintextOnSecurePort,

    #[error("TLS is enabled but no certificate and key are configured")]
    MissingContext,

    #[error("cannot load TLS material from {path}: {reason}")]
    Certificate { path: String, reason: String },

    #[error("invalid TLS configuration: {0}")]
    Config(rustls::Error),

    #[error("TLS I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Source of server TLS contexts.
pub trait TlsContextProvider: Send + Sync {
    fn context(&self, ssl: &SslOptions, host: &str, port: u16, http2: bool) -> Result<Arc<ServerConfig>, TlsError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ContextKey {
    cert_path: String,
    key_path: String,
    host: String,
    port: u16,
    http2: bool,
}

/// Loads PEM files named by [`SslOptions`] and caches the resulting contexts.
#[derive(Debug, Default)]
pub struct PemContextProvider {
    cache: Mutex<HashMap<ContextKey, Arc<ServerConfig>>>,
}

impl PemContextProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TlsContextProvider for PemContextProvider {
    fn context(&self, ssl: &SslOptions, host: &str, port: u16, http2: bool) -> Result<Arc<ServerConfig>, TlsError> {
        let (Some(cert_path), Some(key_path)) = (&ssl.cert_path, &ssl.key_path) else {
            return Err(TlsError::MissingContext);
        };
        let key = ContextKey {
            cert_path: cert_path.clone(),
            key_path: key_path.clone(),
            host: host.to_string(),
            port,
            http2,
        };

        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(config) = cache.get(&key) {
            return Ok(Arc::clone(config));
        }

        let cert_pem = read_file(cert_path)?;
        let key_pem = read_file(key_path)?;
        let config = Arc::new(server_config_from_pem(&cert_pem, &key_pem, http2)?);
        tracing::info!(cert_path = %cert_path, host, port, http2, "TLS context loaded");
        cache.insert(key, Arc::clone(&config));
        Ok(config)
    }
}

fn read_file(path: &str) -> Result<Vec<u8>, TlsError> {
    let mut buf = Vec::new();
    File::open(path)
        .and_then(|f| BufReader::new(f).read_to_end(&mut buf))
        .map_err(|e| TlsError::Certificate {
            path: path.to_string(),
            reason: e.to_string(),
        })?;
    Ok(buf)
}

/// Builds a server context from PEM encoded material.
pub fn server_config_from_pem(cert_pem: &[u8], key_pem: &[u8], http2: bool) -> Result<ServerConfig, TlsError> {
    let pem_error = |reason: String| TlsError::Certificate {
        path: "<pem>".to_string(),
        reason,
    };
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<Result<_, _>>()
        .map_err(|e| pem_error(e.to_string()))?;
    if certs.is_empty() {
        return Err(pem_error("no certificate found".to_string()));
    }
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|e| pem_error(e.to_string()))?
        .ok_or_else(|| pem_error("no private key found".to_string()))?;

    let mut config = ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(TlsError::Config)?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(TlsError::Config)?;
    config.alpn_protocols = if http2 {
        vec![ALPN_H2.to_vec(), ALPN_HTTP11.to_vec()]
    } else {
        vec![ALPN_HTTP11.to_vec()]
    };
    Ok(config)
}

/// True when `first` looks like the start of a plaintext HTTP request.
pub fn looks_like_plaintext_http(first: &[u8]) -> bool {
    PLAINTEXT_METHODS.iter().any(|m| first.starts_with(m))
}

enum TlsState {
    Uninitialized,
    Handshaking(Box<ServerConnection>),
    Established(Box<ServerConnection>),
    Failed,
}

impl std::fmt::Debug for TlsState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TlsState::Uninitialized => "Uninitialized",
            TlsState::Handshaking(_) => "Handshaking",
            TlsState::Established(_) => "Established",
            TlsState::Failed => "Failed",
        })
    }
}

/// Terminates TLS for the rest of the chain.
#[derive(Debug)]
pub struct TlsStage {
    config: Arc<ServerConfig>,
    state: TlsState,
    limiter: HandshakeLogLimiter,
    first: Option<Bytes>,
}

impl TlsStage {
    pub fn new(config: Arc<ServerConfig>, limiter: HandshakeLogLimiter) -> Self {
        Self {
            config,
            state: TlsState::Uninitialized,
            limiter,
            first: None,
        }
    }

    fn session(&mut self) -> Result<Option<&mut ServerConnection>, TlsError> {
        if let TlsState::Uninitialized = self.state {
            let session = ServerConnection::new(Arc::clone(&self.config)).map_err(TlsError::Config)?;
            self.state = TlsState::Handshaking(Box::new(session));
        }
        Ok(match &mut self.state {
            TlsState::Handshaking(s) | TlsState::Established(s) => Some(s.as_mut()),
            TlsState::Uninitialized | TlsState::Failed => None,
        })
    }

    fn is_handshaking(&self) -> bool {
        matches!(self.state, TlsState::Handshaking(_))
    }

    fn receive(&mut self, ctx: &mut StageContext<'_>, data: &[u8]) -> Result<(), TlsError> {
        let Some(session) = self.session()? else {
            return Ok(());
        };

        let mut plaintext = Vec::new();
        let mut cursor = data;
        let mut result = Ok(());
        while !cursor.is_empty() {
            if session.read_tls(&mut cursor)? == 0 {
                break;
            }
            if let Err(e) = session.process_new_packets() {
                result = Err(e);
                break;
            }
            read_plaintext(session, &mut plaintext)?;
        }
        flush(session, ctx)?;

        if let Err(e) = result {
            return Err(self.classify(ctx, e));
        }

        if let TlsState::Handshaking(s) = &self.state {
            if !s.is_handshaking() {
                let alpn = s.alpn_protocol().map(<[u8]>::to_vec);
                tracing::debug!(
                    connection_id = %ctx.connection().id(),
                    alpn = ?alpn.as_deref().map(String::from_utf8_lossy),
                    "TLS handshake complete"
                );
                ctx.connection_mut().set_alpn(alpn);
                ctx.fire_inbound(Inbound::Event(PipelineEvent::HandshakeComplete));
                if let TlsState::Handshaking(s) = std::mem::replace(&mut self.state, TlsState::Failed) {
                    self.state = TlsState::Established(s);
                }
            }
        }

        if !plaintext.is_empty() {
            ctx.fire_inbound(Inbound::Data(Bytes::from(plaintext)));
        }
        Ok(())
    }

    fn classify(&mut self, ctx: &mut StageContext<'_>, error: rustls::Error) -> TlsError {
        let handshaking = self.is_handshaking();
        self.state = TlsState::Failed;
        let conn = ctx.connection();

        if !handshaking {
            tracing::debug!(connection_id = %conn.id(), error = %error, "TLS session failed");
            return TlsError::Handshake(error);
        }

        let failure = if self.first.as_deref().is_some_and(looks_like_plaintext_http) {
            TlsError::PlaintextOnSecurePort
        } else {
            TlsError::Handshake(error)
        };
        metrics::tls_handshake_failed();
        self.limiter.report(&failure, conn.local_addr(), conn.peer_addr());
        failure
    }

    fn send(&mut self, ctx: &mut StageContext<'_>, plaintext: &[u8]) -> Result<(), PipelineError> {
        match &mut self.state {
            TlsState::Established(session) => {
                session.writer().write_all(plaintext).map_err(TlsError::from)?;
                flush(session, ctx)?;
                Ok(())
            }
            other => Err(PipelineError::Unexpected {
                stage: ctx.name(),
                message: format!("write while TLS is {:?}", other),
            }),
        }
    }
}

fn read_plaintext(session: &mut ServerConnection, out: &mut Vec<u8>) -> Result<(), TlsError> {
    let mut buf = [0u8; 16 * 1024];
    loop {
        match session.reader().read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) => return Err(e.into()),
        }
    }
}

fn flush(session: &mut ServerConnection, ctx: &mut StageContext<'_>) -> Result<(), TlsError> {
    let mut out = Vec::new();
    while session.wants_write() {
        session.write_tls(&mut out)?;
    }
    if !out.is_empty() {
        ctx.fire_outbound(Outbound::Data(Bytes::from(out)));
    }
    Ok(())
}

impl Stage for TlsStage {
    fn inbound(&mut self, ctx: &mut StageContext<'_>, msg: Inbound) -> Result<(), PipelineError> {
        match msg {
            Inbound::Data(data) => {
                if matches!(self.state, TlsState::Uninitialized) {
                    self.first = Some(data.clone());
                }
                let result = self.receive(ctx, &data);
                // Only a failing handshake looks at the first flight.
                if !self.is_handshaking() {
                    self.first = None;
                }
                result?;
            }
            other => ctx.fire_inbound(other),
        }
        Ok(())
    }

    fn outbound(&mut self, ctx: &mut StageContext<'_>, msg: Outbound) -> Result<(), PipelineError> {
        match msg {
            Outbound::Data(plaintext) => self.send(ctx, &plaintext)?,
            Outbound::Close => {
                if let TlsState::Established(session) = &mut self.state {
                    session.send_close_notify();
                    flush(session, ctx)?;
                }
                ctx.fire_outbound(Outbound::Close);
            }
            other => ctx.fire_outbound(other),
        }
        Ok(())
    }
}
