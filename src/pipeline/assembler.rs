//! Builds the stage chain of a new connection.
//!
//! # Topologies
//! ```text
//! plaintext HTTP/1.1:
//!   buffer-bridge → crlf-guard → http-codec → chunk-logging → chunked-write
//!   → access-log → compression → response-headers → keep-alive → aggregator
//!   → normalizer → [forwarded] → dispatcher
//!
//! plaintext with HTTP/2 (prior knowledge or `Upgrade: h2c`):
//!   buffer-bridge → crlf-guard → h2-preface → http-codec → ... → keep-alive
//!   → h2c-upgrade → [forwarded] → dispatcher
//!   (h2-preface or h2c-upgrade swaps the HTTP/1.1 stages for the h2-bridge)
//!
//! secure:
//!   buffer-bridge → tls → alpn → dispatcher
//!   (alpn installs the HTTP/1.1 set or the h2-bridge after the handshake)
//! ```

use std::net::SocketAddr;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use crate::codec::bridge::BufferBridge;
use crate::codec::crlf::CrlfGuard;
use crate::codec::http1::Http1Codec;
use crate::config::schema::ListenerConfig;
use crate::config::PipelineConfig;
use crate::http::aggregate::Aggregator;
use crate::http::chunked_write::ChunkedWriteStage;
use crate::http::compression::CompressionStage;
use crate::http::dispatch::{DispatchStage, Dispatcher};
use crate::http::forwarded::ForwardedStage;
use crate::http::h2::{H2Bridge, H2Settings};
use crate::http::keep_alive::KeepAliveStage;
use crate::http::normalize::Normalizer;
use crate::http::response_headers::{HeaderRuleError, HeaderRules, ResponseHeadersStage, SameSiteRules};
use crate::http::upgrade::{H2cUpgrade, PrefaceDetector};
use crate::net::alpn::AlpnStage;
use crate::net::tls::{TlsContextProvider, TlsError, TlsStage};
use crate::observability::access::{AccessStage, ChunkLoggingStage};
use crate::observability::{AccessLogSink, HandshakeLogLimiter};
use crate::pipeline::{names, ConnectionContext, NamedStage, PipelineError, Protocol, StageChain};
use crate::security::TrustedProxies;

#[derive(Debug, thiserror::Error)]
pub enum AssemblyError {
    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error("invalid trusted proxy pattern: {0}")]
    Proxies(#[from] regex::Error),

    #[error(transparent)]
    Headers(#[from] HeaderRuleError),

    #[error(transparent)]
    Chain(#[from] PipelineError),
}

/// Long-lived collaborators shared by every assembler of a server.
#[derive(Clone)]
pub struct Services {
    pub dispatcher: Arc<dyn Dispatcher>,
    pub access_log: Arc<dyn AccessLogSink>,
    pub tls: Arc<dyn TlsContextProvider>,
    /// Process-wide count of handshake failure log entries.
    pub handshake_failures: Arc<AtomicU64>,
}

impl Services {
    pub fn new(
        dispatcher: Arc<dyn Dispatcher>,
        access_log: Arc<dyn AccessLogSink>,
        tls: Arc<dyn TlsContextProvider>,
    ) -> Self {
        Self {
            dispatcher,
            access_log,
            tls,
            handshake_failures: Arc::new(AtomicU64::new(0)),
        }
    }
}

/// Chain factory for one listener and one configuration snapshot.
pub struct Assembler {
    config: Arc<PipelineConfig>,
    services: Services,
    secure: bool,
    http2: bool,
    host: String,
    port: u16,
    proxies: Option<Arc<TrustedProxies>>,
    header_rules: Option<HeaderRules>,
    samesite: Option<SameSiteRules>,
}

impl std::fmt::Debug for Assembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Assembler")
            .field("secure", &self.secure)
            .field("http2", &self.http2)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("config", &self.config)
            .finish()
    }
}

impl Assembler {
    /// Compiles the configuration once; every chain built afterwards shares it.
    pub fn new(
        config: PipelineConfig,
        listener: &ListenerConfig,
        local_addr: SocketAddr,
        services: Services,
    ) -> Result<Self, AssemblyError> {
        let proxies = match &config.remote_ip {
            Some(remote_ip) => Some(Arc::new(TrustedProxies::new(&remote_ip.proxies)?)),
            None => None,
        };
        let header_rules = config.headers.as_ref().map(HeaderRules::try_from).transpose()?;
        let samesite = config.samesite.as_ref().map(SameSiteRules::from);

        Ok(Self {
            config: Arc::new(config),
            services,
            secure: listener.secure,
            http2: listener.http2_enabled,
            host: local_addr.ip().to_string(),
            port: local_addr.port(),
            proxies,
            header_rules,
            samesite,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn dispatcher(&self) -> &Arc<dyn Dispatcher> {
        &self.services.dispatcher
    }

    /// Sink for access entries, `None` when access logging is off.
    pub fn access_log(&self) -> Option<&Arc<dyn AccessLogSink>> {
        self.config
            .access_log
            .as_ref()
            .map(|_| &self.services.access_log)
    }

    fn use_forwarded_in_log(&self) -> bool {
        self.config
            .remote_ip
            .as_ref()
            .is_some_and(|r| r.use_in_access_log)
    }

    /// Builds the chain for a new connection and sets the connection's
    /// initial protocol state.
    pub fn build(self: &Arc<Self>, conn: &mut ConnectionContext) -> Result<StageChain, AssemblyError> {
        let mut chain = StageChain::new();
        chain.add_last(NamedStage::new(names::BUFFER_BRIDGE, BufferBridge))?;

        match (self.secure, self.http2) {
            (true, _) => {
                let context = self
                    .services
                    .tls
                    .context(&self.config.ssl, &self.host, self.port, self.http2)?;
                let limiter = HandshakeLogLimiter::with_counter(
                    self.config.ssl.max_handshake_log_entries,
                    Arc::clone(&self.services.handshake_failures),
                );
                chain.add_last(NamedStage::new(names::TLS, TlsStage::new(context, limiter)))?;
                chain.add_last(NamedStage::new(names::ALPN, AlpnStage::new(Arc::clone(self))))?;
                conn.disable_half_closure();
            }
            (false, false) => {
                for stage in self.http11_stages() {
                    chain.add_last(stage)?;
                }
                conn.set_protocol(Protocol::Plaintext11);
                conn.enable_half_closure();
            }
            (false, true) => {
                chain.add_last(self.crlf_guard())?;
                chain.add_last(NamedStage::new(names::H2_PREFACE, PrefaceDetector::new(self.h2_bridge())))?;
                for stage in self.framing_stages() {
                    chain.add_last(stage)?;
                }
                let upgrade = H2cUpgrade::new(
                    self.aggregator(),
                    self.normalizer(),
                    H2Bridge::new(self.h2_settings()),
                );
                chain.add_last(NamedStage::new(names::H2C_UPGRADE, upgrade))?;
                if let Some(forwarded) = self.forwarded() {
                    chain.add_last(forwarded)?;
                }
                conn.disable_half_closure();
            }
        }

        chain.add_last(NamedStage::new(names::DISPATCHER, DispatchStage::new()))?;
        tracing::trace!(connection_id = %conn.id(), chain = ?chain, "Chain assembled");
        Ok(chain)
    }

    /// HTTP/1.1 stages between the transport (or TLS) and the dispatcher.
    pub fn http11_stages(&self) -> Vec<NamedStage> {
        let mut stages = vec![self.crlf_guard()];
        stages.extend(self.framing_stages());
        stages.push(self.aggregator());
        stages.push(self.normalizer());
        stages.extend(self.forwarded());
        stages
    }

    pub fn h2_bridge(&self) -> NamedStage {
        NamedStage::new(names::H2_BRIDGE, H2Bridge::new(self.h2_settings()))
    }

    fn h2_settings(&self) -> H2Settings {
        H2Settings {
            dispatcher: Arc::clone(&self.services.dispatcher),
            access_log: self.access_log().cloned(),
            proxies: self.proxies.clone(),
            forwarded_in_access_log: self.use_forwarded_in_log(),
        }
    }

    fn crlf_guard(&self) -> NamedStage {
        NamedStage::new(names::CRLF_GUARD, CrlfGuard::new(self.config.http.max_leading_crlf))
    }

    fn framing_stages(&self) -> Vec<NamedStage> {
        let http = &self.config.http;
        vec![
            NamedStage::new(names::HTTP_CODEC, Http1Codec::new(http.max_head_size)),
            NamedStage::new(names::CHUNK_LOGGING, ChunkLoggingStage),
            NamedStage::new(names::CHUNKED_WRITE, ChunkedWriteStage::new(http.chunk_size)),
            NamedStage::new(names::ACCESS_LOG, AccessStage::new(self.use_forwarded_in_log())),
            NamedStage::new(names::COMPRESSION, CompressionStage::new(self.config.compression.clone())),
            NamedStage::new(
                names::RESPONSE_HEADERS,
                ResponseHeadersStage::new(self.header_rules.clone(), self.samesite.clone()),
            ),
            NamedStage::new(
                names::KEEP_ALIVE,
                KeepAliveStage::new(http.keep_alive_enabled, http.max_keep_alive_requests),
            ),
        ]
    }

    fn aggregator(&self) -> NamedStage {
        NamedStage::new(names::AGGREGATOR, Aggregator::new(self.config.http.message_size_limit))
    }

    fn normalizer(&self) -> NamedStage {
        NamedStage::new(names::NORMALIZER, Normalizer::new())
    }

    fn forwarded(&self) -> Option<NamedStage> {
        self.proxies
            .as_ref()
            .map(|p| NamedStage::new(names::FORWARDED, ForwardedStage::new(Arc::clone(p))))
    }
}
