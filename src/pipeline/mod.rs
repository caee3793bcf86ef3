//! Per-connection processing pipeline.
//!
//! # Data Flow
//! ```text
//! socket bytes
//!     → Pipeline::read (head of chain)
//!     → stages, towards the dispatcher
//!     → PipelineOutput::dispatch queue (driver awaits the Dispatcher)
//!
//! Pipeline::respond (at the dispatcher)
//!     → stages, towards the transport
//!     → PipelineOutput::frames (driver writes them to the socket)
//! ```
//!
//! # Design Decisions
//! - The chain is synchronous and sans-IO; the connection driver owns all I/O
//! - Stages are addressed by unique names so protocol decisions can splice
//!   the chain at runtime
//! - Per-connection state is a typed struct, not an attribute map

pub mod assembler;
pub mod chain;
pub mod context;
pub mod stage;

pub use assembler::{Assembler, AssemblyError};
pub use chain::{Pipeline, StageChain};
pub use context::{ConnectionContext, ConnectionInfo, Protocol};
pub use stage::{Inbound, NamedStage, Outbound, PipelineEvent, Stage, StageContext};

use crate::codec::CodecError;
use crate::net::tls::TlsError;

/// Stage names used by the assembler and by stages that splice the chain.
pub mod names {
    pub const BUFFER_BRIDGE: &str = "buffer-bridge";
    pub const TLS: &str = "tls";
    pub const ALPN: &str = "alpn";
    pub const CRLF_GUARD: &str = "crlf-guard";
    pub const H2_PREFACE: &str = "h2-preface";
    pub const HTTP_CODEC: &str = "http-codec";
    pub const CHUNK_LOGGING: &str = "chunk-logging";
    pub const CHUNKED_WRITE: &str = "chunked-write";
    pub const ACCESS_LOG: &str = "access-log";
    pub const COMPRESSION: &str = "compression";
    pub const RESPONSE_HEADERS: &str = "response-headers";
    pub const KEEP_ALIVE: &str = "keep-alive";
    pub const AGGREGATOR: &str = "aggregator";
    pub const NORMALIZER: &str = "normalizer";
    pub const H2C_UPGRADE: &str = "h2c-upgrade";
    pub const FORWARDED: &str = "forwarded";
    pub const H2_BRIDGE: &str = "h2-bridge";
    pub const DISPATCHER: &str = "dispatcher";
}

/// Errors raised by the chain or by one of its stages. Every variant is
/// fatal to the connection.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("stage `{0}` is already registered")]
    DuplicateStage(&'static str),

    #[error("no stage named `{0}`")]
    NoSuchStage(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error("half-closure still enabled on an HTTP/2 connection")]
    HalfClosureOnHttp2,

    #[error("stage `{stage}` failed: {message}")]
    Unexpected { stage: &'static str, message: String },
}
