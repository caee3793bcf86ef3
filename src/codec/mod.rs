//! Byte-level codecs of the HTTP/1.1 path.
//!
//! # Data Flow
//! ```text
//! BytesMut from the socket
//!     → bridge.rs (transport buffer → Bytes)
//!     → crlf.rs (leading CRLF bound, once per connection)
//!     → http1.rs (request heads and bodies, chunked.rs for chunked bodies)
//!
//! Response heads and chunks
//!     → http1.rs (status line, headers, chunk framing)
//!     → bridge.rs (Bytes → ContentFrame)
//! ```

pub mod bridge;
pub mod chunked;
pub mod crlf;
pub mod http1;

/// Decoding failures. All of them are fatal to the connection.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("{count} leading CRLF sequences exceed the allowed {max}")]
    ExcessiveLeadingCrlf { count: usize, max: usize },

    #[error("malformed request head: {0}")]
    MalformedHead(#[from] httparse::Error),

    #[error("request head exceeds {limit} bytes")]
    HeadTooLarge { limit: usize },

    #[error("invalid request: {0}")]
    InvalidRequest(#[from] http::Error),

    #[error("invalid Content-Length header")]
    InvalidContentLength,

    #[error("both Transfer-Encoding and Content-Length present")]
    ConflictingFraming,

    #[error("unsupported transfer coding `{0}`")]
    UnsupportedTransferCoding(String),

    #[error("invalid chunked body: {0}")]
    InvalidChunk(&'static str),
}
