//! HTTP/1.1 and HTTP/2 connection pipeline.
//!
//! Each accepted connection gets an ordered chain of named stages that
//! frames bytes into requests, applies per-connection policy and hands
//! complete requests to a [`Dispatcher`](http::Dispatcher). The chain is
//! chosen per connection (plaintext, TLS with ALPN, prior-knowledge h2c) and
//! can rewrite itself once the protocol is known.

// Core subsystems
pub mod codec;
pub mod config;
pub mod http;
pub mod net;
pub mod pipeline;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;
pub mod security;

pub use config::ServerConfig;
pub use http::{Dispatcher, HttpServer};
pub use lifecycle::Shutdown;
pub use pipeline::assembler::Services;
