//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! decoded request parts (codec)
//!     → keep_alive.rs (persistence decision)
//!     → aggregate.rs (size limit, 100-continue, full request)
//!     → normalize.rs (origin-form, Host, stripped h2c offers)
//!     → forwarded.rs (trusted forwarding data)
//!     → dispatch.rs (application dispatcher)
//!
//! response
//!     → response_headers.rs, compression.rs
//!     → chunked_write.rs (content-length or chunked framing)
//!     → codec
//!
//! HTTP/2: upgrade.rs detects the preface or accepts an h2c upgrade
//! (h2c.rs), h2.rs serves the session
//! server.rs: accept loop, reload, shutdown
//! ```

pub mod aggregate;
pub mod chunked_write;
pub mod compression;
pub mod dispatch;
pub mod forwarded;
pub mod h2;
pub mod h2c;
pub mod keep_alive;
pub mod normalize;
pub mod response_headers;
pub mod server;
pub mod upgrade;

pub use dispatch::{Dispatcher, FnDispatcher, InfoDispatcher};
pub use server::{HttpServer, ServerError};
