//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, connection limits)
//!     → connection.rs (id, lifetime tracking)
//!     → driver.rs (socket I/O around the connection's pipeline)
//!     → tls.rs / alpn.rs (stages of secure chains)
//! ```
//!
//! # Design Decisions
//! - Bounded accept prevents resource exhaustion
//! - Each connection is tracked for graceful shutdown
//! - TLS runs inside the chain, so the driver only sees bytes

pub mod alpn;
pub mod connection;
pub mod driver;
pub mod listener;
pub mod tls;

pub use connection::{ConnectionId, ConnectionTracker};
pub use driver::ConnectionDriver;
pub use listener::{Listener, ListenerError};
pub use tls::{PemContextProvider, TlsContextProvider, TlsError};
