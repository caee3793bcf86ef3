//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events)
//!     → metrics.rs (counters, gauges)
//!
//! Connection chains produce:
//!     → access.rs (access log entries, chunk traces)
//!     → rate_limit.rs (bounded TLS handshake failure reports)
//! ```
//!
//! # Design Decisions
//! - Structured logging (JSON) for machine parsing
//! - Connection id flows through every connection-scoped event
//! - Metrics are cheap (atomic increments)

pub mod access;
pub mod logging;
pub mod metrics;
pub mod rate_limit;

pub use access::{AccessLogEntry, AccessLogSink, TracingAccessLog};
pub use rate_limit::{HandshakeLogLimiter, LogDecision};
