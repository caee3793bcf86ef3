//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Shutdown::trigger
//!
//! Shutdown (shutdown.rs):
//!     trigger → accept loop stops → idle connections close → drain with timeout
//! ```
//!
//! # Design Decisions
//! - Connections finish the exchange in progress before closing
//! - Shutdown has a timeout: the server stops waiting after the deadline

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
pub use signals::wait_for_signal;
