//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Parsed request headers:
//!     → forwarded.rs (Forwarded / X-Forwarded-* into a ForwardedChain)
//!     → proxies.rs (is the chain from trusted proxies?)
//!     → request extension for the dispatcher, or discarded
//! ```
//!
//! # Design Decisions
//! - Fail closed: a malformed header yields no forwarded data at all
//! - No trust in client input: the peer and each hop must be known proxies

pub mod forwarded;
pub mod proxies;

pub use forwarded::{ForwardedChain, ForwardedError};
pub use proxies::TrustedProxies;
