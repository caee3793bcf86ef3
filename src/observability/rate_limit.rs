//! Process-wide bound on TLS handshake failure log entries.

use std::fmt::Display;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// What to do with one more handshake failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogDecision {
    Log,
    /// The threshold was just crossed: emit the one-time notice.
    SuppressNotice,
    Suppress,
}

/// Allows `max_entries` log entries, then a single suppression notice, then
/// nothing for the lifetime of the counter.
#[derive(Debug, Clone)]
pub struct HandshakeLogLimiter {
    max_entries: u64,
    counter: Arc<AtomicU64>,
}

impl HandshakeLogLimiter {
    pub fn new(max_entries: u64) -> Self {
        Self::with_counter(max_entries, Arc::new(AtomicU64::new(0)))
    }

    /// Uses an externally owned counter.
    pub fn with_counter(max_entries: u64, counter: Arc<AtomicU64>) -> Self {
        Self { max_entries, counter }
    }

    pub fn check(&self) -> LogDecision {
        let max = self.max_entries;
        // Stops counting once the notice was handed out.
        match self
            .counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n <= max).then_some(n + 1))
        {
            Ok(n) if n < max => LogDecision::Log,
            Ok(_) => LogDecision::SuppressNotice,
            Err(_) => LogDecision::Suppress,
        }
    }

    pub fn should_log(&self) -> bool {
        self.check() == LogDecision::Log
    }

    /// Logs a handshake failure subject to the limit.
    pub fn report(&self, error: &dyn Display, local: SocketAddr, peer: SocketAddr) -> LogDecision {
        let decision = self.check();
        match decision {
            LogDecision::Log => tracing::warn!(
                local_addr = %local.ip(),
                local_port = local.port(),
                peer_addr = %peer.ip(),
                peer_port = peer.port(),
                error = %error,
                "TLS handshake failed"
            ),
            LogDecision::SuppressNotice => tracing::info!(
                max_entries = self.max_entries,
                "TLS handshake failure logging suppressed after reaching the configured limit"
            ),
            LogDecision::Suppress => {}
        }
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exactly_one_notice_after_threshold() {
        let limiter = HandshakeLogLimiter::new(3);
        let decisions: Vec<_> = (0..10).map(|_| limiter.check()).collect();
        assert_eq!(&decisions[..3], &[LogDecision::Log; 3]);
        assert_eq!(decisions[3], LogDecision::SuppressNotice);
        assert!(decisions[4..].iter().all(|d| *d == LogDecision::Suppress));
    }

    #[test]
    fn zero_limit_only_emits_notice() {
        let limiter = HandshakeLogLimiter::new(0);
        assert_eq!(limiter.check(), LogDecision::SuppressNotice);
        assert!(!limiter.should_log());
    }

    #[test]
    fn clones_share_the_counter() {
        let counter = Arc::new(AtomicU64::new(0));
        let a = HandshakeLogLimiter::with_counter(1, counter.clone());
        let b = a.clone();
        assert!(a.should_log());
        assert_eq!(b.check(), LogDecision::SuppressNotice);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(a.check(), LogDecision::Suppress);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn counts_across_threads() {
        let limiter = HandshakeLogLimiter::new(50);
        let notices = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    s.spawn(|| {
                        (0..20)
                            .filter(|_| limiter.check() == LogDecision::SuppressNotice)
                            .count()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum::<usize>()
        });
        assert_eq!(notices, 1);
    }
}
