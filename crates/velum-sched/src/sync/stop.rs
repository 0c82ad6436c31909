//! Cooperative cancellation keyed by stage

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Stop point meaning "no stop requested".
const NEVER: u64 = u64::MAX;

/// Cooperative cancellation marker keyed by a stage threshold.
///
/// A stop token never interrupts anything by itself. Task bodies observe it
/// with [`is_stop_requested`](StopToken::is_stop_requested) at the stage they
/// are working on and decline to requeue. Stop points only tighten: a later
/// request can lower the threshold but never raise it.
pub struct StopToken {
    stop_point: AtomicU64,
}

impl StopToken {
    pub fn new() -> Self {
        Self {
            stop_point: AtomicU64::new(NEVER),
        }
    }

    /// True iff a stop has been requested at or before `stage`.
    pub fn is_stop_requested(&self, stage: u64) -> bool {
        self.stop_point.load(Ordering::Acquire) <= stage
    }

    /// Request that work stop once it reaches `stage`.
    pub fn request_stop(&self, stage: u64) {
        let mut current = self.stop_point.load(Ordering::Relaxed);
        loop {
            if current <= stage {
                return;
            }
            match self.stop_point.compare_exchange_weak(
                current,
                stage,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }
}

impl Default for StopToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Create an independently allocated, shareable stop token handle.
pub fn create_stop_token() -> Arc<StopToken> {
    Arc::new(StopToken::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_never_stops() {
        let token = StopToken::new();

        assert!(!token.is_stop_requested(0));
        assert!(!token.is_stop_requested(u64::MAX - 1));
    }

    #[test]
    fn test_request_stop() {
        let token = StopToken::new();
        token.request_stop(5);

        assert!(!token.is_stop_requested(4));
        assert!(token.is_stop_requested(5));
        assert!(token.is_stop_requested(6));
    }

    #[test]
    fn test_stop_points_only_tighten() {
        let token = StopToken::new();

        token.request_stop(5);
        // a looser request has no effect
        token.request_stop(9);
        assert!(!token.is_stop_requested(4));
        assert!(token.is_stop_requested(5));

        // a tighter one does
        token.request_stop(3);
        assert!(token.is_stop_requested(3));
        assert!(!token.is_stop_requested(2));
    }
}
