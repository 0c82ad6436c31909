//! Escalating wait strategies for polling loops
//!
//! Pollers spin while a result is expected imminently, yield once the wait
//! stretches past a few iterations, and finally sleep once the queue has been
//! idle long enough that wake-up latency no longer matters.

use std::hint;
use std::thread;
use std::time::Duration;

/// Poll count below which a poller busy-spins without a CPU hint.
pub const HOT_SPIN_POLLS: u64 = 8;

/// Poll count below which a poller busy-spins with a CPU relax hint.
pub const SPIN_POLLS: u64 = 16;

/// Poll count below which a poller yields its timeslice.
pub const YIELD_POLLS: u64 = 64;

/// Wait strategy selected for a given poll count.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BackoffAction {
    /// Busy-spin, optionally with a CPU relax hint
    Spin,
    /// Yield the thread's timeslice to the OS
    Yield,
    /// Sleep for a caller-supplied duration
    Sleep,
}

/// Map a poll counter to a wait strategy.
///
/// Pure function of the attempt count: `[0, SPIN_POLLS)` spins,
/// `[SPIN_POLLS, YIELD_POLLS)` yields, everything above sleeps.
pub fn backoff_action(poll: u64) -> BackoffAction {
    if poll < SPIN_POLLS {
        BackoffAction::Spin
    } else if poll < YIELD_POLLS {
        BackoffAction::Yield
    } else {
        BackoffAction::Sleep
    }
}

/// Backoff that never sleeps. Used where an imminent result is expected:
/// lock acquisition and finite-timeout awaits.
pub fn yielding_backoff(poll: u64) {
    match backoff_action(poll) {
        BackoffAction::Spin => {
            if poll >= HOT_SPIN_POLLS {
                hint::spin_loop();
            }
        }
        BackoffAction::Yield | BackoffAction::Sleep => thread::yield_now(),
    }
}

/// Backoff that degrades to sleeping for `max_sleep`. Used by executor
/// threads idling on an empty queue.
pub fn sleepy_backoff(poll: u64, max_sleep: Duration) {
    match backoff_action(poll) {
        BackoffAction::Spin => {
            if poll >= HOT_SPIN_POLLS {
                hint::spin_loop();
            }
        }
        BackoffAction::Yield => thread::yield_now(),
        BackoffAction::Sleep => thread::sleep(max_sleep),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_ladder() {
        assert_eq!(backoff_action(0), BackoffAction::Spin);
        assert_eq!(backoff_action(HOT_SPIN_POLLS), BackoffAction::Spin);
        assert_eq!(backoff_action(SPIN_POLLS - 1), BackoffAction::Spin);
        assert_eq!(backoff_action(SPIN_POLLS), BackoffAction::Yield);
        assert_eq!(backoff_action(YIELD_POLLS - 1), BackoffAction::Yield);
        assert_eq!(backoff_action(YIELD_POLLS), BackoffAction::Sleep);
        assert_eq!(backoff_action(u64::MAX), BackoffAction::Sleep);
    }

    #[test]
    fn test_yielding_backoff_never_sleeps() {
        // every tier must return promptly; exercise all of them
        for poll in [0, HOT_SPIN_POLLS, SPIN_POLLS, YIELD_POLLS, YIELD_POLLS * 4] {
            yielding_backoff(poll);
        }
    }

    #[test]
    fn test_sleepy_backoff_sleeps_at_most_max() {
        use std::time::Instant;

        let begin = Instant::now();
        sleepy_backoff(YIELD_POLLS, Duration::from_millis(5));
        assert!(begin.elapsed() >= Duration::from_millis(5));

        // below the sleep tier the duration is ignored
        let begin = Instant::now();
        sleepy_backoff(0, Duration::from_secs(60));
        assert!(begin.elapsed() < Duration::from_secs(1));
    }
}
