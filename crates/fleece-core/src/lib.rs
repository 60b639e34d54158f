//! Foundational low-level utilities shared across Fleece crates.
//!
//! Provides time helpers, atomic file writes, the retry/backoff policy used
//! for environment provisioning and remote calls, and the tracing bootstrap.

pub mod atomic_io;
pub mod lockfile;
pub mod retry;
pub mod time_utils;

pub use atomic_io::write_text_atomic;
pub use lockfile::{acquire_lock, LockGuard};
pub use retry::RetryPolicy;
pub use time_utils::{current_unix_timestamp, current_unix_timestamp_ms};

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Installs the process-wide tracing subscriber. Safe to call more than once;
/// later calls are ignored.
pub fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .try_init();
}

#[cfg(test)]
mod tests {
    use std::fs::read_to_string;
    use std::time::Duration;

    use super::*;

    #[test]
    fn time_utils_second_and_millisecond_clocks_agree() {
        let now_s = current_unix_timestamp();
        let now_ms = current_unix_timestamp_ms();
        let now_ms_s = now_ms / 1_000;
        assert!(now_ms_s >= now_s);
        assert!(now_ms_s <= now_s.saturating_add(1));
    }

    #[test]
    fn write_text_atomic_writes_content() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let path = tempdir.path().join("record.jsonl");
        write_text_atomic(&path, "{\"ok\":true}").expect("write");
        let contents = read_to_string(&path).expect("read");
        assert_eq!(contents, "{\"ok\":true}");
    }

    #[test]
    fn retry_policy_delays_grow_and_cap() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay_ms: 100,
            max_delay_ms: 500,
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_millis(500));
    }
}
