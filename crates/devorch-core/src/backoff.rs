//! Shared exponential-backoff math used by the mirror retry, the backlog
//! SHA-conflict retry, and both controllers' execution/review retries.

use std::time::Duration;

/// `base_ms * 2^attempt`, uncapped. Used for IssueController/PRController
/// retry scheduling where spec fixes the sequence to `{1000, 2000, 4000, ...}`.
pub fn retry_delay_ms(base_ms: u64, attempt: u32) -> u64 {
    base_ms.saturating_mul(1u64 << attempt.min(32))
}

/// `base_ms * 2^attempt` capped at `cap_ms`. Used for the StatefulEntity
/// mirror retry (`100ms * 2^attempt`, capped at 100s).
pub fn capped_retry_delay(base_ms: u64, attempt: u32, cap_ms: u64) -> Duration {
    Duration::from_millis(retry_delay_ms(base_ms, attempt).min(cap_ms))
}

/// `base_ms * 2^attempt`, used for the backlog commit SHA-conflict retry
/// (`500ms * 2^attempt`).
pub fn commit_retry_delay(attempt: u32) -> Duration {
    Duration::from_millis(retry_delay_ms(500, attempt))
}
