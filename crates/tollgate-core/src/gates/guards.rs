//! Shared guardrails for catalog sizes, concurrency and captured output.

use std::time::Duration;

// Executor guards
pub const DEFAULT_OPTIONAL_MIN_REMAINING: Duration = Duration::from_secs(60);
pub const DEFAULT_ADAPTIVE_CEILING: usize = 4;
pub const MAX_ADAPTIVE_CONCURRENCY: usize = 64;
pub const MAX_BOUNDED_CONCURRENCY: usize = 64;
pub const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(25);
pub const MAX_OUTPUT_BYTES: usize = 64 * 1024;
pub const MAX_CHECK_RETRIES: u32 = 5;
/// How long a finished check's output readers may take to hit EOF.
pub const OUTPUT_DRAIN_GRACE: Duration = Duration::from_millis(500);

// Catalog guards
pub const MAX_LEVELS: usize = 16;
pub const MAX_CHECKS_PER_LEVEL: usize = 128;
pub const MAX_ESCALATION_RULES: usize = 64;
pub const MAX_FILE_PATTERNS: usize = 64;
pub const MAX_PATTERN_FACTOR: f64 = 100.0;

// Selector guards
pub const DEFAULT_HINT_MIN_SAMPLES: usize = 3;
pub const DEFAULT_HINT_MIN_SHARE: f64 = 0.5;
pub const MAX_HINT_SAMPLES: usize = 200;

pub fn clamp_int(value: i64, minimum: i64, maximum: i64) -> i64 {
    value.max(minimum).min(maximum)
}

pub fn clamp_concurrency(value: usize, maximum: usize) -> usize {
    clamp_int(value as i64, 1, maximum.max(1) as i64) as usize
}

pub fn clamp_share(value: f64) -> f64 {
    if value.is_nan() {
        return DEFAULT_HINT_MIN_SHARE;
    }
    value.clamp(0.0, 1.0)
}

/// Cut `output` to at most `MAX_OUTPUT_BYTES`, on a char boundary.
pub fn truncate_output(output: &str) -> String {
    let trimmed = output.trim_end();
    if trimmed.len() <= MAX_OUTPUT_BYTES {
        return trimmed.to_string();
    }
    let mut end = MAX_OUTPUT_BYTES;
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n[output truncated]", &trimmed[..end])
}

/// Clamp a duration into `[minimum, maximum]`.
pub fn clamp_duration(value: Duration, minimum: Duration, maximum: Duration) -> Duration {
    value.max(minimum).min(maximum)
}
