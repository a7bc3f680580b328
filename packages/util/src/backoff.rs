use std::time::Duration;

/// Calculate backoff duration for a given attempt. `attempt` is 1-indexed;
/// an attempt of 0 is treated as 1.
pub fn calculate_backoff(attempt: u32, initial_ms: u64, max_ms: u64) -> Duration {
	let attempt = attempt.max(1);

	// Saturate the exponent so large attempt counts don't overflow
	let exp = (attempt - 1).min(63);
	let delay = initial_ms.saturating_mul(2u64.saturating_pow(exp));

	Duration::from_millis(delay.min(max_ms))
}
