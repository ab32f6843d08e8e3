use std::time::Duration;

use rand::Rng;

/// Deterministic part of the retry delay: `min(max, base * 2^attempt)`.
/// Attempt counts start at 1; 0 is treated as 1 so the first delay is
/// never shorter than the base.
pub fn capped_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let attempt = attempt.max(1);
    let factor = 2u32.saturating_pow(attempt);
    base.saturating_mul(factor).min(max)
}

/// Retry delay with uniform jitter of up to 20% of the capped value, to
/// avoid synchronized retry bursts against the RPC endpoint.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let capped = capped_delay(attempt, base, max);
    let jitter_cap_ms = (capped.as_millis() / 5) as u64;
    if jitter_cap_ms == 0 {
        return capped;
    }
    let jitter_ms = rand::thread_rng().gen_range(0..=jitter_cap_ms);
    capped + Duration::from_millis(jitter_ms)
}
