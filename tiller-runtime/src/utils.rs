//! Small shared helpers for the runtime machinery.
use backoff::{backoff::Backoff, ExponentialBackoff};
use std::time::Duration;

/// The jittered exponential backoff used for watch recovery and retry
/// loops.
///
/// `max_elapsed_time` is unset: these loops retry for the life of the
/// process, with the interval capped rather than the attempt count.
pub fn default_backoff() -> ExponentialBackoff {
    ExponentialBackoff {
        initial_interval: Duration::from_millis(800),
        max_interval: Duration::from_secs(30),
        multiplier: 2.0,
        randomization_factor: 0.5,
        max_elapsed_time: None,
        ..ExponentialBackoff::default()
    }
}

/// The next backoff delay, falling back to the cap if the policy ever
/// reports exhaustion
pub fn next_delay(backoff: &mut ExponentialBackoff) -> Duration {
    backoff.next_backoff().unwrap_or(backoff.max_interval)
}

/// Jittered exponential delay for the Nth consecutive failure of one
/// object's reconciliation; bounded so a persistently failing object is
/// retried at a steady, low rate rather than never
pub fn error_backoff(failures: u32, base: Duration, max: Duration) -> Duration {
    let exp = failures.saturating_sub(1).min(16);
    let unjittered = base.saturating_mul(2u32.saturating_pow(exp)).min(max);
    // 75%..125% of the nominal delay
    let factor = 0.75 + rand::random::<f64>() * 0.5;
    unjittered.mul_f64(factor).min(max)
}
