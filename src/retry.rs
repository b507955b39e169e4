use std::time::Duration;

use rand::Rng;

use crate::settings::RetryConfig;

/// Capped exponential backoff for retried distributor calls.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first; `None` means bounded only by `expiration_ms`
    pub max_attempts: Option<u32>,
    pub initial_interval_ms: Option<u64>,
    pub max_interval_ms: Option<u64>,
    pub backoff_factor: Option<f64>,
    /// Stop retrying once this much time has passed since the first attempt
    pub expiration_ms: Option<u64>,
}

impl RetryPolicy {
    pub fn default_initial_interval_ms() -> u64 {
        50
    }
    pub fn default_max_interval_ms() -> u64 {
        1_000
    }
    pub fn default_backoff_factor() -> f64 {
        2.0
    }
    pub fn default_expiration_ms() -> u64 {
        30_000
    }

    /// Policy used for spectator-facing distributor calls.
    pub fn distributor_default() -> Self {
        Self {
            max_attempts: None,
            initial_interval_ms: Some(Self::default_initial_interval_ms()),
            max_interval_ms: Some(Self::default_max_interval_ms()),
            backoff_factor: Some(Self::default_backoff_factor()),
            expiration_ms: Some(Self::default_expiration_ms()),
        }
    }

    /// Policy that never retries.
    pub fn no_retries() -> Self {
        Self {
            max_attempts: Some(1),
            initial_interval_ms: None,
            max_interval_ms: None,
            backoff_factor: None,
            expiration_ms: None,
        }
    }

    /// Overlay configured values on top of [`RetryPolicy::distributor_default`].
    pub fn from_config(cfg: &RetryConfig) -> Self {
        let default = Self::distributor_default();
        Self {
            max_attempts: cfg.max_attempts.or(default.max_attempts),
            initial_interval_ms: cfg.initial_interval_ms.or(default.initial_interval_ms),
            max_interval_ms: cfg.max_interval_ms.or(default.max_interval_ms),
            backoff_factor: cfg.backoff_factor.or(default.backoff_factor),
            expiration_ms: cfg.expiration_ms.or(default.expiration_ms),
        }
    }
}

/// Compute how long to wait before the next attempt, if any.
/// - `failures_so_far`: failed attempts so far (1 after the first failure)
/// - `elapsed`: time since the first attempt started
///
/// Returns `None` when the policy is exhausted.
pub fn next_retry_delay(
    failures_so_far: u32,
    elapsed: Duration,
    policy: &RetryPolicy,
) -> Option<Duration> {
    if let Some(max_attempts) = policy.max_attempts
        && failures_so_far >= max_attempts
    {
        return None;
    }

    let initial = policy
        .initial_interval_ms
        .unwrap_or_else(RetryPolicy::default_initial_interval_ms);
    let factor = policy
        .backoff_factor
        .unwrap_or_else(RetryPolicy::default_backoff_factor);
    let max_interval = policy.max_interval_ms.unwrap_or(u64::MAX);

    // delay_n = initial * factor^(n-1) for the n-th failure
    let exponent = failures_so_far.saturating_sub(1).min(i32::MAX as u32) as i32;
    let raw = initial as f64 * factor.powi(exponent);
    let delay_ms = if raw.is_finite() && raw < max_interval as f64 {
        raw.round() as u64
    } else {
        max_interval
    };
    let delay = Duration::from_millis(delay_ms);

    if let Some(expiration_ms) = policy.expiration_ms
        && elapsed + delay > Duration::from_millis(expiration_ms)
    {
        return None;
    }
    Some(delay)
}

/// Perturb `base` uniformly within `±coefficient` of its value.
pub fn jittered(base: Duration, coefficient: f64) -> Duration {
    if coefficient <= 0.0 || base.is_zero() {
        return base;
    }
    let factor = rand::thread_rng().gen_range((1.0 - coefficient)..=(1.0 + coefficient));
    base.mul_f64(factor)
}
