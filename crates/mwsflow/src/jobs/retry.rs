use chrono::{DateTime, Utc};
use rand::Rng;

use crate::jobs::model::{JobEntry, RetryStage};

#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub base_seconds: i64,
    pub max_seconds: i64,
    pub jitter_pct: f64,
}

impl Default for BackoffConfig {
    // 30m, 1h, 2h, then 4h between attempts
    fn default() -> Self {
        Self {
            base_seconds: 30 * 60,
            max_seconds: 4 * 60 * 60,
            jitter_pct: 0.20,
        }
    }
}

impl BackoffConfig {
    /// No waiting between attempts; every tick retries.
    pub fn immediate() -> Self {
        Self {
            base_seconds: 0,
            max_seconds: 0,
            jitter_pct: 0.0,
        }
    }
}

/// Per-stage retry ceilings. A counter strictly greater than its ceiling
/// gets the entry purged.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_request_retries: u32,
    pub max_status_retries: u32,
    pub max_download_retries: u32,
    pub max_verify_retries: u32,
    pub max_invoke_retries: u32,
    pub backoff: BackoffConfig,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_request_retries: 4,
            max_status_retries: 10,
            max_download_retries: 4,
            max_verify_retries: 3,
            max_invoke_retries: 3,
            backoff: BackoffConfig::default(),
        }
    }
}

impl RetryPolicy {
    pub fn max_for(&self, stage: RetryStage) -> u32 {
        match stage {
            RetryStage::Request => self.max_request_retries,
            RetryStage::Status => self.max_status_retries,
            RetryStage::Download => self.max_download_retries,
            RetryStage::Verify => self.max_verify_retries,
            RetryStage::Invoke => self.max_invoke_retries,
        }
    }

    /// First stage whose counter went past its ceiling, if any.
    pub fn exhausted_stage(&self, entry: &JobEntry) -> Option<RetryStage> {
        RetryStage::ALL
            .into_iter()
            .find(|stage| entry.retries.get(*stage) > self.max_for(*stage))
    }

    /// When the failed stage may be attempted again.
    pub fn retry_after(
        &self,
        attempt_no: u32,
        now: DateTime<Utc>,
        rng: &mut impl Rng,
    ) -> Option<DateTime<Utc>> {
        let delay = next_delay_seconds(attempt_no as i32, &self.backoff, rng);
        if delay <= 0 {
            None
        } else {
            Some(now + chrono::Duration::seconds(delay))
        }
    }
}

pub fn next_delay_seconds(attempt_no: i32, cfg: &BackoffConfig, rng: &mut impl Rng) -> i64 {
    if cfg.base_seconds <= 0 {
        return 0;
    }

    let attempt_no = attempt_no.max(1) as u32;

    // exponent = attempt_no - 1
    let exp = attempt_no.saturating_sub(1);

    // 2^exp; anything past i64 gets capped below
    let pow2 = 1_i64.checked_shl(exp).unwrap_or(i64::MAX);

    let mut delay = cfg.base_seconds.saturating_mul(pow2);

    if delay > cfg.max_seconds {
        delay = cfg.max_seconds;
    }

    // jitter in range [-jitter_pct, +jitter_pct]
    let jitter_range = (delay as f64) * cfg.jitter_pct;
    let jitter = if jitter_range > 0.0 {
        rng.gen_range(-jitter_range..=jitter_range)
    } else {
        0.0
    };

    let jittered = (delay as f64 + jitter).round() as i64;
    jittered.clamp(0, cfg.max_seconds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn no_jitter() -> BackoffConfig {
        BackoffConfig {
            base_seconds: 1800,
            max_seconds: 4 * 3600,
            jitter_pct: 0.0,
        }
    }

    #[test]
    fn delay_doubles_then_caps() {
        let cfg = no_jitter();
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(next_delay_seconds(1, &cfg, &mut rng), 1800);
        assert_eq!(next_delay_seconds(2, &cfg, &mut rng), 3600);
        assert_eq!(next_delay_seconds(3, &cfg, &mut rng), 7200);
        assert_eq!(next_delay_seconds(4, &cfg, &mut rng), 14400);
        assert_eq!(next_delay_seconds(40, &cfg, &mut rng), 14400);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let cfg = BackoffConfig::default();
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..100 {
            let d = next_delay_seconds(1, &cfg, &mut rng);
            assert!((1440..=2160).contains(&d), "delay {d} out of range");
        }
    }

    #[test]
    fn immediate_backoff_never_delays() {
        let policy = RetryPolicy {
            backoff: BackoffConfig::immediate(),
            ..RetryPolicy::default()
        };
        let mut rng = StdRng::seed_from_u64(1);
        assert!(policy.retry_after(3, Utc::now(), &mut rng).is_none());
    }
}
