use std::time::Duration;

use rand::Rng;

use crate::config::ReconnectPolicy;

/// Delay before reconnect attempt `attempt` (1-based).
///
/// The nominal delay doubles from `base_delay` per attempt up to `max_delay`,
/// then a symmetric jitter of `jitter * nominal` is applied. The result never
/// exceeds `max_delay`.
pub fn delay_for_attempt(policy: &ReconnectPolicy, attempt: u32) -> Duration {
    let mut rng = rand::thread_rng();
    let factor = jitter_factor(policy.jitter, rng.r#gen::<f64>());
    scaled_delay(policy, attempt, factor)
}

fn jitter_factor(jitter: f64, sample: f64) -> f64 {
    let jitter = jitter.clamp(0.0, 1.0);
    1.0 - jitter + 2.0 * jitter * sample.clamp(0.0, 1.0)
}

fn nominal_delay(policy: &ReconnectPolicy, attempt: u32) -> Duration {
    let max = policy.max_delay();
    let exponent = attempt.saturating_sub(1).min(31);
    policy
        .base_delay()
        .checked_mul(1u32 << exponent)
        .map_or(max, |delay| delay.min(max))
}

fn scaled_delay(policy: &ReconnectPolicy, attempt: u32, factor: f64) -> Duration {
    nominal_delay(policy, attempt)
        .mul_f64(factor)
        .min(policy.max_delay())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay_ms: 500,
            max_delay_ms: 10_000,
            jitter: 0.2,
            max_attempts: 5,
        }
    }

    #[test]
    fn nominal_delay_doubles_until_capped() {
        let policy = policy();
        let delays: Vec<u64> = (1..=7)
            .map(|attempt| nominal_delay(&policy, attempt).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![500, 1_000, 2_000, 4_000, 8_000, 10_000, 10_000]);
        assert_eq!(nominal_delay(&policy, 200), Duration::from_secs(10));
    }

    #[test]
    fn jitter_stays_within_band() {
        let policy = policy();
        let near = |delay: Duration, millis: u64| delay.as_millis().abs_diff(millis as u128) <= 1;
        assert!(near(scaled_delay(&policy, 1, jitter_factor(0.2, 0.0)), 400));
        assert!(near(scaled_delay(&policy, 1, jitter_factor(0.2, 1.0)), 600));
        assert!(near(scaled_delay(&policy, 1, jitter_factor(0.2, 0.5)), 500));
        assert_eq!(
            scaled_delay(&policy, 9, jitter_factor(0.2, 1.0)),
            policy.max_delay()
        );

        for attempt in 1..=8 {
            for _ in 0..50 {
                let delay = delay_for_attempt(&policy, attempt);
                let nominal = nominal_delay(&policy, attempt);
                assert!(delay + Duration::from_millis(1) >= nominal.mul_f64(0.8));
                assert!(delay <= policy.max_delay());
            }
        }
    }

    #[test]
    fn zero_jitter_is_deterministic() {
        let policy = ReconnectPolicy {
            jitter: 0.0,
            ..policy()
        };
        assert_eq!(delay_for_attempt(&policy, 3), Duration::from_secs(2));
    }
}
