use std::time::Duration;

use rand::Rng;

pub const DEFAULT_INTERVAL_MILLIS: u64 = 1_000;
pub const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;
pub const MAX_BACKOFF_MILLIS: u64 = 5 * 60 * 1_000;
pub const RANDOM_FACTOR: f64 = 0.5;

#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    pub interval_millis: u64,
    pub backoff_factor: f64,
    pub max_millis: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            interval_millis: DEFAULT_INTERVAL_MILLIS,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            max_millis: MAX_BACKOFF_MILLIS,
        }
    }
}

/// Reconnect pacing for a peer session: exponential growth with ±50% jitter,
/// reset on the first healthy exchange.
///
/// Distinct from [`crate::retry::RetryPolicy`], which retries individual
/// operations linearly; this state paces connection attempts.
#[derive(Debug)]
pub struct ConnectionBackoff {
    config: BackoffConfig,
    attempt: u32,
}

impl ConnectionBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay before the next connection attempt.
    pub fn next_delay(&mut self) -> Duration {
        let millis = calculate_backoff_with_rng(self.attempt, self.config, &mut rand::thread_rng());
        self.attempt = self.attempt.saturating_add(1);
        Duration::from_millis(millis)
    }

    /// Doubles the current penalty without another attempt, applied after
    /// handshake rejections.
    pub fn penalize(&mut self) {
        self.attempt = self.attempt.saturating_add(1);
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for ConnectionBackoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

fn calculate_backoff_with_rng<R: Rng + ?Sized>(
    backoff_count: u32,
    config: BackoffConfig,
    rng: &mut R,
) -> u64 {
    let base = (config.interval_millis as f64) * config.backoff_factor.powi(backoff_count as i32);
    let jitter = RANDOM_FACTOR * base * rng.gen_range(-1.0..=1.0);
    let value = (base + jitter).round().clamp(0.0, config.max_millis as f64);
    value as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn deterministic_with_seeded_rng() {
        let mut rng = StdRng::seed_from_u64(42);
        let value = calculate_backoff_with_rng(3, BackoffConfig::default(), &mut rng);
        assert!(value > 0);
        assert!(value <= MAX_BACKOFF_MILLIS);
    }

    #[test]
    fn backoff_grows_with_count() {
        let mut rng = StdRng::seed_from_u64(1);
        let first = calculate_backoff_with_rng(0, BackoffConfig::default(), &mut rng);
        let mut rng = StdRng::seed_from_u64(1);
        let later = calculate_backoff_with_rng(4, BackoffConfig::default(), &mut rng);
        assert!(later >= first);
    }

    #[test]
    fn connection_backoff_resets_after_success() {
        let mut backoff = ConnectionBackoff::default();
        backoff.next_delay();
        backoff.next_delay();
        backoff.penalize();
        assert_eq!(backoff.attempt(), 3);
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
    }
}
