use std::cmp::min;
use std::time::Duration;

/// Resend timeout for a reliable frame: starts at the configured initial timeout and grows by a
///  configurable factor (in eighths) on every resend, capped at a maximum.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    current: Duration,

    config_initial: Duration,
    config_max: Duration,
    config_factor_eighths: u32,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration, factor_eighths: u32) -> Self {
        let result = ExponentialBackoff {
            current: min(initial, max),
            config_initial: initial,
            config_max: max,
            config_factor_eighths: factor_eighths,
        };

        assert!(result.config_factor_eighths >= 8);

        result
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    /// returns the timeout to use for the *next* attempt, growing the internal value
    pub fn next_timeout(&mut self) -> Duration {
        let result = self.current;
        self.current = min(self.current * self.config_factor_eighths / 8, self.config_max);
        result
    }

    pub fn reset(&mut self) {
        self.current = min(self.config_initial, self.config_max);
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::doubling(100, 1000, 16, vec![100, 200, 400, 800, 1000, 1000])]
    #[case::factor_1_5(100, 1000, 12, vec![100, 150, 225, 337, 506, 759, 1000])]
    #[case::constant(100, 1000, 8, vec![100, 100, 100])]
    #[case::initial_above_max(2000, 1000, 16, vec![1000, 1000])]
    fn test_next_timeout(#[case] initial_millis: u64, #[case] max_millis: u64, #[case] factor: u32, #[case] expected_millis: Vec<u64>) {
        let mut eb = ExponentialBackoff::new(Duration::from_millis(initial_millis), Duration::from_millis(max_millis), factor);

        for expected in expected_millis {
            assert_eq!(eb.next_timeout().as_millis(), expected as u128);
        }
    }

    #[test]
    fn test_reset() {
        let mut eb = ExponentialBackoff::new(Duration::from_millis(10), Duration::from_millis(1000), 16);
        let _ = eb.next_timeout();
        let _ = eb.next_timeout();
        assert_eq!(eb.current(), Duration::from_millis(40));

        eb.reset();
        assert_eq!(eb.current(), Duration::from_millis(10));
    }
}
