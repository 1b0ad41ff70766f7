//! # Exponential Backoff
//!
//! Capped exponential backoff used by the work queue for failed items.
//!
//! Each failed attempt doubles the delay until the cap is reached; a
//! successful attempt drops the state (the queue removes the entry in
//! `forget`), so the next failure starts back at the minimum. Every queue
//! key gets its own independent backoff state, so one flapping resource
//! never slows down retries for the others.
//!
//! Default sequence with 1s min and 5m max: 1s, 2s, 4s, 8s, ... 300s (max).

use std::time::Duration;

/// Exponential backoff calculator.
///
/// `next_backoff()` returns the current delay and advances the sequence.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Upper bound the sequence saturates at.
    max: Duration,
    /// Delay the next failure will be charged.
    current: Duration,
}

impl ExponentialBackoff {
    /// Create a backoff starting at `min` and saturating at `max`.
    #[must_use]
    pub fn new(min: Duration, max: Duration) -> Self {
        Self { max, current: min }
    }

    /// Get the next delay and advance the sequence, saturating at the cap.
    pub fn next_backoff(&mut self) -> Duration {
        let result = self.current;
        self.current = std::cmp::min(self.current.saturating_mul(2), self.max);
        result
    }
}

impl Default for ExponentialBackoff {
    /// 1 second minimum, 5 minute cap.
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(300))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_sequence_doubles() {
        let mut backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(300));

        assert_eq!(backoff.next_backoff(), Duration::from_secs(1));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(2));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(4));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(8));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(16));
    }

    #[test]
    fn test_backoff_saturates_at_cap() {
        let mut backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(10));

        assert_eq!(backoff.next_backoff(), Duration::from_secs(1));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(2));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(4));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(8));
        // 16s exceeds the 10s cap
        assert_eq!(backoff.next_backoff(), Duration::from_secs(10));
        // Should stay at max
        assert_eq!(backoff.next_backoff(), Duration::from_secs(10));
    }

    #[test]
    fn test_backoff_independent_state() {
        // Each key keeps its own sequence position
        let mut backoff1 = ExponentialBackoff::default();
        let mut backoff2 = ExponentialBackoff::default();

        assert_eq!(backoff1.next_backoff(), Duration::from_secs(1));
        assert_eq!(backoff1.next_backoff(), Duration::from_secs(2));
        assert_eq!(backoff1.next_backoff(), Duration::from_secs(4));

        assert_eq!(backoff2.next_backoff(), Duration::from_secs(1));
        assert_eq!(backoff2.next_backoff(), Duration::from_secs(2));
    }
}
