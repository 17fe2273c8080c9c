//! Reconnect and re-login backoff
//!
//! Exponential backoff with symmetric jitter, endpoint rotation over the
//! session's candidate realtime endpoints, and an attempt counter that resets
//! once a connection has stayed up for a stability window.

use core::time::Duration;
use std::time::Instant;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::RetryConfig;

// ----------------------------------------------------------------------------
// Backoff
// ----------------------------------------------------------------------------

/// Backoff parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
    /// Fraction of the base delay applied as uniform jitter in both directions
    pub jitter_fraction: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            min_delay_ms: 1_000,
            max_delay_ms: 60_000,
            backoff_factor: 2.0,
            jitter_fraction: 0.2,
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            min_delay_ms: config.min_delay_ms,
            max_delay_ms: config.max_delay_ms,
            backoff_factor: config.backoff_factor,
            jitter_fraction: config.jitter_fraction,
        }
    }
}

impl RetryPolicy {
    /// `min(min_delay * factor^attempt, max_delay)` in milliseconds, before jitter
    pub fn base_delay_ms(&self, attempt: u32) -> f64 {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw = self.min_delay_ms as f64 * self.backoff_factor.powi(exponent);
        if raw.is_finite() {
            raw.min(self.max_delay_ms as f64)
        } else {
            self.max_delay_ms as f64
        }
    }

    /// Jittered delay for the given attempt, never negative
    pub fn delay<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_delay_ms(attempt);
        let jitter = self.jitter_fraction.abs();
        let factor = if jitter > 0.0 {
            1.0 + rng.gen_range(-jitter..=jitter)
        } else {
            1.0
        };
        let ms = (base * factor).max(0.0);
        Duration::from_millis(ms.round() as u64)
    }

    /// Bounds the jittered delay for `attempt` always falls within
    pub fn delay_bounds(&self, attempt: u32) -> (Duration, Duration) {
        let base = self.base_delay_ms(attempt);
        let jitter = self.jitter_fraction.abs();
        let low = (base * (1.0 - jitter)).max(0.0);
        let high = base * (1.0 + jitter);
        (
            Duration::from_millis(low.floor() as u64),
            Duration::from_millis(high.ceil() as u64),
        )
    }
}

// ----------------------------------------------------------------------------
// Endpoint Rotation
// ----------------------------------------------------------------------------

/// Round-robin cursor over candidate endpoints
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointRotation {
    endpoints: Vec<String>,
    index: usize,
}

impl EndpointRotation {
    pub fn new(endpoints: Vec<String>) -> Self {
        Self {
            endpoints,
            index: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn current(&self) -> Option<&str> {
        self.endpoints.get(self.index).map(String::as_str)
    }

    /// Move to the next endpoint, wrapping around
    pub fn advance(&mut self) -> Option<&str> {
        if self.endpoints.is_empty() {
            return None;
        }
        self.index = (self.index + 1) % self.endpoints.len();
        self.current()
    }

    /// Replace the candidate list, keeping the cursor on the same endpoint when present
    pub fn replace(&mut self, endpoints: Vec<String>) {
        let current = self.current().map(str::to_string);
        self.index = current
            .and_then(|c| endpoints.iter().position(|e| *e == c))
            .unwrap_or(0);
        self.endpoints = endpoints;
    }
}

// ----------------------------------------------------------------------------
// Attempt Tracking
// ----------------------------------------------------------------------------

/// Consecutive-failure counter with stability reset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptTracker {
    attempt: u32,
    stable_window: Duration,
    connected_at: Option<Instant>,
}

impl AttemptTracker {
    pub fn new(stable_window: Duration) -> Self {
        Self {
            attempt: 0,
            stable_window,
            connected_at: None,
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn stable_window(&self) -> Duration {
        self.stable_window
    }

    /// Record a failed or dropped connection and return the new attempt count
    pub fn record_failure(&mut self, now: Instant) -> u32 {
        if self.is_stable(now) {
            self.attempt = 0;
        }
        self.connected_at = None;
        self.attempt = self.attempt.saturating_add(1);
        self.attempt
    }

    pub fn record_connected(&mut self, now: Instant) {
        self.connected_at = Some(now);
    }

    /// Deadline after which the current connection counts as stable
    pub fn stable_deadline(&self) -> Option<Instant> {
        self.connected_at.map(|at| at + self.stable_window)
    }

    pub fn is_stable(&self, now: Instant) -> bool {
        self.stable_deadline().is_some_and(|deadline| now >= deadline)
    }

    /// Reset the counter if the connection has survived the stability window
    pub fn reset_if_stable(&mut self, now: Instant) -> bool {
        if self.attempt > 0 && self.is_stable(now) {
            self.attempt = 0;
            return true;
        }
        false
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
        self.connected_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_base_delay_grows_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.base_delay_ms(0), 1_000.0);
        assert_eq!(policy.base_delay_ms(1), 2_000.0);
        assert_eq!(policy.base_delay_ms(5), 32_000.0);
        assert_eq!(policy.base_delay_ms(6), 60_000.0);
        assert_eq!(policy.base_delay_ms(u32::MAX), 60_000.0);
    }

    #[test]
    fn test_jittered_delay_within_bounds() {
        let policy = RetryPolicy::default();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        for attempt in 0..10 {
            let (low, high) = policy.delay_bounds(attempt);
            for _ in 0..50 {
                let delay = policy.delay(attempt, &mut rng);
                assert!(delay >= low && delay <= high, "{attempt}: {delay:?}");
            }
        }
    }

    #[test]
    fn test_no_jitter_is_deterministic() {
        let policy = RetryPolicy {
            jitter_fraction: 0.0,
            ..RetryPolicy::default()
        };
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        assert_eq!(policy.delay(2, &mut rng), Duration::from_millis(4_000));
    }

    #[test]
    fn test_oversized_jitter_clamps_at_zero() {
        let policy = RetryPolicy {
            jitter_fraction: 3.0,
            ..RetryPolicy::default()
        };
        let (low, _) = policy.delay_bounds(0);
        assert_eq!(low, Duration::ZERO);
    }

    #[test]
    fn test_endpoint_rotation_wraps() {
        let mut rotation = EndpointRotation::new(vec!["a".into(), "b".into(), "c".into()]);
        assert_eq!(rotation.current(), Some("a"));
        assert_eq!(rotation.advance(), Some("b"));
        assert_eq!(rotation.advance(), Some("c"));
        assert_eq!(rotation.advance(), Some("a"));

        let mut empty = EndpointRotation::default();
        assert_eq!(empty.advance(), None);
    }

    #[test]
    fn test_endpoint_replace_keeps_cursor() {
        let mut rotation = EndpointRotation::new(vec!["a".into(), "b".into()]);
        rotation.advance();
        rotation.replace(vec!["x".into(), "b".into()]);
        assert_eq!(rotation.current(), Some("b"));
        rotation.replace(vec!["y".into()]);
        assert_eq!(rotation.current(), Some("y"));
    }

    #[test]
    fn test_attempts_reset_after_stable_window() {
        let start = Instant::now();
        let mut tracker = AttemptTracker::new(Duration::from_secs(30));
        assert_eq!(tracker.record_failure(start), 1);
        assert_eq!(tracker.record_failure(start), 2);

        tracker.record_connected(start);
        assert!(!tracker.reset_if_stable(start + Duration::from_secs(10)));
        assert_eq!(tracker.attempt(), 2);

        // A drop before the window keeps counting
        assert_eq!(tracker.record_failure(start + Duration::from_secs(10)), 3);

        tracker.record_connected(start);
        assert!(tracker.reset_if_stable(start + Duration::from_secs(31)));
        assert_eq!(tracker.attempt(), 0);
    }

    #[test]
    fn test_failure_after_stable_connection_starts_over() {
        let start = Instant::now();
        let mut tracker = AttemptTracker::new(Duration::from_secs(30));
        tracker.record_failure(start);
        tracker.record_failure(start);
        tracker.record_connected(start);
        assert_eq!(tracker.record_failure(start + Duration::from_secs(60)), 1);
    }
}
