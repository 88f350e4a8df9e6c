// UASC for Rust
// SPDX-License-Identifier: MPL-2.0

//! Exponential backoff used for reconnects and for the discovery registration retry loop.

use std::time::Duration;

/// Generator of exponentially growing delays: the delay starts at `initial_sleep`, doubles
/// on every iteration, and is capped at `max_sleep`. With a retry limit the iterator ends
/// after that many delays; without one it runs forever.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    max_sleep: Duration,
    max_retries: Option<u32>,
    current_sleep: Duration,
    retry_count: u32,
}

impl ExponentialBackoff {
    /// Create a new backoff generator.
    pub fn new(
        max_sleep: Duration,
        max_retries: Option<u32>,
        initial_sleep: Duration,
    ) -> Self {
        Self {
            max_sleep,
            max_retries,
            current_sleep: initial_sleep,
            retry_count: 0,
        }
    }
}

impl Iterator for ExponentialBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        if self.max_retries.is_some_and(|max| self.retry_count >= max) {
            return None;
        }

        let next_sleep = self.current_sleep;
        self.current_sleep = self.max_sleep.min(self.current_sleep * 2);
        self.retry_count += 1;
        Some(next_sleep)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_and_caps() {
        let mut backoff = ExponentialBackoff::new(
            Duration::from_secs(8),
            None,
            Duration::from_secs(1),
        );
        assert_eq!(backoff.next(), Some(Duration::from_secs(1)));
        assert_eq!(backoff.next(), Some(Duration::from_secs(2)));
        assert_eq!(backoff.next(), Some(Duration::from_secs(4)));
        assert_eq!(backoff.next(), Some(Duration::from_secs(8)));
        // Capped from here on.
        assert_eq!(backoff.next(), Some(Duration::from_secs(8)));
    }

    #[test]
    fn retry_limit() {
        let backoff = ExponentialBackoff::new(
            Duration::from_secs(8),
            Some(3),
            Duration::from_secs(1),
        );
        assert_eq!(backoff.count(), 3);
    }
}
