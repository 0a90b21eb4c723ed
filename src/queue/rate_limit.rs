use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// At most `limit` messages are handed to consumers per fixed window
/// of `interval` milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub limit: u64,
    pub interval: u64,
}

impl RateLimit {
    pub fn new(limit: u64, interval: u64) -> Result<Self> {
        if limit == 0 {
            return Err(Error::InvalidRateLimit {
                reason: "limit must be positive",
            });
        }
        if interval == 0 {
            return Err(Error::InvalidRateLimit {
                reason: "interval must be positive",
            });
        }
        Ok(Self { limit, interval })
    }

    /// The index of the window containing `now` (milliseconds).
    #[must_use]
    pub fn window(&self, now: i64) -> u64 { now.max(0).unsigned_abs() / self.interval }

    /// Milliseconds from `now` until the current window rolls over.
    #[must_use]
    pub fn until_next_window(&self, now: i64) -> u64 {
        let next = (self.window(now) + 1) * self.interval;
        next.saturating_sub(now.max(0).unsigned_abs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_positive_values() {
        assert!(matches!(
            RateLimit::new(0, 1000),
            Err(Error::InvalidRateLimit { .. })
        ));
        assert!(RateLimit::new(3, 0).is_err());
    }

    #[test]
    fn windows_are_fixed() {
        let limit = RateLimit::new(3, 10_000).expect("valid");
        assert_eq!(limit.window(0), 0);
        assert_eq!(limit.window(9_999), 0);
        assert_eq!(limit.window(10_000), 1);
        assert_eq!(limit.until_next_window(12_500), 7_500);
        assert_eq!(limit.until_next_window(20_000), 10_000);
    }
}
