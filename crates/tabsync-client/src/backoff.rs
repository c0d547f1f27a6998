use std::time::Duration;

pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(250);
pub const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(10);

/// Exponential backoff: `base * factor^(attempt-1)`, capped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub factor: u32,
    pub cap: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: DEFAULT_BACKOFF_BASE,
            factor: 2,
            cap: DEFAULT_BACKOFF_CAP,
        }
    }
}

impl Backoff {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let mut delay = self.base;
        for _ in 1..attempt {
            delay = self.next(delay);
            if delay == self.cap {
                break;
            }
        }
        delay.min(self.cap)
    }

    pub fn next(&self, current: Duration) -> Duration {
        let next = current.saturating_mul(self.factor.max(1));
        if next > self.cap {
            self.cap
        } else {
            next
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_until_the_cap() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay(1), Duration::from_millis(250));
        assert_eq!(backoff.delay(2), Duration::from_millis(500));
        assert_eq!(backoff.delay(3), Duration::from_secs(1));
        assert_eq!(backoff.delay(20), Duration::from_secs(10));
        assert_eq!(backoff.next(Duration::from_secs(8)), Duration::from_secs(10));
    }
}
