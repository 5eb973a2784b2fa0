//! Exponential backoff shared by everything that talks to the archive.

use std::time::Duration;

/// Backoff schedule: 1s, 2s, 4s, ... capped at one hour.
///
/// The archive fails in bursts (maintenance windows, rate clamping), so both
/// the index query and the page fetch sleep through failures on the same
/// schedule rather than inventing their own.
#[derive(Debug, Clone)]
pub struct Backoff {
    next: u64,
    cap: u64,
    failures: u32,
}

impl Backoff {
    pub fn new() -> Self {
        Self {
            next: 1,
            cap: 3600,
            failures: 0,
        }
    }

    /// Number of consecutive failures recorded so far.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Record a failure and sleep for the current interval.
    pub async fn sleep(&mut self) {
        self.failures += 1;
        let delay = Duration::from_secs(self.next);
        self.next = (self.next * 2).min(self.cap);
        tokio::time::sleep(delay).await;
    }

    /// Peek at the delay the next [`sleep`](Self::sleep) would incur.
    pub fn current_delay(&self) -> Duration {
        Duration::from_secs(self.next)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_to_cap() {
        let mut b = Backoff::new();
        let mut seen = Vec::new();
        for _ in 0..15 {
            seen.push(b.current_delay().as_secs());
            // Advance without actually sleeping.
            b.failures += 1;
            b.next = (b.next * 2).min(b.cap);
        }
        assert_eq!(&seen[..5], &[1, 2, 4, 8, 16]);
        assert_eq!(*seen.last().unwrap(), 3600);
        assert_eq!(b.failures(), 15);
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_advances_schedule() {
        let mut b = Backoff::new();
        b.sleep().await;
        b.sleep().await;
        assert_eq!(b.failures(), 2);
        assert_eq!(b.current_delay(), Duration::from_secs(4));
    }
}
