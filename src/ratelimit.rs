//! Sliding-window request limiter shared by all geocoding workers.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::trace;

/// Grants at most `max_per_window` acquisitions in any rolling window
/// (one second by default).
///
/// Waiters are not queued fairly; whichever worker re-checks first after
/// the oldest grant leaves the window gets the slot.
pub struct RateLimiter {
    max_per_window: usize,
    window: Duration,
    grants: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    /// `qps` requests per rolling second; values below one are raised to one.
    pub fn per_second(qps: usize) -> Self {
        Self::new(qps, Duration::from_secs(1))
    }

    pub fn new(max_per_window: usize, window: Duration) -> Self {
        let max_per_window = max_per_window.max(1);
        Self {
            max_per_window,
            window,
            grants: Mutex::new(VecDeque::with_capacity(max_per_window)),
        }
    }

    pub fn max_per_window(&self) -> usize {
        self.max_per_window
    }

    /// Wait until a request may be issued, then record it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut grants = self.grants.lock().await;
                let now = Instant::now();
                while let Some(&oldest) = grants.front() {
                    if now.duration_since(oldest) >= self.window {
                        grants.pop_front();
                    } else {
                        break;
                    }
                }

                if grants.len() < self.max_per_window {
                    grants.push_back(now);
                    return;
                }
                let oldest = grants.front().copied().unwrap_or(now);
                self.window.saturating_sub(now.duration_since(oldest))
            };

            trace!("Rate limit reached, waiting {:?}", wait);
            tokio::time::sleep(wait).await;
        }
    }
}
