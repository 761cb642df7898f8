//! Exponential backoff shared by both geocoding clients.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

/// Outcome of one attempt
pub enum Attempt<T, E> {
    /// Terminal outcome, returned as-is
    Done(T),
    /// Transient failure; try again if attempts remain
    Retry(E),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, multiplier: f64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            multiplier,
        }
    }

    /// Interactive geocoder default: 5 attempts, 250ms doubling
    pub fn interactive() -> Self {
        Self::new(5, Duration::from_millis(250), 2.0)
    }

    /// Bulk submissions: few, slow attempts
    pub fn batch() -> Self {
        Self::new(2, Duration::from_secs(2), 2.0)
    }

    /// Delay after the given zero-based failed attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .mul_f64(self.multiplier.powi(attempt as i32))
    }

    /// Run `op` until it reports `Done` or attempts run out.
    ///
    /// `op` receives the zero-based attempt number. On exhaustion the last
    /// transient failure is returned as `Err`.
    pub async fn run<T, E, F, Fut>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Attempt<T, E>>,
    {
        let mut attempt = 0;
        loop {
            match op(attempt).await {
                Attempt::Done(value) => return Ok(value),
                Attempt::Retry(err) => {
                    if attempt + 1 >= self.max_attempts {
                        return Err(err);
                    }
                    let delay = self.delay_for(attempt);
                    debug!(
                        "Attempt {}/{} failed, retrying in {:?}",
                        attempt + 1,
                        self.max_attempts,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::interactive()
    }
}
