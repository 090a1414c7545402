use std::future::Future;
use std::time::Duration;

use log::info;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// How long and how often [`wait_for`] keeps probing.
///
/// Boot times are unpredictable, so both limits default to unbounded.
#[derive(Debug, Clone)]
pub struct PollOptions {
    pub interval: Duration,
    pub max_attempts: Option<usize>,
    pub timeout: Option<Duration>,
}

impl Default for PollOptions {
    fn default() -> Self {
        PollOptions {
            interval: Duration::from_secs(10),
            max_attempts: None,
            timeout: None,
        }
    }
}

impl PollOptions {
    pub fn every(interval: Duration) -> Self {
        PollOptions {
            interval,
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = Some(attempts);
        self
    }
}

/// Probe `predicate` until it holds.
///
/// The first probe happens immediately. Errors from the predicate are not
/// retried; they end the wait.
pub async fn wait_for<F, Fut>(
    description: &str,
    options: &PollOptions,
    cancel: &CancellationToken,
    mut predicate: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let deadline = options.timeout.map(|timeout| Instant::now() + timeout);
    let mut attempts = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled(description.to_string()));
        }

        attempts += 1;
        if predicate().await? {
            return Ok(());
        }

        info!("Waiting for {} ({} attempts)", description, attempts);

        if let Some(max) = options.max_attempts {
            if attempts >= max {
                return Err(Error::ExhaustedAttempts(attempts));
            }
        }

        let mut wake = Instant::now() + options.interval;
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                return Err(Error::Timeout(description.to_string()));
            }
            wake = wake.min(deadline);
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled(description.to_string())),
            _ = time::sleep_until(wake) => {}
        }
    }
}
