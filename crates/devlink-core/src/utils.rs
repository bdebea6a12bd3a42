/*!
 * Utility functions and helpers for devlink.
 *
 * Timeouts, retries and cancellation deadlines.
 */
use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Run a future with a timeout
///
/// # Arguments
///
/// * `duration` - The timeout duration
/// * `future` - The future to run
///
/// # Returns
///
/// The result of the future, or a timeout error if the timeout is reached.
/// Any error type that a core [`Error`] converts into can be used.
pub async fn with_timeout<F, T, E>(duration: Duration, future: F) -> std::result::Result<T, E>
where
    F: Future<Output = std::result::Result<T, E>>,
    E: From<Error>,
{
    match timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(Error::timeout("Operation timed out").into()),
    }
}

/// Run a future with a timeout and retry on failure
///
/// # Arguments
///
/// * `duration` - The timeout duration for each attempt
/// * `retries` - The number of retries
/// * `future_factory` - A function that creates a new future for each retry
///
/// # Returns
///
/// The result of the future, or the last error if all retries fail
pub async fn with_retry<F, Fut, T, E>(
    duration: Duration,
    retries: usize,
    mut future_factory: F,
) -> std::result::Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: From<Error> + fmt::Display,
{
    let mut last_error = None;
    let start = Instant::now();

    for i in 0..=retries {
        if i > 0 {
            debug!("Retry {}/{}", i, retries);
        }

        match with_timeout(duration, future_factory()).await {
            Ok(result) => {
                if i > 0 {
                    debug!("Succeeded after {} retries", i);
                }
                return Ok(result);
            }
            Err(e) => {
                warn!("Attempt {} failed: {}", i + 1, e);
                last_error = Some(e);
            }
        }
    }

    warn!("All {} retries failed after {:?}", retries, start.elapsed());

    Err(last_error.unwrap_or_else(|| Error::other("Unknown error in retry loop").into()))
}

/// A cancellation token that also fires after a fixed duration.
///
/// Dropping the deadline stops its timer; the token itself stays usable.
#[derive(Debug)]
pub struct Deadline {
    token: CancellationToken,
    timer: JoinHandle<()>,
}

impl Deadline {
    /// The token to hand to cancellable operations
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Whether the deadline (or its parent) has fired
    pub fn is_expired(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for Deadline {
    fn drop(&mut self) {
        self.timer.abort();
    }
}

/// Derive a child of `parent` that is cancelled after `duration`.
///
/// Must be called from within a tokio runtime.
pub fn cancel_after(parent: &CancellationToken, duration: Duration) -> Deadline {
    let token = parent.child_token();
    let timer_token = token.clone();
    let timer = tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(duration) => timer_token.cancel(),
            _ = timer_token.cancelled() => {}
        }
    });
    Deadline { token, timer }
}

/// Convert milliseconds to a Duration
pub fn millis_to_duration(millis: u64) -> Duration {
    Duration::from_millis(millis)
}
