//! Bounded retry with a fixed delay and cooperative cancellation.

use std::{
    sync::{Arc, Condvar, Mutex, PoisonError},
    time::Duration,
};

use log::{error, warn};

use crate::error::WarehouseError;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(1000);

/// How often an operation is tried and how long to wait between tries. No backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            delay: DEFAULT_RETRY_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Result<Self, String> {
        if max_attempts == 0 {
            return Err("max attempts must be at least 1".to_string());
        }
        Ok(Self {
            max_attempts,
            delay,
        })
    }
}

/// Shared cancellation flag. Clones observe the same state.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (flag, signal) = &*self.inner;
        *flag.lock().unwrap_or_else(PoisonError::into_inner) = true;
        signal.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Waits up to `delay`, returning early with `true` once cancelled.
    pub fn wait(&self, delay: Duration) -> bool {
        let (flag, signal) = &*self.inner;
        let guard = flag.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = signal
            .wait_timeout_while(guard, delay, |cancelled| !*cancelled)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

/// Successful result together with the attempt that produced it (1-based).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempted<T> {
    pub value: T,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryError {
    Exhausted { attempts: u32, last: WarehouseError },
    Cancelled,
}

/// Runs `op` until it succeeds or `policy.max_attempts` is used up, waiting
/// `policy.delay` between attempts. `op` receives the 1-based attempt number.
pub fn retry<T, F>(
    policy: &RetryPolicy,
    cancel: &CancelToken,
    label: &str,
    mut op: F,
) -> Result<Attempted<T>, RetryError>
where
    F: FnMut(u32) -> Result<T, WarehouseError>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }
        match op(attempt) {
            Ok(value) => {
                return Ok(Attempted {
                    value,
                    attempts: attempt,
                });
            }
            Err(err) => {
                warn!("{label}: attempt {attempt}/{max_attempts} failed: {err}");
                if attempt >= max_attempts {
                    error!("{label}: giving up after {max_attempts} attempt(s)");
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last: err,
                    });
                }
            }
        }
        if cancel.wait(policy.delay) {
            return Err(RetryError::Cancelled);
        }
        attempt += 1;
    }
}
