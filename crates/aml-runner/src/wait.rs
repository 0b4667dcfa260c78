use std::thread;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Deadline and polling cadence for the two blocking operations
/// (compute provisioning and run completion). Always supplied by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitOptions {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl WaitOptions {
    pub fn new(timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            timeout,
            poll_interval,
        }
    }
}

pub(crate) enum Poll<T> {
    Ready(T),
    Pending,
}

/// Calls `check` until it yields a value, an error, or the deadline passes.
/// `check` always runs at least once, even with a zero timeout.
pub(crate) fn poll_until<T, F>(operation: &str, wait: &WaitOptions, mut check: F) -> Result<T>
where
    F: FnMut() -> Result<Poll<T>>,
{
    let started = Instant::now();
    // A timeout too large to represent as an Instant never expires.
    let deadline = started.checked_add(wait.timeout);
    loop {
        if let Poll::Ready(value) = check()? {
            return Ok(value);
        }
        let now = Instant::now();
        let pause = match deadline {
            Some(deadline) if now >= deadline => {
                return Err(Error::Timeout {
                    operation: operation.to_string(),
                    waited: started.elapsed(),
                });
            }
            Some(deadline) => wait.poll_interval.min(deadline - now),
            None => wait.poll_interval,
        };
        thread::sleep(pause);
    }
}
