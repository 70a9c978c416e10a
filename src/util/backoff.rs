//! Deadline-bounded polling with exponential backoff.
use std::thread;
use std::time::{Duration, Instant};

/// Doubling interval generator capped at `ceiling`.
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    ceiling: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, ceiling: Duration) -> Self {
        Backoff {
            next: initial.min(ceiling),
            ceiling,
        }
    }

    pub fn next_interval(&mut self) -> Duration {
        let cur = self.next;
        self.next = (self.next * 2).min(self.ceiling);
        cur
    }
}

/// Call `check` until it returns true or `timeout` elapses.
///
/// Sleeps never overshoot the deadline, so the call returns no later than
/// `timeout` plus the duration of one `check`. Returns `Ok(true)` when the
/// condition was met, `Ok(false)` on timeout; errors from `check` abort the loop.
pub fn poll_until<E, F>(timeout: Duration, mut backoff: Backoff, mut check: F) -> Result<bool, E>
where
    F: FnMut() -> Result<bool, E>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check()? {
            return Ok(true);
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(false);
        }
        let sleep = backoff.next_interval().min(deadline - now);
        thread::sleep(sleep);
    }
}
