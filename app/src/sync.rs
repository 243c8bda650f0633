use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Counting semaphore used as a one-way hand-off between the engine
/// thread (which signals) and a blocked waiter.
#[derive(Debug, Default)]
pub struct Rendezvous {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Rendezvous {
    pub fn new(initial: usize) -> Self {
        Self {
            count: Mutex::new(initial),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, usize> {
        // A plain counter stays consistent even if a holder panicked.
        self.count.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn signal(&self) {
        let mut count = self.lock();
        *count += 1;
        self.cond.notify_one();
    }

    /// Block until a signal is available, then consume it.
    pub fn wait(&self) {
        let mut count = self.lock();
        while *count == 0 {
            count = self
                .cond
                .wait(count)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        *count -= 1;
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`. Returns whether a
    /// signal was consumed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.lock();
        while *count == 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            count = self
                .cond
                .wait_timeout(count, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
        *count -= 1;
        true
    }
}
