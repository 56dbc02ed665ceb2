// SPDX-FileCopyrightText: 2026 The nftrace-rs Authors
// SPDX-License-Identifier: GPL-3.0-or-later

//! The root cancellation token (§5). Every long-lived worker loop owns a
//! clone and checks it at its one external blocking point — the ~1s read
//! deadline on its socket/reader, per Design Notes §9. A `Condvar` lets
//! waiters that aren't polling a fd (the TTL sweeper) wake immediately
//! instead of on their next tick.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new((Mutex::new(false), Condvar::new())),
        }
    }

    pub fn cancel(&self) {
        let (lock, cvar) = &*self.inner;
        let mut cancelled = lock.lock().expect("cancel lock poisoned");
        *cancelled = true;
        cvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.0.lock().expect("cancel lock poisoned")
    }

    /// Blocks up to `timeout` or until cancellation, whichever comes
    /// first. Returns true if cancellation was observed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (lock, cvar) = &*self.inner;
        let guard = lock.lock().expect("cancel lock poisoned");
        if *guard {
            return true;
        }
        let (guard, _) = cvar
            .wait_timeout(guard, timeout)
            .expect("cancel lock poisoned");
        *guard
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn wait_timeout_returns_false_when_not_cancelled() {
        let tok = CancellationToken::new();
        assert!(!tok.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn cancel_wakes_waiters_immediately() {
        let tok = CancellationToken::new();
        let tok2 = tok.clone();

        let handle = thread::spawn(move || tok2.wait_timeout(Duration::from_secs(5)));

        thread::sleep(Duration::from_millis(20));
        tok.cancel();

        assert!(handle.join().unwrap());
    }

    #[test]
    fn is_cancelled_reflects_state() {
        let tok = CancellationToken::new();
        assert!(!tok.is_cancelled());
        tok.cancel();
        assert!(tok.is_cancelled());
    }
}
