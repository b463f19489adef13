// This file is part of pipework, a process pipeline engine for shells.
// Copyright (C) 2026 The pipework authors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Cancellation of running plans

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

/// Flag that asks a running plan to stop waiting for its stages
///
/// Clones share the same flag, so one clone can be moved to another thread
/// (a signal handling thread, for example) to cancel a plan that the original
/// thread is running. Once set, the flag stays set.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<(Mutex<bool>, Condvar)>);

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the flag and wakes up all waiters.
    pub fn cancel(&self) {
        let (flag, condvar) = &*self.0;
        *flag.lock().unwrap_or_else(PoisonError::into_inner) = true;
        condvar.notify_all();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        let (flag, _) = &*self.0;
        *flag.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Waits until the flag is set or the timeout expires.
    ///
    /// Returns whether the flag is set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (flag, condvar) = &*self.0;
        let guard = flag.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = condvar
            .wait_timeout_while(guard, timeout, |cancelled| !*cancelled)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn wait_times_out_without_cancellation() {
        let token = CancelToken::new();
        assert!(!token.wait_timeout(Duration::from_millis(1)));
        assert!(!token.is_cancelled());
    }

    #[test]
    fn cancel_from_another_thread_wakes_waiter() {
        let token = CancelToken::new();
        let clone = token.clone();
        let start = Instant::now();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            clone.cancel();
        });
        assert!(token.wait_timeout(Duration::from_secs(60)));
        assert!(start.elapsed() < Duration::from_secs(60));
        canceller.join().unwrap();
    }

    #[test]
    fn cancelled_token_returns_immediately() {
        let token = CancelToken::new();
        token.cancel();
        assert!(token.is_cancelled());
        assert!(token.wait_timeout(Duration::from_secs(60)));
    }
}
