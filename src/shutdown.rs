// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

#[derive(Debug, Default)]
struct Inner {
    cancelled: Mutex<bool>,
    wakeup: Condvar,
}

/// Cooperative cancellation shared by the collective loop, the watchdog and
/// the termination handler. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct ShutdownToken {
    inner: Arc<Inner>,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let mut cancelled = self
            .inner
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *cancelled = true;
        self.inner.wakeup.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self
            .inner
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Suspend for `dur`, waking early on cancellation. Returns whether the
    /// token is cancelled.
    pub fn sleep(&self, dur: Duration) -> bool {
        let cancelled = self
            .inner
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let (cancelled, _) = self
            .inner
            .wakeup
            .wait_timeout_while(cancelled, dur, |c| !*c)
            .unwrap_or_else(PoisonError::into_inner);
        *cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn sleep_runs_full_duration_without_cancel() {
        let token = ShutdownToken::new();
        let t = Instant::now();
        assert!(!token.sleep(Duration::from_millis(20)));
        assert!(t.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn cancel_wakes_sleepers() {
        let token = ShutdownToken::new();
        let t = Instant::now();
        std::thread::scope(|s| {
            let sleeper = token.clone();
            let h = s.spawn(move || sleeper.sleep(Duration::from_secs(30)));
            std::thread::sleep(Duration::from_millis(20));
            token.cancel();
            assert!(h.join().unwrap());
        });
        assert!(t.elapsed() < Duration::from_secs(30));
        assert!(token.is_cancelled());
        assert!(token.sleep(Duration::from_secs(30)));
    }
}
