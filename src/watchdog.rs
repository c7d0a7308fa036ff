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

use crate::collective::Collective;
use crate::error::Result;
use crate::handle::{CommHandle, Recovery};
use crate::shutdown::ShutdownToken;

use log::error;

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// What the watchdog saw over its lifetime.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogReport {
    pub polls: usize,
    pub healthy: usize,
    pub aborts: usize,
    pub poll_failures: usize,
}

impl WatchdogReport {
    fn record(&mut self, r: &Recovery) {
        match r {
            Recovery::Healthy => {
                self.polls += 1;
                self.healthy += 1;
            }
            Recovery::Aborted { .. } => {
                self.polls += 1;
                self.aborts += 1;
            }
            Recovery::PollFailed => {
                self.polls += 1;
                self.poll_failures += 1;
            }
            Recovery::Inactive(_) => {}
        }
    }
}

/// Background thread polling a [`CommHandle`] for asynchronous errors.
///
/// Runs until [`Watchdog::stop`] is called, the handle is dropped, or the
/// shared shutdown token is cancelled. Dropping the watchdog stops and joins
/// the thread.
#[derive(Debug)]
pub struct Watchdog {
    worker: Option<JoinHandle<WatchdogReport>>,
    stop_signal: ShutdownToken,
}

impl Watchdog {
    pub fn spawn<C>(
        handle: Arc<CommHandle<C>>,
        interval: Duration,
        shutdown: ShutdownToken,
    ) -> Result<Self>
    where
        C: Collective + 'static,
    {
        let stop_signal = ShutdownToken::new();
        let stop_signal_clone = stop_signal.clone();
        let worker = thread::Builder::new()
            .name(String::from("nccl-watchdog"))
            .spawn(move || main_loop(&handle, interval, &stop_signal_clone, &shutdown))?;
        Ok(Self {
            worker: Some(worker),
            stop_signal,
        })
    }

    /// Stop polling and wait for the thread to exit.
    pub fn stop(mut self) -> WatchdogReport {
        self.join()
    }

    fn join(&mut self) -> WatchdogReport {
        self.stop_signal.cancel();
        match self.worker.take().map(JoinHandle::join) {
            Some(Ok(report)) => report,
            Some(Err(_)) => {
                error!("watchdog thread panicked");
                WatchdogReport::default()
            }
            None => WatchdogReport::default(),
        }
    }
}

impl std::ops::Drop for Watchdog {
    fn drop(&mut self) {
        let _ = self.join();
    }
}

fn main_loop<C: Collective>(
    handle: &CommHandle<C>,
    interval: Duration,
    stop: &ShutdownToken,
    shutdown: &ShutdownToken,
) -> WatchdogReport {
    let mut report = WatchdogReport::default();
    while !shutdown.is_cancelled() {
        report.record(&handle.check_and_recover());
        if stop.sleep(interval) {
            break;
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::State;
    use crate::session::SessionId;
    use crate::sim::SimCollective;

    use std::sync::atomic::Ordering;
    use std::time::Instant;

    fn wait_for<F: Fn() -> bool>(f: F) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !f() {
            assert!(Instant::now() < deadline, "timed out");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn aborts_once_after_two_quiet_polls() {
        let nccl = Arc::new(SimCollective::with_fault_on_poll(Some(3)));
        let handle =
            Arc::new(CommHandle::init(Arc::clone(&nccl), 1, &SessionId::zeroed(), 0).unwrap());
        let watchdog = Watchdog::spawn(
            Arc::clone(&handle),
            Duration::from_millis(1),
            ShutdownToken::new(),
        )
        .unwrap();

        wait_for(|| handle.state() == State::Aborted);
        // keep polling a while past the abort
        thread::sleep(Duration::from_millis(20));
        let report = watchdog.stop();

        assert_eq!(report.healthy, 2);
        assert_eq!(report.aborts, 1);
        assert_eq!(report.polls, 3);
        assert_eq!(nccl.stats().polls.load(Ordering::Acquire), 3);
        assert_eq!(nccl.stats().aborts.load(Ordering::Acquire), 1);
    }

    #[test]
    fn stops_on_shutdown() {
        let nccl = Arc::new(SimCollective::default());
        let handle =
            Arc::new(CommHandle::init(Arc::clone(&nccl), 1, &SessionId::zeroed(), 0).unwrap());
        let shutdown = ShutdownToken::new();
        let watchdog =
            Watchdog::spawn(Arc::clone(&handle), Duration::from_millis(1), shutdown.clone())
                .unwrap();

        wait_for(|| nccl.stats().polls.load(Ordering::Acquire) >= 5);
        shutdown.cancel();
        // the thread exits by itself; stop only joins it
        let report = watchdog.stop();
        assert!(report.polls >= 5);
        assert_eq!(report.aborts, 0);
        assert_eq!(handle.state(), State::Live);
    }
}
