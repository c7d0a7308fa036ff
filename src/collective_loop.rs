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
use crate::config::Config;
use crate::device::DeviceResources;
use crate::error::Result;
use crate::handle::CommHandle;
use crate::shutdown::ShutdownToken;

use std::time::Duration;

/// Foreground soak loop: one all-reduce per iteration, then a pause.
///
/// Any error from issuing the collective ends the loop immediately; there is
/// no retry here.
#[derive(Debug, Clone)]
pub struct CollectiveLoop {
    count: usize,
    interval: Duration,
    max_iterations: Option<usize>,
}

impl CollectiveLoop {
    pub fn new(count: usize, interval: Duration, max_iterations: Option<usize>) -> Self {
        Self {
            count,
            interval,
            max_iterations,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.element_count,
            config.collective_interval,
            config.max_iterations,
        )
    }

    /// Returns the number of collectives issued once the token is cancelled
    /// or the iteration bound is reached.
    pub fn run<C: Collective>(
        &self,
        handle: &CommHandle<C>,
        res: &mut DeviceResources,
        shutdown: &ShutdownToken,
    ) -> Result<usize> {
        let mut iterations = 0;
        while self.max_iterations.is_none_or(|max| iterations < max) {
            if shutdown.is_cancelled() {
                break;
            }
            handle.get(|nccl, comm| {
                nccl.all_reduce_sum(comm, &res.send, &mut res.recv, self.count, &res.stream)
            })?;
            iterations += 1;
            if shutdown.sleep(self.interval) {
                break;
            }
        }
        Ok(iterations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::handle::{Recovery, State};
    use crate::session::SessionId;
    use crate::sim::{SimAccelerator, SimCollective};

    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    const COUNT: usize = 256;

    fn setup(
        nccl: SimCollective,
    ) -> (
        Arc<SimCollective>,
        CommHandle<SimCollective>,
        SimAccelerator,
        DeviceResources,
    ) {
        let nccl = Arc::new(nccl);
        let handle = CommHandle::init(Arc::clone(&nccl), 1, &SessionId::zeroed(), 0).unwrap();
        let acc = SimAccelerator::default();
        let res = DeviceResources::allocate(&acc, COUNT * 4).unwrap();
        (nccl, handle, acc, res)
    }

    #[test]
    fn bounded_loop_issues_exact_count() {
        let (nccl, handle, acc, mut res) = setup(SimCollective::default());
        let l = CollectiveLoop::new(COUNT, Duration::from_millis(1), Some(7));
        assert_eq!(l.run(&handle, &mut res, &ShutdownToken::new()).unwrap(), 7);
        assert_eq!(nccl.stats().reductions.load(Ordering::Acquire), 7);
        res.release(&acc);
    }

    #[test]
    fn cancelled_token_issues_nothing() {
        let (nccl, handle, acc, mut res) = setup(SimCollective::default());
        let token = ShutdownToken::new();
        token.cancel();
        let l = CollectiveLoop::new(COUNT, Duration::from_millis(1), None);
        assert_eq!(l.run(&handle, &mut res, &token).unwrap(), 0);
        assert_eq!(nccl.stats().reductions.load(Ordering::Acquire), 0);
        res.release(&acc);
    }

    #[test]
    fn oversized_count_fails_fast() {
        let (nccl, handle, acc, mut res) = setup(SimCollective::default());
        let l = CollectiveLoop::new(COUNT + 1, Duration::from_millis(1), None);
        let err = l.run(&handle, &mut res, &ShutdownToken::new()).unwrap_err();
        assert!(matches!(err, Error::Call { call: "ncclAllReduce", .. }));
        assert_eq!(nccl.stats().reductions.load(Ordering::Acquire), 0);
        res.release(&acc);
    }

    #[test]
    fn aborted_handle_fails_fast() {
        let (_nccl, handle, acc, mut res) = setup(SimCollective::with_fault_on_poll(Some(1)));
        assert!(matches!(
            handle.check_and_recover(),
            Recovery::Aborted { .. }
        ));
        let l = CollectiveLoop::new(COUNT, Duration::from_millis(1), None);
        let err = l.run(&handle, &mut res, &ShutdownToken::new()).unwrap_err();
        assert!(matches!(err, Error::Unavailable { state: State::Aborted, .. }));
        res.release(&acc);
    }

    #[test]
    fn cancel_mid_iteration_stops_before_next_collective() {
        let (nccl, handle, acc, mut res) = setup(SimCollective::default());
        let token = ShutdownToken::new();
        let l = CollectiveLoop::new(COUNT, Duration::from_millis(200), None);

        let issued = std::thread::scope(|s| {
            let h = s.spawn(|| l.run(&handle, &mut res, &token));
            while nccl.stats().reductions.load(Ordering::Acquire) == 0 {
                std::thread::sleep(Duration::from_millis(1));
            }
            // the loop is now in its pause
            token.cancel();
            h.join().unwrap().unwrap()
        });

        assert_eq!(issued, 1);
        assert_eq!(nccl.stats().reductions.load(Ordering::Acquire), 1);
        res.release(&acc);
    }
}
