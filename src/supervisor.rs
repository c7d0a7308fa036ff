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

//! Runs one rank from bootstrap to orderly release.

use crate::collective::Collective;
use crate::collective_loop::CollectiveLoop;
use crate::config::Config;
use crate::device::{Accelerator, DeviceResources};
use crate::error::{Error, Result};
use crate::handle::CommHandle;
use crate::process_group::ProcessGroup;
use crate::session;
use crate::shutdown::ShutdownToken;
use crate::topology::{self, ProcessIdentity};
use crate::watchdog::{Watchdog, WatchdogReport};

use log::{debug, error, info};

use std::sync::Arc;

/// Summary of a rank that shut down in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub identity: ProcessIdentity,
    pub iterations: usize,
    pub watchdog: WatchdogReport,
}

#[derive(Debug)]
pub struct Supervisor<A, C> {
    config: Config,
    accelerator: A,
    collective: Arc<C>,
    shutdown: ShutdownToken,
}

impl<A, C> Supervisor<A, C>
where
    A: Accelerator,
    C: Collective + 'static,
{
    pub fn new(config: Config, accelerator: A, collective: Arc<C>, shutdown: ShutdownToken) -> Self {
        Self {
            config,
            accelerator,
            collective,
            shutdown,
        }
    }

    /// Bootstrap over `group`, then soak until the shutdown token is
    /// cancelled, the iteration bound is reached or a collective fails.
    ///
    /// Device resources and the communicator are released on every path
    /// that got far enough to create them.
    pub fn run<P: ProcessGroup>(&self, group: P, hostname: &str) -> Result<Report> {
        let buffer_bytes = self
            .config
            .buffer_bytes()
            .ok_or(Error::ElementCount(self.config.element_count))?;
        let identity = topology::discover(&group, hostname)?;
        let id = session::exchange(&group, &*self.collective)?;
        // the bootstrap transport must not outlive the setup phase
        group.finalize()?;
        debug!(
            "[Rank {}] bootstrap done, using device {}",
            identity.rank, identity.local_device_index
        );

        self.accelerator
            .select_device(identity.local_device_index)?;
        let mut res = DeviceResources::allocate(&self.accelerator, buffer_bytes)?;

        let handle = match CommHandle::init(
            Arc::clone(&self.collective),
            identity.group_size,
            &id,
            identity.rank,
        ) {
            Ok(h) => Arc::new(h),
            Err(e) => {
                res.release(&self.accelerator);
                return Err(e);
            }
        };

        let watchdog = match Watchdog::spawn(
            Arc::clone(&handle),
            self.config.watchdog_interval,
            self.shutdown.clone(),
        ) {
            Ok(w) => w,
            Err(e) => {
                res.release(&self.accelerator);
                if let Err(e) = handle.destroy() {
                    error!("[Rank {}] {}", identity.rank, e);
                }
                return Err(e);
            }
        };

        let looped = CollectiveLoop::from_config(&self.config).run(&handle, &mut res, &self.shutdown);

        let watchdog = watchdog.stop();
        res.release(&self.accelerator);
        let destroyed = handle.destroy();

        let iterations = looped?;
        destroyed?;
        info!("[Rank {}] Success", identity.rank);
        Ok(Report {
            identity,
            iterations,
            watchdog,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::State;
    use crate::sim::{LocalGroup, SimAccelerator, SimCollective};

    use std::sync::atomic::Ordering;
    use std::thread;
    use std::time::Duration;

    fn test_config(collective_interval: Duration, max_iterations: Option<usize>) -> Config {
        Config {
            element_count: 256,
            collective_interval,
            max_iterations,
            watchdog_interval: Duration::from_millis(5),
            ..Default::default()
        }
    }

    fn run_world(
        world: Vec<LocalGroup>,
        config: &Config,
        nccl: &Arc<SimCollective>,
        shutdown: &ShutdownToken,
    ) -> Vec<(Result<Report>, SimAccelerator)> {
        thread::scope(|s| {
            let ranks: Vec<_> = world
                .into_iter()
                .map(|group| {
                    let sup = Supervisor::new(
                        config.clone(),
                        SimAccelerator::default(),
                        Arc::clone(nccl),
                        shutdown.clone(),
                    );
                    s.spawn(move || {
                        let r = sup.run(group, "node-a.cluster");
                        (r, sup.accelerator)
                    })
                })
                .collect();
            ranks.into_iter().map(|h| h.join().unwrap()).collect()
        })
    }

    #[test]
    fn bounded_run_releases_everything() {
        let world = LocalGroup::create_world(2);
        let world_view = world[0].view();
        let nccl = Arc::new(SimCollective::default());
        let config = test_config(Duration::from_millis(1), Some(5));

        let results = run_world(world, &config, &nccl, &ShutdownToken::new());

        let mut devices = Vec::new();
        for (r, acc) in results {
            let report = r.unwrap();
            assert_eq!(report.iterations, 5);
            assert_eq!(report.identity.group_size, 2);
            devices.push(report.identity.local_device_index);
            assert_eq!(acc.selected_device(), Some(report.identity.local_device_index));
            assert_eq!(acc.live_allocations(), 0);
            assert_eq!(acc.live_streams(), 0);
        }
        devices.sort();
        assert_eq!(devices, vec![0, 1]);
        assert_eq!(world_view.finalized(), 2);
        assert_eq!(nccl.stats().reductions.load(Ordering::Acquire), 10);
        assert_eq!(nccl.stats().destroys.load(Ordering::Acquire), 2);
        assert_eq!(nccl.stats().aborts.load(Ordering::Acquire), 0);
    }

    #[test]
    fn async_fault_fails_the_next_collective() {
        let nccl = Arc::new(SimCollective::with_fault_on_poll(Some(3)));
        let config = test_config(Duration::from_millis(50), None);

        let mut results = run_world(
            LocalGroup::create_world(1),
            &config,
            &nccl,
            &ShutdownToken::new(),
        );
        let (r, acc) = results.remove(0);

        let err = r.unwrap_err();
        assert!(matches!(err, Error::Unavailable { state: State::Aborted, .. }));
        assert_eq!(err.exit_code(), 1);
        assert_eq!(nccl.stats().aborts.load(Ordering::Acquire), 1);
        // aborted communicators are never destroyed
        assert_eq!(nccl.stats().destroys.load(Ordering::Acquire), 0);
        assert_eq!(acc.live_allocations(), 0);
        assert_eq!(acc.live_streams(), 0);
    }

    #[test]
    fn broadcast_failure_exits_with_collaborator_code() {
        let nccl = Arc::new(SimCollective::default());
        let config = test_config(Duration::from_millis(1), Some(1));

        let results = run_world(
            LocalGroup::create_world_failing_broadcast(2, 13),
            &config,
            &nccl,
            &ShutdownToken::new(),
        );

        for (r, acc) in results {
            assert_eq!(r.unwrap_err().exit_code(), 13);
            assert_eq!(acc.selected_device(), None);
            assert_eq!(acc.live_allocations(), 0);
        }
        assert_eq!(nccl.stats().reductions.load(Ordering::Acquire), 0);
    }

    #[test]
    fn oversized_element_count_is_rejected_before_bootstrap() {
        let nccl = Arc::new(SimCollective::default());
        let mut config = test_config(Duration::from_millis(1), Some(1));
        config.element_count = 1 << 62;

        let world = LocalGroup::create_world(2);
        let world_view = world[0].view();
        let results = run_world(world, &config, &nccl, &ShutdownToken::new());

        for (r, acc) in results {
            assert!(matches!(r.unwrap_err(), Error::ElementCount(n) if n == 1 << 62));
            assert_eq!(acc.selected_device(), None);
            assert_eq!(acc.live_allocations(), 0);
        }
        assert_eq!(world_view.finalized(), 0);
        assert!(nccl.generated_ids().is_empty());
    }

    #[test]
    fn termination_mid_iteration_shuts_down_in_order() {
        let nccl = Arc::new(SimCollective::default());
        let config = test_config(Duration::from_millis(200), None);
        let shutdown = ShutdownToken::new();

        let (r, acc) = thread::scope(|s| {
            let sup = Supervisor::new(
                config,
                SimAccelerator::default(),
                Arc::clone(&nccl),
                shutdown.clone(),
            );
            let h = s.spawn(move || {
                let group = LocalGroup::create_world(1).remove(0);
                let r = sup.run(group, "node-a");
                (r, sup.accelerator)
            });
            while nccl.stats().reductions.load(Ordering::Acquire) == 0 {
                thread::sleep(Duration::from_millis(1));
            }
            shutdown.cancel();
            h.join().unwrap()
        });

        let report = r.unwrap();
        assert_eq!(report.iterations, 1);
        assert_eq!(nccl.stats().reductions.load(Ordering::Acquire), 1);
        assert_eq!(nccl.stats().destroys.load(Ordering::Acquire), 1);
        assert_eq!(acc.live_allocations(), 0);
        assert_eq!(acc.live_streams(), 0);
    }
}
