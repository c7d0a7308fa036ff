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

use criterion::{criterion_group, criterion_main, Criterion};
use nccl_watchdog::collective::Collective as _;
use nccl_watchdog::device::DeviceResources;
use nccl_watchdog::handle::CommHandle;
use nccl_watchdog::session::SessionId;
use nccl_watchdog::sim::{SimAccelerator, SimCollective};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn criterion_benchmark(c: &mut Criterion) {
    let nccl = Arc::new(SimCollective::default());
    let handle = CommHandle::init(Arc::clone(&nccl), 1, &SessionId::zeroed(), 0).unwrap();
    let acc = SimAccelerator::default();
    let mut res = DeviceResources::allocate(&acc, 1024 * 4).unwrap();

    c.bench_function("check_and_recover", |b| {
        b.iter(|| handle.check_and_recover())
    });

    c.bench_function("all_reduce via get", |b| {
        b.iter(|| {
            handle
                .get(|nccl, comm| {
                    nccl.all_reduce_sum(comm, &res.send, &mut res.recv, 1024, &res.stream)
                })
                .unwrap()
        })
    });

    c.bench_function("all_reduce via get with watchdog", |b| {
        let stop = AtomicBool::new(false);
        let barrier = std::sync::Barrier::new(2);
        std::thread::scope(|s| {
            s.spawn(|| {
                barrier.wait();
                while !stop.load(Ordering::Relaxed) {
                    std::thread::sleep(Duration::from_micros(5));
                    handle.check_and_recover();
                }
            });
            barrier.wait();
            b.iter(|| {
                handle
                    .get(|nccl, comm| {
                        nccl.all_reduce_sum(comm, &res.send, &mut res.recv, 1024, &res.stream)
                    })
                    .unwrap()
            });
            stop.store(true, Ordering::Relaxed);
        });
    });

    res.release(&acc);
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
