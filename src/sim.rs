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

//! In-process stand-ins for the three collaborators.
//!
//! `LocalGroup` members are threads of one process, `SimAccelerator` hands
//! out host memory and `SimCollective` hands out instrumented communicators
//! that can be told to report an asynchronous error. They back the unit
//! tests and the binary's `--simulate` mode.

use crate::collective::{AsyncError, Collective};
use crate::device::{Accelerator, DeviceBuffer, Stream};
use crate::error::{Error, Result};
use crate::process_group::ProcessGroup;
use crate::session::{SessionId, SESSION_ID_BYTES};

use rand::Rng as _;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex, PoisonError};
use std::time::Duration;

// error codes mirror the libraries being simulated
const MPI_ERR_ROOT: i32 = 7;
const MPI_ERR_TRUNCATE: i32 = 15;
const CUDA_ERROR_MEMORY_ALLOCATION: i32 = 2;
const CUDA_ERROR_INVALID_DEVICE: i32 = 101;
const NCCL_INVALID_ARGUMENT: i32 = 4;
const NCCL_REMOTE_ERROR: i32 = 6;

#[derive(Debug)]
struct Exchange {
    barrier: Barrier,
    slots: Mutex<Vec<u64>>,
    payload: Mutex<Vec<u8>>,
    broadcast_error: Option<i32>,
    finalized: AtomicUsize,
}

/// One member of a group whose members are threads of this process.
#[derive(Debug)]
pub struct LocalGroup {
    rank: usize,
    size: usize,
    shared: Arc<Exchange>,
}

impl LocalGroup {
    /// Members `0..size`, to be driven from `size` different threads.
    pub fn create_world(size: usize) -> Vec<Self> {
        Self::build_world(size, None)
    }

    /// Like [`LocalGroup::create_world`], but every broadcast fails with `code`.
    pub fn create_world_failing_broadcast(size: usize, code: i32) -> Vec<Self> {
        Self::build_world(size, Some(code))
    }

    fn build_world(size: usize, broadcast_error: Option<i32>) -> Vec<Self> {
        let shared = Arc::new(Exchange {
            barrier: Barrier::new(size),
            slots: Mutex::new(vec![0; size]),
            payload: Mutex::new(Vec::new()),
            broadcast_error,
            finalized: AtomicUsize::new(0),
        });
        (0..size)
            .map(|rank| LocalGroup {
                rank,
                size,
                shared: Arc::clone(&shared),
            })
            .collect()
    }

    /// Observer of the whole world that outlives its members.
    pub fn view(&self) -> WorldView {
        WorldView(Arc::clone(&self.shared))
    }
}

#[derive(Debug, Clone)]
pub struct WorldView(Arc<Exchange>);

impl WorldView {
    /// Members that called `finalize` so far.
    pub fn finalized(&self) -> usize {
        self.0.finalized.load(Ordering::Acquire)
    }
}

impl ProcessGroup for LocalGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn all_gather(&self, local: u64) -> Result<Vec<u64>> {
        let shared = &self.shared;
        shared.slots.lock().unwrap_or_else(PoisonError::into_inner)[self.rank] = local;
        shared.barrier.wait();
        let all = shared
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        // nobody may overwrite a slot before everyone has read it
        shared.barrier.wait();
        Ok(all)
    }

    fn broadcast(&self, buf: &mut [u8], root: usize) -> Result<()> {
        let shared = &self.shared;
        if let Some(code) = shared.broadcast_error {
            return Err(Error::bootstrap("MPI_Bcast", code, "injected broadcast failure"));
        }
        if root >= self.size {
            return Err(Error::bootstrap("MPI_Bcast", MPI_ERR_ROOT, "invalid root"));
        }

        if self.rank == root {
            *shared.payload.lock().unwrap_or_else(PoisonError::into_inner) = buf.to_vec();
        }
        shared.barrier.wait();
        let result = if self.rank == root {
            Ok(())
        } else {
            let payload = shared.payload.lock().unwrap_or_else(PoisonError::into_inner);
            if payload.len() == buf.len() {
                buf.copy_from_slice(&payload);
                Ok(())
            } else {
                Err(Error::bootstrap(
                    "MPI_Bcast",
                    MPI_ERR_TRUNCATE,
                    format!("expected {} bytes, root sent {}", buf.len(), payload.len()),
                ))
            }
        };
        shared.barrier.wait();
        result
    }

    fn finalize(self) -> Result<()> {
        self.shared.finalized.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

/// Accelerator backed by host memory.
#[derive(Debug)]
pub struct SimAccelerator {
    device_count: usize,
    selected: Mutex<Option<usize>>,
    live_allocations: AtomicUsize,
    live_streams: AtomicUsize,
}

impl SimAccelerator {
    pub fn new(device_count: usize) -> Self {
        Self {
            device_count,
            selected: Mutex::new(None),
            live_allocations: AtomicUsize::new(0),
            live_streams: AtomicUsize::new(0),
        }
    }

    pub fn selected_device(&self) -> Option<usize> {
        *self.selected.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn live_allocations(&self) -> usize {
        self.live_allocations.load(Ordering::Acquire)
    }

    pub fn live_streams(&self) -> usize {
        self.live_streams.load(Ordering::Acquire)
    }
}

impl Default for SimAccelerator {
    fn default() -> Self {
        Self::new(8)
    }
}

impl Accelerator for SimAccelerator {
    fn select_device(&self, index: usize) -> Result<()> {
        if index >= self.device_count {
            return Err(Error::device(
                "cudaSetDevice",
                CUDA_ERROR_INVALID_DEVICE,
                "invalid device ordinal",
            ));
        }
        *self.selected.lock().unwrap_or_else(PoisonError::into_inner) = Some(index);
        Ok(())
    }

    fn allocate(&self, bytes: usize) -> Result<DeviceBuffer> {
        // SAFETY: calloc with a non-zero size; null is handled below
        let ptr = unsafe { libc::calloc(bytes.max(1), 1) };
        if ptr.is_null() {
            return Err(Error::device(
                "cudaMalloc",
                CUDA_ERROR_MEMORY_ALLOCATION,
                "out of memory",
            ));
        }
        self.live_allocations.fetch_add(1, Ordering::AcqRel);
        // SAFETY: fresh allocation of `bytes` bytes owned by nobody else
        Ok(unsafe { DeviceBuffer::from_raw(ptr, bytes) })
    }

    fn create_stream(&self) -> Result<Stream> {
        let raw = Box::into_raw(Box::new(0u64));
        self.live_streams.fetch_add(1, Ordering::AcqRel);
        // SAFETY: released in destroy_stream via Box::from_raw
        Ok(unsafe { Stream::from_raw(raw.cast()) })
    }

    fn free(&self, buf: DeviceBuffer) -> Result<()> {
        // SAFETY: every DeviceBuffer handed out by this accelerator came from calloc
        unsafe { libc::free(buf.into_raw()) };
        self.live_allocations.fetch_sub(1, Ordering::AcqRel);
        Ok(())
    }

    fn destroy_stream(&self, stream: Stream) -> Result<()> {
        // SAFETY: every Stream handed out by this accelerator is a leaked Box<u64>
        drop(unsafe { Box::from_raw(stream.into_raw().cast::<u64>()) });
        self.live_streams.fetch_sub(1, Ordering::AcqRel);
        Ok(())
    }
}

/// Communicator handed out by [`SimCollective`].
#[derive(Debug)]
pub struct SimComm {
    rank: usize,
    polls: AtomicUsize,
}

impl SimComm {
    pub fn rank(&self) -> usize {
        self.rank
    }
}

/// Counters shared by every communicator of one [`SimCollective`].
#[derive(Debug, Default)]
pub struct SimStats {
    pub polls: AtomicUsize,
    pub reductions: AtomicUsize,
    pub aborts: AtomicUsize,
    pub destroys: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl SimStats {
    /// Highest number of communicator calls that ever ran at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::Acquire)
    }
}

struct InFlight<'a>(&'a SimStats);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Collective library that moves no data. Every call touching a
/// communicator is counted, and overlapping calls are recorded so tests can
/// prove the handle serializes them.
#[derive(Debug, Default)]
pub struct SimCollective {
    fault_on_poll: Option<usize>,
    op_latency: Duration,
    generated: Mutex<Vec<SessionId>>,
    stats: SimStats,
}

impl SimCollective {
    /// Each communicator reports an asynchronous error on its `poll`-th poll
    /// (1-based). `None` never faults.
    pub fn with_fault_on_poll(poll: Option<usize>) -> Self {
        Self {
            fault_on_poll: poll,
            ..Default::default()
        }
    }

    /// Make every communicator call take at least `latency`.
    pub fn op_latency(mut self, latency: Duration) -> Self {
        self.op_latency = latency;
        self
    }

    pub fn stats(&self) -> &SimStats {
        &self.stats
    }

    pub fn generated_ids(&self) -> Vec<SessionId> {
        self.generated
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn enter(&self) -> InFlight<'_> {
        let now = self.stats.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.stats.max_in_flight.fetch_max(now, Ordering::AcqRel);
        if !self.op_latency.is_zero() {
            std::thread::sleep(self.op_latency);
        }
        InFlight(&self.stats)
    }
}

impl Collective for SimCollective {
    type Comm = SimComm;

    fn generate_session_id(&self) -> Result<SessionId> {
        let mut bytes = [0u8; SESSION_ID_BYTES];
        rand::rng().fill(&mut bytes[..]);
        let id = SessionId::from_bytes(bytes);
        self.generated
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(id.clone());
        Ok(id)
    }

    fn init_group(&self, size: usize, _id: &SessionId, rank: usize) -> Result<SimComm> {
        if rank >= size {
            return Err(Error::collective(
                "ncclCommInitRank",
                NCCL_INVALID_ARGUMENT,
                "invalid rank",
            ));
        }
        Ok(SimComm {
            rank,
            polls: AtomicUsize::new(0),
        })
    }

    fn all_reduce_sum(
        &self,
        _comm: &SimComm,
        send: &DeviceBuffer,
        recv: &mut DeviceBuffer,
        count: usize,
        _stream: &Stream,
    ) -> Result<()> {
        let _in_flight = self.enter();
        if !send.fits_f32(count) || !recv.fits_f32(count) {
            return Err(Error::collective(
                "ncclAllReduce",
                NCCL_INVALID_ARGUMENT,
                format!("{} elements do not fit the buffers", count),
            ));
        }
        self.stats.reductions.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn poll_async_error(&self, comm: &SimComm) -> Result<Option<AsyncError>> {
        let _in_flight = self.enter();
        self.stats.polls.fetch_add(1, Ordering::AcqRel);
        let n = comm.polls.fetch_add(1, Ordering::AcqRel) + 1;
        if self.fault_on_poll == Some(n) {
            return Ok(Some(AsyncError {
                code: NCCL_REMOTE_ERROR,
                message: String::from("remote process exited or there was a network error"),
            }));
        }
        Ok(None)
    }

    fn abort(&self, _comm: SimComm) -> Result<()> {
        let _in_flight = self.enter();
        self.stats.aborts.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn destroy(&self, _comm: SimComm) -> Result<()> {
        let _in_flight = self.enter();
        self.stats.destroys.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}
