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

//! Accelerator runtime as seen by the supervisor.

use crate::error::Result;

/// Memory region on the selected device.
///
/// Owns the allocation; hand it back to [`Accelerator::free`] to release it.
#[derive(Debug)]
pub struct DeviceBuffer {
    ptr: *mut libc::c_void,
    bytes: usize,
}

/// # Safety
///
/// A device pointer is an address, not host memory; moving it to another
/// thread does not touch the allocation.
unsafe impl Send for DeviceBuffer {}

impl DeviceBuffer {
    /// # Safety
    ///
    /// `ptr` must be a live allocation of at least `bytes` bytes that is not
    /// owned by any other `DeviceBuffer`.
    pub unsafe fn from_raw(ptr: *mut libc::c_void, bytes: usize) -> Self {
        Self { ptr, bytes }
    }

    pub fn as_ptr(&self) -> *const libc::c_void {
        self.ptr
    }

    pub fn as_mut_ptr(&mut self) -> *mut libc::c_void {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.bytes == 0
    }

    /// Whether `count` f32 elements fit, without overflowing the byte count.
    pub fn fits_f32(&self, count: usize) -> bool {
        count
            .checked_mul(std::mem::size_of::<f32>())
            .is_some_and(|bytes| bytes <= self.bytes)
    }

    pub fn into_raw(self) -> *mut libc::c_void {
        self.ptr
    }
}

/// Ordered queue of device operations.
#[derive(Debug)]
pub struct Stream(*mut libc::c_void);

/// # Safety
///
/// Same reasoning as [`DeviceBuffer`]: the handle is an opaque token.
unsafe impl Send for Stream {}

impl Stream {
    /// # Safety
    ///
    /// `raw` must be a stream created by the runtime that will later destroy it.
    pub unsafe fn from_raw(raw: *mut libc::c_void) -> Self {
        Self(raw)
    }

    pub fn as_raw(&self) -> *mut libc::c_void {
        self.0
    }

    pub fn into_raw(self) -> *mut libc::c_void {
        self.0
    }
}

pub trait Accelerator {
    /// Bind the calling thread to device `index`.
    fn select_device(&self, index: usize) -> Result<()>;

    fn allocate(&self, bytes: usize) -> Result<DeviceBuffer>;

    fn create_stream(&self) -> Result<Stream>;

    fn free(&self, buf: DeviceBuffer) -> Result<()>;

    fn destroy_stream(&self, stream: Stream) -> Result<()>;
}

/// Send/receive buffers and the stream used by the collective loop.
#[derive(Debug)]
pub struct DeviceResources {
    pub send: DeviceBuffer,
    pub recv: DeviceBuffer,
    pub stream: Stream,
}

impl DeviceResources {
    /// Allocate two `bytes`-sized buffers and one stream on the selected
    /// device. Whatever was already allocated is released on failure.
    pub fn allocate<A: Accelerator>(acc: &A, bytes: usize) -> Result<Self> {
        let send = acc.allocate(bytes)?;
        let recv = match acc.allocate(bytes) {
            Ok(b) => b,
            Err(e) => {
                release_buffer(acc, send);
                return Err(e);
            }
        };
        let stream = match acc.create_stream() {
            Ok(s) => s,
            Err(e) => {
                release_buffer(acc, send);
                release_buffer(acc, recv);
                return Err(e);
            }
        };
        Ok(Self { send, recv, stream })
    }

    /// Best-effort release; failures are logged, not returned.
    pub fn release<A: Accelerator>(self, acc: &A) {
        release_buffer(acc, self.send);
        release_buffer(acc, self.recv);
        if let Err(e) = acc.destroy_stream(self.stream) {
            log::error!("{}", e);
        }
    }
}

fn release_buffer<A: Accelerator>(acc: &A, buf: DeviceBuffer) {
    if let Err(e) = acc.free(buf) {
        log::error!("{}", e);
    }
}
