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

//! CUDA runtime, loaded from a shared object at run time.

use crate::device::{Accelerator, DeviceBuffer, Stream};
use crate::error::{Error, Result};

use libloading::Library;

use std::ffi::{c_char, c_int, c_void, CStr};

type CudaError = c_int;

const CUDA_SUCCESS: CudaError = 0;

type SetDeviceFn = unsafe extern "C" fn(c_int) -> CudaError;
type MallocFn = unsafe extern "C" fn(*mut *mut c_void, usize) -> CudaError;
type FreeFn = unsafe extern "C" fn(*mut c_void) -> CudaError;
type StreamCreateFn = unsafe extern "C" fn(*mut *mut c_void) -> CudaError;
type StreamDestroyFn = unsafe extern "C" fn(*mut c_void) -> CudaError;
type GetErrorStringFn = unsafe extern "C" fn(CudaError) -> *const c_char;

#[derive(Debug)]
pub struct CudaRuntime {
    _lib_handle: Library,
    set_device: SetDeviceFn,
    malloc: MallocFn,
    free: FreeFn,
    stream_create: StreamCreateFn,
    stream_destroy: StreamDestroyFn,
    get_error_string: GetErrorStringFn,
}

impl CudaRuntime {
    pub fn from_path(path: &str) -> Result<Self> {
        let library_error = |name: &str| {
            let path = format!("{}({})", path, name);
            move |source: libloading::Error| Error::Library { path, source }
        };
        // SAFETY: every symbol type below matches cuda_runtime_api.h, and
        // the Library is stored next to the pointers so it outlives them.
        unsafe {
            let lib = Library::new(path).map_err(|source| Error::Library {
                path: path.to_owned(),
                source,
            })?;
            let set_device = *lib
                .get::<SetDeviceFn>(b"cudaSetDevice")
                .map_err(library_error("cudaSetDevice"))?;
            let malloc = *lib
                .get::<MallocFn>(b"cudaMalloc")
                .map_err(library_error("cudaMalloc"))?;
            let free = *lib
                .get::<FreeFn>(b"cudaFree")
                .map_err(library_error("cudaFree"))?;
            let stream_create = *lib
                .get::<StreamCreateFn>(b"cudaStreamCreate")
                .map_err(library_error("cudaStreamCreate"))?;
            let stream_destroy = *lib
                .get::<StreamDestroyFn>(b"cudaStreamDestroy")
                .map_err(library_error("cudaStreamDestroy"))?;
            let get_error_string = *lib
                .get::<GetErrorStringFn>(b"cudaGetErrorString")
                .map_err(library_error("cudaGetErrorString"))?;
            Ok(Self {
                _lib_handle: lib,
                set_device,
                malloc,
                free,
                stream_create,
                stream_destroy,
                get_error_string,
            })
        }
    }

    #[track_caller]
    fn check(&self, call: &'static str, r: CudaError) -> Result<()> {
        if r == CUDA_SUCCESS {
            return Ok(());
        }
        // SAFETY: cudaGetErrorString returns a static C string or null
        let message = unsafe {
            let s = (self.get_error_string)(r);
            if s.is_null() {
                format!("unknown CUDA error {}", r)
            } else {
                CStr::from_ptr(s).to_string_lossy().into_owned()
            }
        };
        Err(Error::device(call, r, message))
    }
}

impl Accelerator for CudaRuntime {
    fn select_device(&self, index: usize) -> Result<()> {
        // SAFETY: plain value argument
        let r = unsafe { (self.set_device)(index as c_int) };
        self.check("cudaSetDevice", r)
    }

    fn allocate(&self, bytes: usize) -> Result<DeviceBuffer> {
        let mut ptr = std::ptr::null_mut();
        // SAFETY: ptr is a valid out pointer
        let r = unsafe { (self.malloc)(&mut ptr, bytes) };
        self.check("cudaMalloc", r)?;
        // SAFETY: cudaMalloc succeeded, ptr owns `bytes` bytes of device memory
        Ok(unsafe { DeviceBuffer::from_raw(ptr, bytes) })
    }

    fn create_stream(&self) -> Result<Stream> {
        let mut raw = std::ptr::null_mut();
        // SAFETY: raw is a valid out pointer
        let r = unsafe { (self.stream_create)(&mut raw) };
        self.check("cudaStreamCreate", r)?;
        // SAFETY: cudaStreamCreate succeeded and nobody else holds the stream
        Ok(unsafe { Stream::from_raw(raw) })
    }

    fn free(&self, buf: DeviceBuffer) -> Result<()> {
        // SAFETY: every DeviceBuffer of this runtime came from cudaMalloc
        let r = unsafe { (self.free)(buf.into_raw()) };
        self.check("cudaFree", r)
    }

    fn destroy_stream(&self, stream: Stream) -> Result<()> {
        // SAFETY: every Stream of this runtime came from cudaStreamCreate
        let r = unsafe { (self.stream_destroy)(stream.into_raw()) };
        self.check("cudaStreamDestroy", r)
    }
}
