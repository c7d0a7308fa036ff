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

//! NCCL, loaded from a shared object at run time.

use crate::collective::{AsyncError, Collective};
use crate::device::{DeviceBuffer, Stream};
use crate::error::{Error, Result};
use crate::session::{SessionId, SESSION_ID_BYTES};

use libloading::Library;
use static_assertions::const_assert;

use std::ffi::{c_char, c_int, c_void, CStr};

type NcclResult = c_int;

const NCCL_SUCCESS: NcclResult = 0;
const NCCL_INVALID_ARGUMENT: NcclResult = 4;
const NCCL_IN_PROGRESS: NcclResult = 7;

const NCCL_FLOAT32: c_int = 7;
const NCCL_SUM: c_int = 0;

const NCCL_UNIQUE_ID_BYTES: usize = 128;

#[repr(C)]
#[derive(Clone, Copy)]
struct NcclUniqueId {
    internal: [c_char; NCCL_UNIQUE_ID_BYTES],
}

const_assert!(std::mem::size_of::<NcclUniqueId>() == SESSION_ID_BYTES);

type GetUniqueIdFn = unsafe extern "C" fn(*mut NcclUniqueId) -> NcclResult;
type CommInitRankFn = unsafe extern "C" fn(*mut *mut c_void, c_int, NcclUniqueId, c_int) -> NcclResult;
type AllReduceFn = unsafe extern "C" fn(
    *const c_void,
    *mut c_void,
    usize,
    c_int,
    c_int,
    *mut c_void,
    *mut c_void,
) -> NcclResult;
type CommGetAsyncErrorFn = unsafe extern "C" fn(*mut c_void, *mut NcclResult) -> NcclResult;
type CommFn = unsafe extern "C" fn(*mut c_void) -> NcclResult;
type GetErrorStringFn = unsafe extern "C" fn(NcclResult) -> *const c_char;

/// Live `ncclComm_t`.
#[derive(Debug)]
pub struct NcclComm(*mut c_void);

/// # Safety
///
/// NCCL communicators may be used from any thread as long as calls on one
/// communicator are serialized, which the communication handle guarantees.
unsafe impl Send for NcclComm {}

#[derive(Debug)]
pub struct NcclLibrary {
    _lib_handle: Library,
    get_unique_id: GetUniqueIdFn,
    comm_init_rank: CommInitRankFn,
    all_reduce: AllReduceFn,
    comm_get_async_error: CommGetAsyncErrorFn,
    comm_abort: CommFn,
    comm_destroy: CommFn,
    get_error_string: GetErrorStringFn,
}

/// # Safety
///
/// `lib` must stay loaded for as long as the returned pointer is used and
/// `T` must match the symbol's C signature.
unsafe fn symbol<T: Copy>(lib: &Library, path: &str, name: &str) -> Result<T> {
    lib.get::<T>(name.as_bytes())
        .map(|s| *s)
        .map_err(|source| Error::Library {
            path: format!("{}({})", path, name),
            source,
        })
}

impl NcclLibrary {
    pub fn from_path(path: &str) -> Result<Self> {
        // SAFETY: libnccl has no init routines with preconditions, and every
        // symbol type below matches nccl.h. The Library is stored next to the
        // pointers so it outlives them.
        unsafe {
            let lib = Library::new(path).map_err(|source| Error::Library {
                path: path.to_owned(),
                source,
            })?;
            Ok(Self {
                get_unique_id: symbol(&lib, path, "ncclGetUniqueId")?,
                comm_init_rank: symbol(&lib, path, "ncclCommInitRank")?,
                all_reduce: symbol(&lib, path, "ncclAllReduce")?,
                comm_get_async_error: symbol(&lib, path, "ncclCommGetAsyncError")?,
                comm_abort: symbol(&lib, path, "ncclCommAbort")?,
                comm_destroy: symbol(&lib, path, "ncclCommDestroy")?,
                get_error_string: symbol(&lib, path, "ncclGetErrorString")?,
                _lib_handle: lib,
            })
        }
    }

    fn error_string(&self, r: NcclResult) -> String {
        // SAFETY: ncclGetErrorString returns a static C string or null
        unsafe {
            let s = (self.get_error_string)(r);
            if s.is_null() {
                format!("unknown NCCL result {}", r)
            } else {
                CStr::from_ptr(s).to_string_lossy().into_owned()
            }
        }
    }

    #[track_caller]
    fn check(&self, call: &'static str, r: NcclResult) -> Result<()> {
        if r == NCCL_SUCCESS {
            Ok(())
        } else {
            Err(Error::collective(call, r, self.error_string(r)))
        }
    }
}

impl Collective for NcclLibrary {
    type Comm = NcclComm;

    fn generate_session_id(&self) -> Result<SessionId> {
        let mut id = NcclUniqueId {
            internal: [0; NCCL_UNIQUE_ID_BYTES],
        };
        // SAFETY: id is a valid ncclUniqueId to write into
        let r = unsafe { (self.get_unique_id)(&mut id) };
        self.check("ncclGetUniqueId", r)?;
        Ok(SessionId::from_bytes(id.internal.map(|c| c as u8)))
    }

    fn init_group(&self, size: usize, id: &SessionId, rank: usize) -> Result<NcclComm> {
        let id = NcclUniqueId {
            internal: id.as_bytes().map(|b| b as c_char),
        };
        let mut comm = std::ptr::null_mut();
        // SAFETY: comm is a valid out pointer; the device was selected by the caller
        let r = unsafe { (self.comm_init_rank)(&mut comm, size as c_int, id, rank as c_int) };
        self.check("ncclCommInitRank", r)?;
        Ok(NcclComm(comm))
    }

    fn all_reduce_sum(
        &self,
        comm: &NcclComm,
        send: &DeviceBuffer,
        recv: &mut DeviceBuffer,
        count: usize,
        stream: &Stream,
    ) -> Result<()> {
        if !send.fits_f32(count) || !recv.fits_f32(count) {
            return Err(Error::collective(
                "ncclAllReduce",
                NCCL_INVALID_ARGUMENT,
                format!("{} elements do not fit the buffers", count),
            ));
        }
        // SAFETY: both buffers hold at least `count` f32 values and stay
        // alive until the stream is destroyed
        let r = unsafe {
            (self.all_reduce)(
                send.as_ptr(),
                recv.as_mut_ptr(),
                count,
                NCCL_FLOAT32,
                NCCL_SUM,
                comm.0,
                stream.as_raw(),
            )
        };
        self.check("ncclAllReduce", r)
    }

    fn poll_async_error(&self, comm: &NcclComm) -> Result<Option<AsyncError>> {
        let mut async_result = NCCL_SUCCESS;
        // SAFETY: comm is live and async_result is a valid out pointer
        let r = unsafe { (self.comm_get_async_error)(comm.0, &mut async_result) };
        self.check("ncclCommGetAsyncError", r)?;
        match async_result {
            NCCL_SUCCESS | NCCL_IN_PROGRESS => Ok(None),
            code => Ok(Some(AsyncError {
                code,
                message: self.error_string(code),
            })),
        }
    }

    fn abort(&self, comm: NcclComm) -> Result<()> {
        // SAFETY: comm is live and is never used again
        let r = unsafe { (self.comm_abort)(comm.0) };
        self.check("ncclCommAbort", r)
    }

    fn destroy(&self, comm: NcclComm) -> Result<()> {
        // SAFETY: comm is live and is never used again
        let r = unsafe { (self.comm_destroy)(comm.0) };
        self.check("ncclCommDestroy", r)
    }
}
