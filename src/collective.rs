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

//! Collective-communication library as seen by the supervisor.

use crate::device::{DeviceBuffer, Stream};
use crate::error::Result;
use crate::session::SessionId;

use std::fmt;

/// Error reported by a communicator outside the call that caused it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsyncError {
    pub code: i32,
    pub message: String,
}

impl fmt::Display for AsyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

/// Shared by the collective loop and the watchdog thread. The communicator
/// itself is only ever touched through [`crate::handle::CommHandle`].
pub trait Collective: Send + Sync {
    type Comm: Send;

    /// Create a fresh session identifier. Only the root calls this.
    fn generate_session_id(&self) -> Result<SessionId>;

    /// Join the group identified by `id`. Blocks until every member joins.
    fn init_group(&self, size: usize, id: &SessionId, rank: usize) -> Result<Self::Comm>;

    /// Enqueue an element-wise f32 sum of `count` elements on `stream`.
    fn all_reduce_sum(
        &self,
        comm: &Self::Comm,
        send: &DeviceBuffer,
        recv: &mut DeviceBuffer,
        count: usize,
        stream: &Stream,
    ) -> Result<()>;

    /// `Ok(None)` while the communicator is healthy.
    fn poll_async_error(&self, comm: &Self::Comm) -> Result<Option<AsyncError>>;

    /// Abort outstanding operations and release the communicator.
    fn abort(&self, comm: Self::Comm) -> Result<()>;

    /// Release a healthy communicator.
    fn destroy(&self, comm: Self::Comm) -> Result<()>;
}
