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

//! Process-launch runtime as seen by the supervisor.
//!
//! Rank and group size are assigned by the launcher and never change. All
//! members must call the collective methods in the same order.

use crate::error::Result;

pub trait ProcessGroup {
    /// This process's rank.
    fn rank(&self) -> usize;

    /// Total number of cooperating processes.
    fn size(&self) -> usize;

    /// Gather one value from every member, ordered by rank.
    fn all_gather(&self, local: u64) -> Result<Vec<u64>>;

    /// Overwrite `buf` on every member with the contents held by `root`.
    fn broadcast(&self, buf: &mut [u8], root: usize) -> Result<()>;

    /// Tear down the bootstrap transport. Consuming `self` makes a second
    /// call impossible.
    fn finalize(self) -> Result<()>
    where
        Self: Sized;
}
