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

//! MPI world as the process group.
//!
//! The MPI runtime aborts the job on communication errors by default, so the
//! only failure reported here is initialization.

use crate::error::{Error, Result};
use crate::process_group::ProcessGroup;

use ::mpi::environment::Universe;
use ::mpi::topology::SimpleCommunicator;
use ::mpi::traits::*;

pub struct MpiGroup {
    world: SimpleCommunicator,
    universe: Universe,
}

impl MpiGroup {
    /// Initialize MPI. Fails if it was initialized before in this process.
    pub fn initialize() -> Result<Self> {
        let universe = ::mpi::initialize()
            .ok_or_else(|| Error::bootstrap("MPI_Init", 1, "MPI is already initialized"))?;
        let world = universe.world();
        Ok(Self { world, universe })
    }
}

impl std::fmt::Debug for MpiGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MpiGroup")
            .field("rank", &self.world.rank())
            .field("size", &self.world.size())
            .finish()
    }
}

impl ProcessGroup for MpiGroup {
    fn rank(&self) -> usize {
        self.world.rank() as usize
    }

    fn size(&self) -> usize {
        self.world.size() as usize
    }

    fn all_gather(&self, local: u64) -> Result<Vec<u64>> {
        let mut all = vec![0u64; self.size()];
        self.world.all_gather_into(&local, &mut all[..]);
        Ok(all)
    }

    fn broadcast(&self, buf: &mut [u8], root: usize) -> Result<()> {
        let size = self.size();
        if root >= size {
            return Err(Error::InvalidRank { rank: root, size });
        }
        self.world.process_at_rank(root as i32).broadcast_into(buf);
        Ok(())
    }

    fn finalize(self) -> Result<()> {
        let Self { world, universe } = self;
        drop(world);
        // MPI_Finalize
        drop(universe);
        Ok(())
    }
}
