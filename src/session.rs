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
use crate::error::Result;
use crate::process_group::ProcessGroup;

use std::fmt;

/// Size of `ncclUniqueId`.
pub const SESSION_ID_BYTES: usize = 128;

/// Rank that generates the session identifier.
pub const ROOT_RANK: usize = 0;

/// Opaque token naming one communicator instance across the group.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionId([u8; SESSION_ID_BYTES]);

impl SessionId {
    pub fn zeroed() -> Self {
        Self([0; SESSION_ID_BYTES])
    }

    pub fn from_bytes(bytes: [u8; SESSION_ID_BYTES]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SESSION_ID_BYTES] {
        &self.0
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8; SESSION_ID_BYTES] {
        &mut self.0
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId(")?;
        for b in &self.0[..8] {
            write!(f, "{:02x}", b)?;
        }
        write!(f, "..)")
    }
}

/// Generate the session identifier at the root and broadcast it.
///
/// Generation finishes before the broadcast is issued, and every member
/// returns only after the broadcast completed, so all members hold the same
/// bytes before any communicator is created.
pub fn exchange<P, C>(group: &P, collective: &C) -> Result<SessionId>
where
    P: ProcessGroup,
    C: Collective,
{
    let mut id = if group.rank() == ROOT_RANK {
        collective.generate_session_id()?
    } else {
        SessionId::zeroed()
    };
    group.broadcast(id.as_bytes_mut(), ROOT_RANK)?;
    log::debug!("[Rank {}] received session id {:?}", group.rank(), id);
    Ok(id)
}
