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

//! Supervisor for a multi-process NCCL all-reduce soak test.
//!
//! Each rank discovers its local device from hostname collisions, joins a
//! communicator through an identifier broadcast by rank 0, then issues
//! all-reduces in the foreground while a watchdog thread polls the
//! communicator for asynchronous errors and aborts it when one shows up.

pub mod collective;
pub mod collective_loop;
pub mod config;
pub mod cuda;
pub mod device;
pub mod error;
pub mod handle;
pub mod logger;
#[cfg(feature = "mpi")]
pub mod mpi;
pub mod nccl;
pub mod process_group;
pub mod session;
pub mod shutdown;
pub mod signal;
pub mod sim;
pub mod supervisor;
pub mod topology;
pub mod watchdog;

pub use error::{Error, Result};
