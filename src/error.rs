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

use crate::handle::State;

use std::fmt;
use std::panic::Location;

use thiserror::Error;

/// Which collaborator a failed call belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    /// process-group primitives (rank discovery, all-gather, broadcast)
    Bootstrap,
    /// device selection, allocation and streams
    Device,
    /// the collective-communication library
    Collective,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Category::Bootstrap => "MPI",
            Category::Device => "Cuda",
            Category::Collective => "NCCL",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed: {category} error {location} '{message}' ({call} returned {code})")]
    Call {
        category: Category,
        call: &'static str,
        code: i32,
        message: String,
        location: &'static Location<'static>,
    },

    #[error("Failed: NCCL error {location} 'communicator is {state}'")]
    Unavailable {
        state: State,
        location: &'static Location<'static>,
    },

    #[error("Failed: {0} f32 elements do not fit in one device buffer")]
    ElementCount(usize),

    #[error("Failed: rank {rank} is invalid for group size {size}")]
    InvalidRank { rank: usize, size: usize },

    #[error("Failed: could not load {path}: {source}")]
    Library {
        path: String,
        #[source]
        source: libloading::Error,
    },

    #[error("Failed: {0}")]
    Unsupported(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Build a collaborator failure located at the caller.
    #[track_caller]
    pub fn call(category: Category, call: &'static str, code: i32, message: impl Into<String>) -> Self {
        Error::Call {
            category,
            call,
            code,
            message: message.into(),
            location: Location::caller(),
        }
    }

    #[track_caller]
    pub fn bootstrap(call: &'static str, code: i32, message: impl Into<String>) -> Self {
        Self::call(Category::Bootstrap, call, code, message)
    }

    #[track_caller]
    pub fn device(call: &'static str, code: i32, message: impl Into<String>) -> Self {
        Self::call(Category::Device, call, code, message)
    }

    #[track_caller]
    pub fn collective(call: &'static str, code: i32, message: impl Into<String>) -> Self {
        Self::call(Category::Collective, call, code, message)
    }

    /// The communicator is no longer usable, located at the caller.
    #[track_caller]
    pub fn unavailable(state: State) -> Self {
        Error::Unavailable {
            state,
            location: Location::caller(),
        }
    }

    pub fn category(&self) -> Option<Category> {
        match self {
            Error::Call { category, .. } => Some(*category),
            Error::Unavailable { .. } => Some(Category::Collective),
            _ => None,
        }
    }

    /// Process exit status for this failure.
    ///
    /// Bootstrap failures surface the process-group's own error code so the
    /// job scheduler can tell them apart; everything else exits with 1.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Call {
                category: Category::Bootstrap,
                code,
                ..
            } => (*code).clamp(1, 255),
            _ => 1,
        }
    }
}
