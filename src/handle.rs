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

//! Exclusive owner of the live communicator.
//!
//! Every call that touches the communicator (issuing a collective, polling
//! for asynchronous errors, abort, destroy) runs under one mutex, so the
//! watchdog and the collective loop never use it at the same time. The
//! communicator never leaves this type: callers get it only inside a
//! closure passed to [`CommHandle::get`].

use crate::collective::{AsyncError, Collective};
use crate::error::{Error, Result};
use crate::session::SessionId;

use log::{debug, error, warn};

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Lifecycle of the communicator owned by a [`CommHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Live,
    Aborted,
    Destroyed,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            State::Live => "live",
            State::Aborted => "aborted",
            State::Destroyed => "destroyed",
        };
        f.write_str(s)
    }
}

enum Lifecycle<T> {
    Live(T),
    Aborted,
    Destroyed,
}

impl<T> Lifecycle<T> {
    fn state(&self) -> State {
        match self {
            Lifecycle::Live(_) => State::Live,
            Lifecycle::Aborted => State::Aborted,
            Lifecycle::Destroyed => State::Destroyed,
        }
    }
}

/// Outcome of one [`CommHandle::check_and_recover`] call.
#[derive(Debug, Clone, PartialEq)]
pub enum Recovery {
    /// no asynchronous error pending
    Healthy,
    /// an asynchronous error was found and the communicator was aborted
    Aborted { error: AsyncError, elapsed: Duration },
    /// the poll itself failed; the communicator was left alone
    PollFailed,
    /// nothing to poll, the communicator is already gone
    Inactive(State),
}

pub struct CommHandle<C: Collective> {
    rank: usize,
    collective: Arc<C>,
    comm: Mutex<Lifecycle<C::Comm>>,
}

impl<C: Collective> CommHandle<C> {
    /// Join the group. Every member must call this with the same `id`.
    pub fn init(collective: Arc<C>, size: usize, id: &SessionId, rank: usize) -> Result<Self> {
        let comm = collective.init_group(size, id, rank)?;
        debug!("[Rank {}] communicator initialized ({} ranks)", rank, size);
        Ok(Self {
            rank,
            collective,
            comm: Mutex::new(Lifecycle::Live(comm)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Lifecycle<C::Comm>> {
        self.comm.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> State {
        self.lock().state()
    }

    /// Run `f` against the live communicator while holding the lock.
    ///
    /// Fails with [`Error::Unavailable`] once the communicator was aborted
    /// or destroyed. `f` should only enqueue work; the lock is held for the
    /// whole call.
    #[track_caller]
    pub fn get<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&C, &C::Comm) -> Result<R>,
    {
        let lg = self.lock();
        match &*lg {
            Lifecycle::Live(comm) => f(&self.collective, comm),
            other => Err(Error::unavailable(other.state())),
        }
    }

    /// Poll for an asynchronous error and abort the communicator if one is
    /// pending. Never fails; everything is reported through the log.
    ///
    /// No replacement communicator is created, so after an abort every
    /// [`CommHandle::get`] fails.
    pub fn check_and_recover(&self) -> Recovery {
        let mut lg = self.lock();
        let comm = match std::mem::replace(&mut *lg, Lifecycle::Aborted) {
            Lifecycle::Live(comm) => comm,
            other => {
                let state = other.state();
                *lg = other;
                return Recovery::Inactive(state);
            }
        };

        let async_error = match self.collective.poll_async_error(&comm) {
            Ok(None) => {
                *lg = Lifecycle::Live(comm);
                return Recovery::Healthy;
            }
            Ok(Some(e)) => e,
            Err(e) => {
                *lg = Lifecycle::Live(comm);
                error!("[Rank {}] {}", self.rank, e);
                return Recovery::PollFailed;
            }
        };

        error!(
            "[Rank {}] ncclCommGetAsyncError result: {}",
            self.rank, async_error
        );
        warn!("[Rank {}] ncclCommAbort starts!", self.rank);
        let start = Instant::now();
        let aborted = self.collective.abort(comm);
        let elapsed = start.elapsed();
        if let Err(e) = aborted {
            // the communicator was handed over either way; it is gone
            error!("[Rank {}] {}", self.rank, e);
        }
        warn!(
            "[Rank {}] ncclCommAbort finishes! Time elapsed = {:.2} ms.",
            self.rank,
            elapsed.as_secs_f64() * 1e3
        );
        Recovery::Aborted {
            error: async_error,
            elapsed,
        }
    }

    /// Release the communicator. Only a live communicator is handed to the
    /// library; after an abort or an earlier destroy this does nothing.
    pub fn destroy(&self) -> Result<()> {
        let mut lg = self.lock();
        match std::mem::replace(&mut *lg, Lifecycle::Destroyed) {
            Lifecycle::Live(comm) => self.collective.destroy(comm),
            Lifecycle::Aborted => {
                debug!("[Rank {}] communicator already aborted", self.rank);
                Ok(())
            }
            Lifecycle::Destroyed => Ok(()),
        }
    }
}

impl<C: Collective> Drop for CommHandle<C> {
    fn drop(&mut self) {
        if let Err(e) = self.destroy() {
            error!("[Rank {}] {}", self.rank, e);
        }
    }
}

impl<C: Collective> fmt::Debug for CommHandle<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommHandle")
            .field("rank", &self.rank)
            .field("state", &self.state())
            .finish()
    }
}
