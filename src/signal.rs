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

//! Turns SIGTERM/SIGINT into a cancelled [`ShutdownToken`].
//!
//! The first signal starts an orderly shutdown: the collective loop and the
//! watchdog notice the token at their next pause and the supervisor releases
//! everything it owns. The process exits with status 0 straight away when a
//! second signal arrives or when the orderly shutdown outlives its grace
//! period, e.g. because a rank is stuck inside a blocking library call.

use crate::error::Result;
use crate::shutdown::ShutdownToken;

use log::{error, info, warn};
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::oneshot;
use tokio::time::Instant;

use std::time::Duration;

#[derive(Debug)]
pub struct TerminationHandler {
    rt: tokio::runtime::Runtime,
    worker: Option<tokio::task::JoinHandle<()>>,
    stop_signal: Option<oneshot::Sender<()>>,
}

impl TerminationHandler {
    pub fn install(shutdown: ShutdownToken, grace: Duration) -> Result<Self> {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("termination-handler")
            .enable_all()
            .build()?;
        // signal streams register with the runtime's driver
        let (term, int) = {
            let _guard = rt.enter();
            (
                signal(SignalKind::terminate())?,
                signal(SignalKind::interrupt())?,
            )
        };
        let (tx, rx) = oneshot::channel::<()>();
        let handle = rt.spawn(main_loop(term, int, shutdown, grace, rx));
        Ok(Self {
            rt,
            worker: Some(handle),
            stop_signal: Some(tx),
        })
    }
}

impl std::ops::Drop for TerminationHandler {
    fn drop(&mut self) {
        if let Some(stop_signal) = self.stop_signal.take() {
            let _ = stop_signal.send(());
        }
        if let Some(handle) = self.worker.take() {
            if let Err(e) = self.rt.block_on(handle) {
                error!("termination handler task failed: {}", e);
            }
        }
    }
}

async fn main_loop(
    mut term: Signal,
    mut int: Signal,
    shutdown: ShutdownToken,
    grace: Duration,
    mut stop: oneshot::Receiver<()>,
) {
    let mut deadline = None;
    loop {
        let signum = tokio::select! {
            _ = term.recv() => libc::SIGTERM,
            _ = int.recv() => libc::SIGINT,
            _ = grace_expired(deadline) => {
                warn!("orderly shutdown did not finish within {:?}. exit.", grace);
                exit_now();
            }
            _ = &mut stop => return,
        };
        info!("receive signal {}. exit.", signum);
        if shutdown.is_cancelled() {
            exit_now();
        }
        shutdown.cancel();
        deadline = Some(Instant::now() + grace);
    }
}

/// Never completes until the first signal set a deadline.
async fn grace_expired(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn exit_now() -> ! {
    log::logger().flush();
    std::process::exit(0)
}
