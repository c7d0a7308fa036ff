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

use clap::Parser;
use log::{error, info};
use nccl_watchdog::config::{self, Config, CONFIG};
use nccl_watchdog::error::{Error, Result};
use nccl_watchdog::logger;
use nccl_watchdog::shutdown::ShutdownToken;
use nccl_watchdog::signal::TerminationHandler;
use nccl_watchdog::sim::{LocalGroup, SimAccelerator, SimCollective};
use nccl_watchdog::supervisor::{Report, Supervisor};
use nccl_watchdog::topology;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// All-reduce soak test with asynchronous NCCL error detection.
///
/// Flags override the matching NCCL_WATCHDOG_* environment variables.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// f32 elements per device buffer
    #[arg(long)]
    element_count: Option<usize>,

    /// pause between two all-reduces, e.g. `50ms`
    #[arg(long, value_parser = config::parse_duration)]
    collective_interval: Option<Duration>,

    /// pause between two asynchronous error polls, e.g. `10ms`
    #[arg(long, value_parser = config::parse_duration)]
    watchdog_interval: Option<Duration>,

    /// stop after this many all-reduces instead of running until signalled
    #[arg(long)]
    max_iterations: Option<usize>,

    /// time the orderly shutdown gets after the first signal before the
    /// process exits anyway, e.g. `10s`
    #[arg(long, value_parser = config::parse_duration)]
    shutdown_grace: Option<Duration>,

    #[arg(long)]
    nccl_lib: Option<String>,

    #[arg(long)]
    cudart_lib: Option<String>,

    /// run N ranks as threads of this process against simulated libraries
    #[arg(long, value_name = "N")]
    simulate: Option<usize>,

    /// make every simulated communicator report an error on its K-th poll
    #[arg(long, value_name = "K", requires = "simulate")]
    fault_after_polls: Option<usize>,

    /// make every simulated communicator call take at least this long
    #[arg(long, value_parser = config::parse_duration, requires = "simulate")]
    op_latency: Option<Duration>,
}

impl Cli {
    fn apply(&self, mut config: Config) -> Config {
        if let Some(n) = self.element_count {
            config.element_count = n;
        }
        if let Some(d) = self.collective_interval {
            config.collective_interval = d;
        }
        if let Some(d) = self.watchdog_interval.filter(|d| !d.is_zero()) {
            config.watchdog_interval = d;
        }
        if let Some(d) = self.shutdown_grace {
            config.shutdown_grace = d;
        }
        if self.max_iterations.is_some() {
            config.max_iterations = self.max_iterations;
        }
        if let Some(path) = &self.nccl_lib {
            config.nccl_lib = path.clone();
        }
        if let Some(path) = &self.cudart_lib {
            config.cudart_lib = path.clone();
        }
        config
    }
}

fn main() {
    let cli = Cli::parse();
    let config = cli.apply(CONFIG.clone());
    logger::init(config.log_level);

    let shutdown = ShutdownToken::new();
    let code = match TerminationHandler::install(shutdown.clone(), config.shutdown_grace) {
        Ok(handler) => {
            let result = match cli.simulate {
                Some(size) => {
                    let nccl = SimCollective::with_fault_on_poll(cli.fault_after_polls)
                        .op_latency(cli.op_latency.unwrap_or_default());
                    simulate(size, nccl, config, &shutdown)
                }
                None => run(config, &shutdown),
            };
            drop(handler);
            match result {
                Ok(()) => 0,
                Err(e) => {
                    error!("{}", e);
                    e.exit_code()
                }
            }
        }
        Err(e) => {
            error!("{}", e);
            e.exit_code()
        }
    };
    log::logger().flush();
    std::process::exit(code);
}

/// One rank per process, bootstrapped over MPI.
#[cfg(feature = "mpi")]
fn run(config: Config, shutdown: &ShutdownToken) -> Result<()> {
    use nccl_watchdog::cuda::CudaRuntime;
    use nccl_watchdog::mpi::MpiGroup;
    use nccl_watchdog::nccl::NcclLibrary;

    let group = MpiGroup::initialize()?;
    let nccl = Arc::new(NcclLibrary::from_path(&config.nccl_lib)?);
    let cuda = CudaRuntime::from_path(&config.cudart_lib)?;
    let supervisor = Supervisor::new(config, cuda, nccl, shutdown.clone());
    let report = supervisor.run(group, &topology::local_hostname())?;
    log_report(&report);
    Ok(())
}

#[cfg(not(feature = "mpi"))]
fn run(_config: Config, _shutdown: &ShutdownToken) -> Result<()> {
    Err(Error::Unsupported(
        "built without MPI support, rebuild with `--features mpi` or pass `--simulate <N>`",
    ))
}

/// `size` ranks as threads sharing one simulated collective library.
fn simulate(
    size: usize,
    nccl: SimCollective,
    config: Config,
    shutdown: &ShutdownToken,
) -> Result<()> {
    if size == 0 {
        return Err(Error::InvalidRank { rank: 0, size });
    }
    info!("simulating {} ranks", size);
    let nccl = Arc::new(nccl);
    let hostname = topology::local_hostname();

    let results: Vec<Result<Report>> = thread::scope(|s| {
        let ranks: Vec<_> = LocalGroup::create_world(size)
            .into_iter()
            .map(|group| {
                let supervisor = Supervisor::new(
                    config.clone(),
                    SimAccelerator::new(size),
                    Arc::clone(&nccl),
                    shutdown.clone(),
                );
                let hostname = hostname.as_str();
                s.spawn(move || {
                    let result = supervisor.run(group, hostname);
                    if result.is_err() {
                        // a failed rank takes the whole job down
                        shutdown.cancel();
                    }
                    result
                })
            })
            .collect();
        ranks
            .into_iter()
            .map(|h| h.join().unwrap_or_else(|e| std::panic::resume_unwind(e)))
            .collect()
    });

    let mut first_error = None;
    for result in results {
        match result {
            Ok(report) => log_report(&report),
            Err(e) if first_error.is_none() => first_error = Some(e),
            Err(e) => error!("{}", e),
        }
    }
    first_error.map_or(Ok(()), Err)
}

fn log_report(report: &Report) {
    info!(
        "[Rank {}] {} all-reduces, {} polls, {} aborts",
        report.identity.rank, report.iterations, report.watchdog.polls, report.watchdog.aborts
    );
}
