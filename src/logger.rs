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

use log::LevelFilter;

use std::io::Write as _;
use std::sync::OnceLock;

/// `log` backend printing every record to standard output, which is where
/// job schedulers collect per-rank output.
struct StdoutLogger {
    level: LevelFilter,
}

impl log::Log for StdoutLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            let mut out = std::io::stdout().lock();
            let _ = writeln!(
                out,
                "[{} {}:{}] {}",
                record.level(),
                record.file().unwrap_or("<???>"),
                record.line().unwrap_or(0),
                record.args()
            );
        }
    }

    fn flush(&self) {
        let _ = std::io::stdout().flush();
    }
}

static LOGGER: OnceLock<StdoutLogger> = OnceLock::new();

/// Install the stdout logger. Only the first call has any effect.
pub fn init(level: LevelFilter) {
    let mut installed = false;
    let logger = LOGGER.get_or_init(|| {
        installed = true;
        StdoutLogger { level }
    });
    if installed && log::set_logger(logger).is_ok() {
        log::set_max_level(level);
    }
}
