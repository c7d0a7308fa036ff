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

use log::{error, LevelFilter};

use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;

pub static CONFIG: LazyLock<Config> = LazyLock::new(Config::from_env);

macro_rules! field_from_env {
    ($s: expr, $field: ident) => {
        let env_name = watchdog_env!(stringify!($field).to_uppercase());
        $s.$field = parse_env(&env_name);
    };
    ($s: expr, $field: ident, $d: expr) => {
        let env_name = watchdog_env!(stringify!($field).to_uppercase());
        $s.$field = parse_env(&env_name).unwrap_or($d);
    };
}

macro_rules! watchdog_env {
    ($s: expr) => {
        format!("NCCL_WATCHDOG_{}", $s)
    };
}

pub const DEFAULT_ELEMENT_COUNT: usize = 32 * 1024 * 1024;
pub const DEFAULT_NCCL_LIB: &str = "libnccl.so.2";
pub const DEFAULT_CUDART_LIB: &str = "libcudart.so";

#[derive(Debug, Clone)]
pub struct Config {
    // Workload
    pub element_count: usize,
    pub collective_interval: Duration,
    pub max_iterations: Option<usize>,

    // Fault detection
    pub watchdog_interval: Duration,

    // Termination: time the orderly shutdown gets before the process exits anyway
    pub shutdown_grace: Duration,

    // Collaborator libraries
    pub nccl_lib: String,
    pub cudart_lib: String,

    pub log_level: LevelFilter,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            element_count: DEFAULT_ELEMENT_COUNT,
            collective_interval: Duration::from_millis(50),
            max_iterations: None,
            watchdog_interval: Duration::from_millis(10),
            shutdown_grace: Duration::from_secs(10),
            nccl_lib: String::from(DEFAULT_NCCL_LIB),
            cudart_lib: String::from(DEFAULT_CUDART_LIB),
            log_level: LevelFilter::Info,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let d = Config::default();
        let mut s = Config::default();

        field_from_env!(s, element_count, d.element_count);
        field_from_env!(s, collective_interval, d.collective_interval);
        field_from_env!(s, max_iterations);

        field_from_env!(s, watchdog_interval, d.watchdog_interval);
        if s.watchdog_interval.is_zero() {
            s.watchdog_interval = d.watchdog_interval;
        }

        field_from_env!(s, shutdown_grace, d.shutdown_grace);

        field_from_env!(s, nccl_lib, d.nccl_lib);
        field_from_env!(s, cudart_lib, d.cudart_lib);

        field_from_env!(s, log_level, d.log_level);

        s
    }

    /// bytes of one device buffer, `None` if that overflows `usize`
    pub fn buffer_bytes(&self) -> Option<usize> {
        self.element_count.checked_mul(std::mem::size_of::<f32>())
    }
}

trait FromConfigStr: Sized {
    type Err;
    fn parse(s: &str) -> Result<Self, Self::Err>;
}

// macro that implements FromConfigStr trait with FromStr
macro_rules! default_config_parser {
    ($t: tt) => {
        impl FromConfigStr for $t {
            type Err = <$t as FromStr>::Err;
            fn parse(s: &str) -> Result<Self, Self::Err> {
                <$t as FromStr>::from_str(s)
            }
        }
    };
}

default_config_parser!(String);
default_config_parser!(usize);
default_config_parser!(LevelFilter);

mod duration_parser {
    use nom::{
        character::complete::{alpha1, digit1},
        combinator::map_res,
        multi::fold_many1,
        sequence::pair,
        IResult, Parser as _,
    };

    use std::time::Duration;

    fn parse_u64(input: &str) -> IResult<&str, u64> {
        map_res(digit1, |s: &str| s.parse::<u64>()).parse(input)
    }

    fn parse_duration_component(input: &str) -> IResult<&str, Duration> {
        let (input, (value, unit)) = pair(parse_u64, alpha1).parse(input)?;

        match unit {
            "h" => Ok((input, Duration::from_secs(value * 60 * 60))),
            "m" => Ok((input, Duration::from_secs(value * 60))),
            "s" => Ok((input, Duration::from_secs(value))),
            "ms" => Ok((input, Duration::from_millis(value))),
            "us" => Ok((input, Duration::from_micros(value))),
            _ => Err(nom::Err::Failure(nom::error::Error::new(
                unit,
                nom::error::ErrorKind::Tag,
            ))),
        }
    }

    pub fn parse(input: &str) -> IResult<&str, Duration> {
        let (remaining, maybe_dur) = fold_many1(
            parse_duration_component,
            || Ok(Duration::default()),
            |acc: Result<_, nom::Err<_>>, item| {
                acc?.checked_add(item).ok_or_else(|| {
                    nom::Err::Failure(nom::error::Error::new(
                        input,
                        nom::error::ErrorKind::TooLarge,
                    ))
                })
            },
        )
        .parse(input)?;
        Ok((remaining, maybe_dur?))
    }
}

impl FromConfigStr for Duration {
    type Err = String;
    fn parse(s: &str) -> Result<Self, Self::Err> {
        let s = s.to_lowercase();
        if let Ok((remaining, dur)) = duration_parser::parse(&s) {
            if remaining.is_empty() {
                return Ok(dur);
            }
        }
        Err(format!("Could not parse {} to duration", s))
    }
}

/// Parse a duration string such as `50ms` or `1m30s`.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    <Duration as FromConfigStr>::parse(s)
}

fn parse_env<T>(name: &str) -> Option<T>
where
    T: FromConfigStr,
    <T as FromConfigStr>::Err: std::fmt::Debug,
{
    std::env::var(name).ok().and_then(|s| {
        T::parse(&s)
            .map_err(|e| {
                error!("Error parsing config {}, got error {:?}", name, e);
                e
            })
            .ok()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_durations() {
        assert_eq!(parse_duration("50ms"), Ok(Duration::from_millis(50)));
        assert_eq!(parse_duration("1m30s"), Ok(Duration::from_secs(90)));
        assert_eq!(parse_duration("10US"), Ok(Duration::from_micros(10)));
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("10ms junk").is_err());
        assert!(parse_duration("3days").is_err());
    }

    #[test]
    fn parse_level() {
        assert_eq!(LevelFilter::parse("debug"), Ok(LevelFilter::Debug));
        assert!(LevelFilter::parse("loud").is_err());
    }

    #[test]
    fn defaults_follow_soak_test_cadence() {
        let c = Config::default();
        assert_eq!(c.element_count, 32 * 1024 * 1024);
        assert_eq!(c.buffer_bytes(), Some(128 * 1024 * 1024));
        assert_eq!(c.collective_interval, Duration::from_millis(50));
        assert_eq!(c.watchdog_interval, Duration::from_millis(10));
        assert_eq!(c.max_iterations, None);
        assert_eq!(c.shutdown_grace, Duration::from_secs(10));
    }

    #[test]
    fn oversized_element_count_has_no_buffer_size() {
        let c = Config {
            element_count: 1 << 62,
            ..Default::default()
        };
        assert_eq!(c.buffer_bytes(), None);
    }

    #[test]
    fn env_overrides() {
        std::env::set_var("NCCL_WATCHDOG_ELEMENT_COUNT", "1024");
        std::env::set_var("NCCL_WATCHDOG_COLLECTIVE_INTERVAL", "5ms");
        std::env::set_var("NCCL_WATCHDOG_MAX_ITERATIONS", "not-a-number");
        std::env::set_var("NCCL_WATCHDOG_SHUTDOWN_GRACE", "1m30s");
        let c = Config::from_env();
        std::env::remove_var("NCCL_WATCHDOG_SHUTDOWN_GRACE");
        std::env::remove_var("NCCL_WATCHDOG_ELEMENT_COUNT");
        std::env::remove_var("NCCL_WATCHDOG_COLLECTIVE_INTERVAL");
        std::env::remove_var("NCCL_WATCHDOG_MAX_ITERATIONS");

        assert_eq!(c.element_count, 1024);
        assert_eq!(c.collective_interval, Duration::from_millis(5));
        assert_eq!(c.max_iterations, None);
        assert_eq!(c.shutdown_grace, Duration::from_secs(90));
        assert_eq!(c.nccl_lib, DEFAULT_NCCL_LIB);
    }
}
