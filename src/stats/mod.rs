//! Normalizing engine progress into [`TargetStats`].
//!
//! AFL writes a `key : value` stats file that is re-read on a fixed cadence.
//! go-fuzz pushes JSON events over a server-sent event stream.

pub mod afl;
pub mod gofuzz;
pub mod sse;

use crate::{target::TargetStats, HashMap};
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StatsError {
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error("could not parse {field}: '{value}'")]
    BadField { field: &'static str, value: String },
    #[error("malformed uptime: '{0}'")]
    BadUptime(String),
    #[error("uptime is zero")]
    ZeroUptime,
    #[error("bad stats event: {0}")]
    Json(#[from] serde_json::Error),
}

/// Splits `key : value` lines. Lines without a separator are skipped.
pub fn parse_stats_map(content: &str) -> HashMap<&str, &str> {
    content
        .lines()
        .filter_map(|l| {
            let i = l.find(':')?;
            Some((l[..i].trim(), l[i + 1..].trim()))
        })
        .collect()
}

fn field<'a>(map: &HashMap<&str, &'a str>, name: &'static str) -> Result<&'a str, StatsError> {
    map.get(name).copied().ok_or(StatsError::MissingField(name))
}

fn number<T: std::str::FromStr>(
    map: &HashMap<&str, &str>,
    name: &'static str,
) -> Result<T, StatsError> {
    let value = field(map, name)?;
    value.parse().map_err(|_| StatsError::BadField {
        field: name,
        value: value.to_string(),
    })
}

/// Extracts throughput and bug count from an AFL `fuzzer_stats` file.
pub fn parse_afl_stats(id: &str, content: &str) -> Result<TargetStats, StatsError> {
    let map = parse_stats_map(content);
    let tests_per_second: f64 = number(&map, "execs_per_sec")?;
    let crashes: u64 = number(&map, "unique_crashes")?;
    let hangs: u64 = number(&map, "unique_hangs")?;
    Ok(TargetStats {
        id: id.to_string(),
        tests_per_second,
        bugs_found: crashes + hangs,
    })
}

/// Converts a duration string such as `2h15m`, `45s` or `1h2m3.5s` into seconds.
///
/// go-fuzz prints Go durations, which carry fractional seconds; `humantime`
/// rejects those, so the units are parsed here.
pub fn parse_uptime(s: &str) -> Result<f64, StatsError> {
    let bad = || StatsError::BadUptime(s.to_string());
    let s = s.trim();
    if s.is_empty() {
        return Err(bad());
    }

    let mut total = 0.0;
    let mut rest = s;
    let mut last_unit = 0;
    while !rest.is_empty() {
        let split = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(bad)?;
        if split == 0 {
            return Err(bad());
        }
        let value: f64 = rest[..split].parse().map_err(|_| bad())?;
        rest = &rest[split..];
        let (scale, rank, len) = if rest.starts_with("ms") {
            (0.001, 4, 2)
        } else if rest.starts_with('h') {
            (3600.0, 1, 1)
        } else if rest.starts_with('m') {
            (60.0, 2, 1)
        } else if rest.starts_with('s') {
            (1.0, 3, 1)
        } else {
            return Err(bad());
        };
        // units must appear in decreasing order, each at most once
        if rank <= last_unit {
            return Err(bad());
        }
        last_unit = rank;
        total += value * scale;
        rest = &rest[len..];
    }
    Ok(total)
}

/// One go-fuzz stats event.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct GoFuzzEvent {
    pub workers: u64,
    pub corpus: u64,
    pub crashers: u64,
    pub execs: u64,
    pub cover: u64,
    pub restarts_denom: u64,
    pub last_new_input_time: String,
    pub start_time: String,
    pub uptime: String,
}

impl GoFuzzEvent {
    pub fn parse(data: &str) -> Result<Self, StatsError> {
        Ok(serde_json::from_str(data)?)
    }

    pub fn to_stats(&self, id: &str) -> Result<TargetStats, StatsError> {
        let elapsed = parse_uptime(&self.uptime)?;
        if elapsed <= 0.0 {
            return Err(StatsError::ZeroUptime);
        }
        Ok(TargetStats {
            id: id.to_string(),
            tests_per_second: self.execs as f64 / elapsed,
            bugs_found: self.crashers,
        })
    }
}
