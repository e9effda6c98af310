//! Host resource status used for adaptive concurrency and resource triggers.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::{TollgateError, TollgateResult};
use crate::gates::guards::clamp_concurrency;

/// Pressure snapshot, each field a fraction in `[0, 1]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceStatus {
    pub cpu_load: f64,
    pub memory_pressure: f64,
}

impl ResourceStatus {
    pub fn new(cpu_load: f64, memory_pressure: f64) -> Self {
        Self {
            cpu_load: normalize_fraction(cpu_load),
            memory_pressure: normalize_fraction(memory_pressure),
        }
    }

    pub fn peak(&self) -> f64 {
        self.cpu_load.max(self.memory_pressure)
    }
}

pub trait ResourceStatusProvider: Send + Sync {
    fn status(&self) -> ResourceStatus;
}

/// Fixed status, for tests and hosts without `/proc`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticResources(pub ResourceStatus);

impl ResourceStatusProvider for StaticResources {
    fn status(&self) -> ResourceStatus {
        self.0
    }
}

/// Reads `/proc/loadavg` and `/proc/meminfo`.
///
/// Read or parse failures are logged and reported as zero pressure.
#[derive(Debug, Clone)]
pub struct ProcResources {
    loadavg: PathBuf,
    meminfo: PathBuf,
}

impl Default for ProcResources {
    fn default() -> Self {
        Self {
            loadavg: PathBuf::from("/proc/loadavg"),
            meminfo: PathBuf::from("/proc/meminfo"),
        }
    }
}

impl ProcResources {
    pub fn with_paths(loadavg: impl Into<PathBuf>, meminfo: impl Into<PathBuf>) -> Self {
        Self {
            loadavg: loadavg.into(),
            meminfo: meminfo.into(),
        }
    }

    fn sample(&self) -> TollgateResult<ResourceStatus> {
        let load_1m = read_load_avg_1m(&self.loadavg)?;
        let cpu_slots = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
        let memory = read_memory_pressure(&self.meminfo)?;
        Ok(ResourceStatus::new(load_1m / cpu_slots as f64, memory))
    }
}

impl ResourceStatusProvider for ProcResources {
    fn status(&self) -> ResourceStatus {
        match self.sample() {
            Ok(status) => status,
            Err(e) => {
                warn!(error = %e, "resource sampling failed, assuming idle host");
                ResourceStatus::default()
            }
        }
    }
}

/// Degree of parallelism for the `Adaptive` strategy: `ceiling` scaled down by
/// the worst pressure, never below one.
pub fn adaptive_degree(ceiling: usize, status: ResourceStatus) -> usize {
    let headroom = 1.0 - status.peak();
    let scaled = (ceiling as f64 * headroom).ceil() as usize;
    clamp_concurrency(scaled, ceiling)
}

fn normalize_fraction(value: f64) -> f64 {
    if !value.is_finite() || value <= 0.0 {
        return 0.0;
    }
    value.min(1.0)
}

fn read_load_avg_1m(path: &Path) -> TollgateResult<f64> {
    let contents = fs::read_to_string(path)?;
    parse_load_avg_1m(&contents)
}

fn parse_load_avg_1m(contents: &str) -> TollgateResult<f64> {
    let first = contents
        .split_whitespace()
        .next()
        .ok_or_else(|| TollgateError::Io(std::io::Error::other("loadavg missing first field")))?;
    first.parse::<f64>().map_err(|err| {
        TollgateError::Io(std::io::Error::other(format!(
            "invalid loadavg value {first:?}: {err}"
        )))
    })
}

fn read_memory_pressure(path: &Path) -> TollgateResult<f64> {
    let contents = fs::read_to_string(path)?;
    parse_memory_pressure(&contents)
}

/// `1 - MemAvailable / MemTotal`.
fn parse_memory_pressure(contents: &str) -> TollgateResult<f64> {
    let mut total = None;
    let mut available = None;
    for line in contents.lines() {
        let mut fields = line.split_whitespace();
        let key = fields.next().unwrap_or_default();
        let value = fields.next().unwrap_or_default();
        match key {
            "MemTotal:" => total = value.parse::<u64>().ok(),
            "MemAvailable:" => available = value.parse::<u64>().ok(),
            _ => {}
        }
    }
    match (total, available) {
        (Some(total), Some(available)) if total > 0 => {
            Ok(1.0 - (available.min(total) as f64 / total as f64))
        }
        _ => Err(TollgateError::Io(std::io::Error::other(
            "MemTotal/MemAvailable missing in meminfo",
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adaptive_degree_scales_with_pressure() {
        assert_eq!(adaptive_degree(8, ResourceStatus::new(0.0, 0.0)), 8);
        assert_eq!(adaptive_degree(8, ResourceStatus::new(0.5, 0.1)), 4);
        assert_eq!(adaptive_degree(8, ResourceStatus::new(0.2, 0.9)), 1);
        assert_eq!(adaptive_degree(8, ResourceStatus::new(3.0, 0.0)), 1);
        assert_eq!(adaptive_degree(1, ResourceStatus::new(0.0, 0.0)), 1);
    }

    #[test]
    fn status_normalizes_out_of_range_values() {
        let status = ResourceStatus::new(f64::NAN, 4.0);
        assert_eq!(status.cpu_load, 0.0);
        assert_eq!(status.memory_pressure, 1.0);
    }

    #[test]
    fn parses_proc_formats() {
        assert_eq!(parse_load_avg_1m("0.52 0.58 0.59 1/257 12345\n").unwrap(), 0.52);
        assert!(parse_load_avg_1m("").is_err());

        let meminfo =
            "MemTotal:       16000000 kB\nMemFree:  1000 kB\nMemAvailable:    4000000 kB\n";
        let pressure = parse_memory_pressure(meminfo).unwrap();
        assert!((pressure - 0.75).abs() < 1e-9);
        assert!(parse_memory_pressure("MemFree: 10 kB\n").is_err());
    }

    #[test]
    fn proc_provider_reads_files() {
        let dir = tempfile::tempdir().unwrap();
        let loadavg = dir.path().join("loadavg");
        let meminfo = dir.path().join("meminfo");
        std::fs::write(&loadavg, "0.00 0.01 0.05 1/100 42\n").unwrap();
        std::fs::write(&meminfo, "MemTotal: 1000 kB\nMemAvailable: 500 kB\n").unwrap();

        let status = ProcResources::with_paths(&loadavg, &meminfo).status();
        assert_eq!(status.cpu_load, 0.0);
        assert!((status.memory_pressure - 0.5).abs() < 1e-9);
    }

    #[test]
    fn proc_provider_missing_files_reports_idle() {
        let status =
            ProcResources::with_paths("/nonexistent/loadavg", "/nonexistent/meminfo").status();
        assert_eq!(status, ResourceStatus::default());
    }
}
