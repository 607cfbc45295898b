//! Workload description file and the semicolon-separated result rows.
//!
//! Each workload block is one independent benchmark run; the driver writes
//! one CSV row per block. Floats use a comma decimal separator, matching the
//! locale of the reports the rows are merged into.

use crate::bench::BenchResult;
use serde::Deserialize;
use std::io::{self, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkloadError {
    #[error("cannot read {path}: {source}")]
    Io { path: String, source: io::Error },
    #[error("malformed workload file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("workload block {index}: {reason}")]
    Invalid { index: usize, reason: String },
}

/// One benchmark run: `(N, p, λ_fast, λ_slow)`.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkloadBlock {
    pub tot_requests: usize,
    pub slow_rate: f64,
    pub fast_rate: f64,
    pub slow_percent: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Workload {
    pub workload: Vec<WorkloadBlock>,
}

impl Workload {
    pub fn from_file(path: &Path) -> Result<Workload, WorkloadError> {
        let raw = std::fs::read_to_string(path).map_err(|source| WorkloadError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Workload::from_str(&raw)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(raw: &str) -> Result<Workload, WorkloadError> {
        let workload: Workload = serde_json::from_str(raw)?;
        workload.validate()?;
        Ok(workload)
    }

    fn validate(&self) -> Result<(), WorkloadError> {
        for (index, block) in self.workload.iter().enumerate() {
            if block.slow_percent > 100 {
                return Err(WorkloadError::Invalid {
                    index,
                    reason: format!("slow_percent {} exceeds 100", block.slow_percent),
                });
            }
            if !(block.fast_rate > 0.0) || !(block.slow_rate > 0.0) {
                return Err(WorkloadError::Invalid {
                    index,
                    reason: "arrival rates must be positive".to_string(),
                });
            }
        }
        Ok(())
    }
}

const CSV_SEPARATOR: &str = ";";

const CSV_COLUMNS: &[&str] = &[
    "scheduler",
    "fast_rate",
    "slow_rate",
    "tot_requests",
    "slow_percent",
    "fast_rt_avg",
    "fast_rt_std",
    "fast_wt_avg",
    "fast_wt_std",
    "fast_rtt_avg",
    "fast_rtt_std",
    "slow_rt_avg",
    "slow_rt_std",
    "slow_wt_avg",
    "slow_wt_std",
    "slow_rtt_avg",
    "slow_rtt_std",
    "rps",
    "memory_avg",
    "jobs_avg",
    "cpu_avg",
];

pub fn write_csv_header(out: &mut impl Write) -> io::Result<()> {
    writeln!(out, "{}", CSV_COLUMNS.join(CSV_SEPARATOR))
}

pub fn write_csv_row(
    out: &mut impl Write,
    scheduler: &str,
    block: &WorkloadBlock,
    result: &BenchResult,
) -> io::Result<()> {
    let mut fields = vec![
        scheduler.to_string(),
        decimal_comma(block.fast_rate),
        decimal_comma(block.slow_rate),
        block.tot_requests.to_string(),
        block.slow_percent.to_string(),
    ];
    for summary in [&result.fast, &result.slow] {
        for metric in [&summary.residence, &summary.waiting, &summary.round_trip] {
            fields.push(decimal_comma(metric.mean_us));
            fields.push(decimal_comma(metric.std_dev_us));
        }
    }
    fields.push(decimal_comma(result.requests_per_second));
    fields.push(decimal_comma(result.memory_mean));
    fields.push(decimal_comma(result.jobs_mean));
    fields.push(decimal_comma(result.cpu_mean));

    writeln!(out, "{}", fields.join(CSV_SEPARATOR))
}

/// Format a float with three decimals and a comma separator.
fn decimal_comma(value: f64) -> String {
    format!("{value:.3}").replace('.', ",")
}
