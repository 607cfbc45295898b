//! Scheduling disciplines multiplexing the priority inlets onto the single
//! stream consumed by the work sink.
//!
//! Both disciplines share one contract: inputs are registered before the
//! scheduler thread starts, the loop runs until cancellation or until every
//! input disconnects, and the output channel is closed on exit so the sink
//! drains and stops.

mod drr;
mod fcfs;

pub use drr::Drr;
pub use fcfs::Fcfs;

use crate::shutdown::ShutdownToken;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Routing priority (and DRR quantum) of the fast class.
pub const FAST_PRIORITY: u32 = 3;
/// Routing priority (and DRR quantum) of the slow class.
pub const SLOW_PRIORITY: u32 = 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("priority must be a positive integer")]
    InvalidPriority,
    #[error("priority {0} is already registered")]
    DuplicatePriority(u32),
}

/// Scheduler selection, parsed from the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerKind {
    Fcfs,
    Drr,
}

impl FromStr for SchedulerKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "fcfs" => Ok(SchedulerKind::Fcfs),
            "drr" => Ok(SchedulerKind::Drr),
            other => Err(format!("unsupported scheduler: {other:?}")),
        }
    }
}

impl fmt::Display for SchedulerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SchedulerKind::Fcfs => "fcfs",
            SchedulerKind::Drr => "drr",
        };
        write!(f, "{label}")
    }
}

/// A configured discipline ready to run on its own thread.
pub enum Scheduler {
    Fcfs(Fcfs),
    Drr(Drr),
}

impl Scheduler {
    /// Forward jobs until the token fires or every input disconnects.
    /// Consumes the scheduler so the output sender drops on return.
    pub fn run(self, token: &ShutdownToken) {
        match self {
            Scheduler::Fcfs(scheduler) => scheduler.run(token),
            Scheduler::Drr(scheduler) => scheduler.run(token),
        }
    }
}
