//! Deficit round robin over a dynamic set of priority flows.
//!
//! Each flow's quantum equals its priority: within one round a flow may
//! forward up to `quantum` jobs to the output. A round starts with a fair
//! blocking select across the cancellation token and every open inlet; the
//! inlet that fires becomes the round's entry point and its received job
//! counts against its quantum. The remaining flows are drained with
//! non-blocking reads only, so an idle flow never stalls the round.
//!
//! Flows whose inlet disconnects are marked during the round and removed
//! once it ends, keeping indices stable while the round runs. The loop exits
//! when the last flow is removed, closing the output.
//!
//! This is the quantum-per-round variant: credit left unused by an idle flow
//! does not accumulate across rounds.

use crate::request::Job;
use crate::scheduler::SchedulerError;
use crate::shutdown::ShutdownToken;
use crossbeam_channel::{Receiver, Select, Sender, TryRecvError};

struct Flow {
    input: Receiver<Job>,
    quantum: u32,
}

enum RoundEntry {
    Cancelled,
    Value(usize, Job),
    Closed(usize),
}

pub struct Drr {
    flows: Vec<Flow>,
    output: Sender<Job>,
    closing: Vec<usize>,
}

impl Drr {
    pub fn new(output: Sender<Job>) -> Drr {
        Drr {
            flows: Vec::new(),
            output,
            closing: Vec::new(),
        }
    }

    /// Register an inlet with its priority. Must be called before the
    /// scheduler thread starts. Zero and duplicate priorities are rejected.
    pub fn register_input(&mut self, priority: u32, input: Receiver<Job>) -> Result<(), SchedulerError> {
        if priority == 0 {
            return Err(SchedulerError::InvalidPriority);
        }
        if self.flows.iter().any(|flow| flow.quantum == priority) {
            return Err(SchedulerError::DuplicatePriority(priority));
        }
        self.flows.push(Flow { input, quantum: priority });
        Ok(())
    }

    pub(crate) fn run(mut self, token: &ShutdownToken) {
        if self.flows.is_empty() {
            return;
        }
        loop {
            let (entry_index, mut carried) = match self.wait_ready(token) {
                RoundEntry::Cancelled => return,
                RoundEntry::Value(index, job) => (index, Some(job)),
                RoundEntry::Closed(index) => {
                    self.closing.push(index);
                    (index, None)
                }
            };

            for index in 0..self.flows.len() {
                let mut allowance = self.flows[index].quantum;
                if index == entry_index {
                    match carried.take() {
                        Some(job) => {
                            if self.output.send(job).is_err() {
                                return;
                            }
                            allowance -= 1;
                        }
                        // Entry inlet disconnected, already marked for removal.
                        None => continue,
                    }
                }
                while allowance > 0 {
                    if token.is_triggered() {
                        return;
                    }
                    match self.flows[index].input.try_recv() {
                        Ok(job) => {
                            if self.output.send(job).is_err() {
                                return;
                            }
                            allowance -= 1;
                        }
                        Err(TryRecvError::Empty) => break,
                        Err(TryRecvError::Disconnected) => {
                            self.closing.push(index);
                            break;
                        }
                    }
                }
            }

            if self.purge_closed() {
                return;
            }
        }
    }

    /// Fair blocking select across the token and every open inlet.
    fn wait_ready(&self, token: &ShutdownToken) -> RoundEntry {
        let mut sel = Select::new();
        sel.recv(token.channel());
        for flow in &self.flows {
            sel.recv(&flow.input);
        }
        let oper = sel.select();
        match oper.index() {
            0 => {
                let _ = oper.recv(token.channel());
                RoundEntry::Cancelled
            }
            ready => {
                let index = ready - 1;
                match oper.recv(&self.flows[index].input) {
                    Ok(job) => RoundEntry::Value(index, job),
                    Err(_) => RoundEntry::Closed(index),
                }
            }
        }
    }

    /// Drop flows marked during the round. Returns true when none remain.
    fn purge_closed(&mut self) -> bool {
        if !self.closing.is_empty() {
            let closing = std::mem::take(&mut self.closing);
            let mut index = 0;
            self.flows.retain(|_| {
                let keep = !closing.contains(&index);
                index += 1;
                keep
            });
        }
        self.flows.is_empty()
    }
}
