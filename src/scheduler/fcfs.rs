//! First-come-first-served forwarding: one inlet drained in arrival order.

use crate::request::Job;
use crate::shutdown::ShutdownToken;
use crossbeam_channel::{select, Receiver, Sender};

/// Global FIFO discipline. The server routes every class to the single
/// registered inlet, so the output order is the acceptance order.
pub struct Fcfs {
    input: Receiver<Job>,
    output: Sender<Job>,
}

impl Fcfs {
    pub fn new(input: Receiver<Job>, output: Sender<Job>) -> Fcfs {
        Fcfs { input, output }
    }

    pub(crate) fn run(self, token: &ShutdownToken) {
        loop {
            select! {
                recv(token.channel()) -> _ => return,
                recv(self.input) -> job => match job {
                    Ok(job) => {
                        if self.output.send(job).is_err() {
                            return;
                        }
                    }
                    // Input disconnected: nothing left to forward.
                    Err(_) => return,
                },
            }
        }
    }
}
