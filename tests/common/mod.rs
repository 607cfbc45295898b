//! Shared helper wiring a full in-process stack on an ephemeral port.

use crossbeam_channel::bounded;
use schedbench::scheduler::{Drr, Fcfs, Scheduler, SchedulerKind, FAST_PRIORITY, SLOW_PRIORITY};
use schedbench::server::{Routing, Server};
use schedbench::sink::WorkSink;
use schedbench::ShutdownToken;
use std::net::SocketAddr;
use std::sync::atomic::AtomicI64;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub struct TestStack {
    pub addr: SocketAddr,
    pub token: ShutdownToken,
    handles: Vec<JoinHandle<()>>,
}

pub fn start_stack(kind: SchedulerKind, slow_time: Duration) -> TestStack {
    let token = ShutdownToken::new();
    let (out_tx, out_rx) = bounded(0);
    let (high_tx, high_rx) = bounded(0);
    let (low_tx, low_rx) = bounded(0);
    let in_flight = Arc::new(AtomicI64::new(0));

    let (scheduler, routing) = match kind {
        SchedulerKind::Fcfs => {
            drop(low_rx);
            (Scheduler::Fcfs(Fcfs::new(high_rx, out_tx)), Routing::AllHigh)
        }
        SchedulerKind::Drr => {
            let mut drr = Drr::new(out_tx);
            drr.register_input(FAST_PRIORITY, high_rx).unwrap();
            drr.register_input(SLOW_PRIORITY, low_rx).unwrap();
            (Scheduler::Drr(drr), Routing::ByClass)
        }
    };

    let mut handles = Vec::new();
    handles.push({
        let token = token.clone();
        thread::spawn(move || scheduler.run(&token))
    });
    let sink = WorkSink::new(out_rx, slow_time, in_flight.clone());
    handles.push(thread::spawn(move || sink.run()));

    let server = Server::new(high_tx, low_tx, routing, in_flight);
    let bound = server.bind("127.0.0.1:0").unwrap();
    let addr = bound.local_addr().unwrap();
    handles.push({
        let token = token.clone();
        thread::spawn(move || {
            let _ = bound.serve(&token);
        })
    });

    TestStack {
        addr,
        token,
        handles,
    }
}

impl TestStack {
    pub fn shutdown(self) {
        self.token.trigger();
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}
