//! Scheduler behavior driven directly over channels.

use crossbeam_channel::{bounded, select, Receiver, Sender};
use schedbench::scheduler::{Drr, Fcfs, Scheduler, FAST_PRIORITY, SLOW_PRIORITY};
use schedbench::{Job, RequestClass, ShutdownToken};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Any live stream works as the job's connection handle; nothing reads or
/// writes it in these tests.
fn test_client() -> Arc<TcpStream> {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).unwrap();
    let _ = listener.accept().unwrap();
    Arc::new(client)
}

fn job(class: RequestClass, client: &Arc<TcpStream>, seq: u64) -> Job {
    let mut job = Job::accepted(class, client.clone());
    job.response.accepted_ts = seq;
    job
}

#[test]
fn fcfs_preserves_arrival_order() {
    let client = test_client();
    let (in_tx, in_rx) = bounded(64);
    let (out_tx, out_rx) = bounded(64);
    let token = ShutdownToken::new();

    let classes = [
        RequestClass::Fast,
        RequestClass::Slow,
        RequestClass::Fast,
        RequestClass::Fast,
        RequestClass::Slow,
    ];
    for (seq, class) in classes.iter().enumerate() {
        in_tx.send(job(*class, &client, seq as u64)).unwrap();
    }
    drop(in_tx);

    let scheduler = Scheduler::Fcfs(Fcfs::new(in_rx, out_tx));
    let handle = thread::spawn(move || scheduler.run(&token));

    let forwarded: Vec<Job> = out_rx.iter().collect();
    handle.join().unwrap();

    assert_eq!(forwarded.len(), classes.len());
    for (seq, job) in forwarded.iter().enumerate() {
        assert_eq!(job.response.accepted_ts, seq as u64);
        assert_eq!(job.class, classes[seq]);
    }
}

#[test]
fn fcfs_closes_output_when_input_closes() {
    let client = test_client();
    let (in_tx, in_rx) = bounded(8);
    let (out_tx, out_rx) = bounded(8);
    let token = ShutdownToken::new();

    in_tx.send(job(RequestClass::Fast, &client, 0)).unwrap();
    drop(in_tx);

    let scheduler = Scheduler::Fcfs(Fcfs::new(in_rx, out_tx));
    let handle = thread::spawn(move || scheduler.run(&token));

    assert_eq!(out_rx.iter().count(), 1);
    // iter() only ends once the scheduler dropped its sender.
    handle.join().unwrap();
}

#[test]
fn fcfs_stops_on_cancellation() {
    let (_in_tx, in_rx) = bounded::<Job>(8);
    let (out_tx, _out_rx) = bounded(8);
    let token = ShutdownToken::new();

    let scheduler = Scheduler::Fcfs(Fcfs::new(in_rx, out_tx));
    let runner = {
        let token = token.clone();
        thread::spawn(move || scheduler.run(&token))
    };
    thread::sleep(Duration::from_millis(20));
    token.trigger();
    runner.join().unwrap();
}

/// Keep a flow's inlet saturated until the token fires.
fn feed(
    class: RequestClass,
    client: Arc<TcpStream>,
    inlet: Sender<Job>,
    token: ShutdownToken,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        for seq in 0.. {
            let next = job(class, &client, seq);
            select! {
                send(inlet, next) -> sent => {
                    if sent.is_err() {
                        return;
                    }
                }
                recv(token.channel()) -> _ => return,
            }
        }
    })
}

#[test]
fn drr_approximates_the_priority_ratio_under_overload() {
    let client = test_client();
    let (high_tx, high_rx) = bounded(4096);
    let (low_tx, low_rx) = bounded(4096);
    let (out_tx, out_rx): (Sender<Job>, Receiver<Job>) = bounded(0);
    let token = ShutdownToken::new();

    let mut drr = Drr::new(out_tx);
    drr.register_input(FAST_PRIORITY, high_rx).unwrap();
    drr.register_input(SLOW_PRIORITY, low_rx).unwrap();

    let feeders = [
        feed(RequestClass::Fast, client.clone(), high_tx, token.clone()),
        feed(RequestClass::Slow, client.clone(), low_tx, token.clone()),
    ];
    // Let both inlets fill before the first round.
    thread::sleep(Duration::from_millis(100));

    let runner = {
        let token = token.clone();
        thread::spawn(move || Scheduler::Drr(drr).run(&token))
    };

    const WINDOW: usize = 200;
    const WINDOWS: usize = 15;
    let drained: Vec<RequestClass> = out_rx.iter().take(WINDOW * WINDOWS).map(|j| j.class).collect();
    assert_eq!(drained.len(), WINDOW * WINDOWS);

    token.trigger();
    drop(out_rx);
    runner.join().unwrap();
    for feeder in feeders {
        feeder.join().unwrap();
    }

    // fast=3, slow=2: each window of 200 should sit near the 3:2 ratio.
    let mut in_band = 0;
    for window in drained.chunks(WINDOW) {
        let fast = window.iter().filter(|c| **c == RequestClass::Fast).count();
        let slow = WINDOW - fast;
        assert!(slow > 0, "slow class starved in a window");
        let ratio = fast as f64 / slow as f64;
        if (1.2..=1.8).contains(&ratio) {
            in_band += 1;
        }
    }
    assert!(
        in_band * 10 >= WINDOWS * 9,
        "only {in_band}/{WINDOWS} windows within the 3:2 band"
    );
}

#[test]
fn drr_forwards_every_job_exactly_once() {
    let client = test_client();
    let (high_tx, high_rx) = bounded(256);
    let (low_tx, low_rx) = bounded(256);
    let (out_tx, out_rx) = bounded(256);
    let token = ShutdownToken::new();

    let mut drr = Drr::new(out_tx);
    drr.register_input(FAST_PRIORITY, high_rx).unwrap();
    drr.register_input(SLOW_PRIORITY, low_rx).unwrap();

    for seq in 0..100u64 {
        if seq % 2 == 0 {
            high_tx.send(job(RequestClass::Fast, &client, seq)).unwrap();
        } else {
            low_tx.send(job(RequestClass::Slow, &client, seq)).unwrap();
        }
    }
    drop(high_tx);
    drop(low_tx);

    let runner = thread::spawn(move || Scheduler::Drr(drr).run(&token));

    let mut seen: Vec<u64> = out_rx.iter().map(|j| j.response.accepted_ts).collect();
    runner.join().unwrap();

    seen.sort_unstable();
    assert_eq!(seen, (0..100).collect::<Vec<_>>());
}

#[test]
fn drr_exits_when_all_flows_close() {
    let client = test_client();
    let (high_tx, high_rx) = bounded(8);
    let (low_tx, low_rx) = bounded(8);
    let (out_tx, out_rx) = bounded(16);
    let token = ShutdownToken::new();

    let mut drr = Drr::new(out_tx);
    drr.register_input(FAST_PRIORITY, high_rx).unwrap();
    drr.register_input(SLOW_PRIORITY, low_rx).unwrap();

    high_tx.send(job(RequestClass::Fast, &client, 0)).unwrap();
    low_tx.send(job(RequestClass::Slow, &client, 1)).unwrap();
    drop(high_tx);
    drop(low_tx);

    let runner = thread::spawn(move || Scheduler::Drr(drr).run(&token));
    assert_eq!(out_rx.iter().count(), 2);
    runner.join().unwrap();
}

#[test]
fn drr_stops_on_cancellation() {
    let (_high_tx, high_rx) = bounded::<Job>(8);
    let (out_tx, _out_rx) = bounded(8);
    let token = ShutdownToken::new();

    let mut drr = Drr::new(out_tx);
    drr.register_input(FAST_PRIORITY, high_rx).unwrap();

    let runner = {
        let token = token.clone();
        thread::spawn(move || Scheduler::Drr(drr).run(&token))
    };
    thread::sleep(Duration::from_millis(20));
    token.trigger();
    runner.join().unwrap();
}
