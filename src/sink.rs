//! Work sink: the single consumer of the scheduler output.
//!
//! Jobs are serviced strictly one at a time, which is what makes the
//! server-side timestamps comparable across scheduling disciplines.

use crate::buffer_pool::BufferPool;
use crate::request::{unix_micros, Job, RequestClass};
use crate::sysmon;
use crossbeam_channel::Receiver;
use std::io::Write;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const RESPONSE_SCRATCH: usize = 4096;

pub struct WorkSink {
    input: Receiver<Job>,
    slow_time: Duration,
    buffers: BufferPool,
    in_flight: Arc<AtomicI64>,
}

impl WorkSink {
    pub fn new(input: Receiver<Job>, slow_time: Duration, in_flight: Arc<AtomicI64>) -> WorkSink {
        WorkSink {
            input,
            slow_time,
            buffers: BufferPool::new(),
            in_flight,
        }
    }

    /// Service jobs until the input disconnects. Response write failures are
    /// logged and never stop the loop.
    pub fn run(self) {
        for mut job in self.input.iter() {
            job.response.running_ts = unix_micros();
            match job.class {
                RequestClass::Slow => thread::sleep(self.slow_time),
                RequestClass::Fast => {}
            }
            job.response.finished_ts = unix_micros();

            job.response.memory = sysmon::resident_memory_bytes().unwrap_or(0);
            job.response.cpu = sysmon::load_average_1m().unwrap_or(0.0);
            job.response.jobs_number = self.in_flight.load(Ordering::Relaxed);
            self.in_flight.fetch_sub(1, Ordering::Relaxed);

            let mut lease = self.buffers.lease(RESPONSE_SCRATCH);
            let scratch = lease.reset();
            if let Err(err) = serde_json::to_writer(&mut *scratch, &job.response) {
                tracing::warn!(error = %err, "response encoding failed");
                continue;
            }
            scratch.push(b'\n');
            if let Err(err) = (&*job.client).write_all(scratch) {
                tracing::warn!(error = %err, "response write failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Response;
    use crossbeam_channel::bounded;
    use std::io::{BufRead, BufReader};
    use std::net::{TcpListener, TcpStream};
    use std::time::Instant;

    fn stream_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server_side, _) = listener.accept().unwrap();
        (client, server_side)
    }

    #[test]
    fn responses_are_stamped_and_newline_framed() {
        let (client, server_side) = stream_pair();
        let in_flight = Arc::new(AtomicI64::new(2));
        let (tx, rx) = bounded(4);
        let sink = WorkSink::new(rx, Duration::from_millis(5), in_flight.clone());
        let handle = thread::spawn(move || sink.run());

        tx.send(Job::accepted(RequestClass::Slow, Arc::new(server_side)))
            .unwrap();
        drop(tx);

        let mut line = String::new();
        BufReader::new(&client).read_line(&mut line).unwrap();
        let response: Response = serde_json::from_str(line.trim_end()).unwrap();
        assert!(response.accepted_ts <= response.running_ts);
        assert!(response.running_ts <= response.finished_ts);
        // The slow class slept for the configured service time.
        assert!(response.finished_ts - response.running_ts >= 4_000);
        assert_eq!(response.jobs_number, 2);
        assert_eq!(in_flight.load(Ordering::Relaxed), 1);
        handle.join().unwrap();
    }

    #[test]
    fn fast_jobs_do_no_work() {
        let (client, server_side) = stream_pair();
        let (tx, rx) = bounded(4);
        let sink = WorkSink::new(rx, Duration::from_millis(50), Arc::new(AtomicI64::new(1)));
        let handle = thread::spawn(move || sink.run());

        let start = Instant::now();
        tx.send(Job::accepted(RequestClass::Fast, Arc::new(server_side)))
            .unwrap();
        drop(tx);

        let mut line = String::new();
        BufReader::new(&client).read_line(&mut line).unwrap();
        assert!(start.elapsed() < Duration::from_millis(50));
        handle.join().unwrap();
    }

    #[test]
    fn write_failure_does_not_stop_the_loop() {
        let (client, server_side) = stream_pair();
        let (client_b, server_side_b) = stream_pair();
        drop(client); // first job's peer is already gone

        let (tx, rx) = bounded(4);
        let sink = WorkSink::new(rx, Duration::ZERO, Arc::new(AtomicI64::new(2)));
        let handle = thread::spawn(move || sink.run());

        let dead = Arc::new(server_side);
        // Two jobs on the dead connection: the first write may be buffered by
        // the kernel, the second hits the reset.
        tx.send(Job::accepted(RequestClass::Fast, dead.clone())).unwrap();
        tx.send(Job::accepted(RequestClass::Fast, dead)).unwrap();
        tx.send(Job::accepted(RequestClass::Fast, Arc::new(server_side_b)))
            .unwrap();
        drop(tx);

        let mut line = String::new();
        BufReader::new(&client_b).read_line(&mut line).unwrap();
        assert!(serde_json::from_str::<Response>(line.trim_end()).is_ok());
        handle.join().unwrap();
    }
}
