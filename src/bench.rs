//! Closed-loop load generator.
//!
//! Two arrival generators draw exponential inter-arrival times and feed a
//! shared stream; a pool of workers drives requests over pooled TCP
//! connections and publishes per-request samples; the reducer folds samples
//! into per-class summaries. Shutdown is ordered: generators finish, the
//! arrivals stream closes, workers drain, the results stream closes, the
//! reducer finalizes.

use crate::buffer_pool::BufferPool;
use crate::conn_pool::{PoolConfig, PoolError, TcpConnPool};
use crate::request::{RequestClass, Response, TAG_LEN};
use crate::shutdown::ShutdownToken;
use crate::stats::Accumulator;
use crossbeam_channel::{after, bounded, select, Receiver, Sender};
use rand_distr::{Distribution, Exp};
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

const RESPONSE_SCRATCH: usize = 4096;
/// How often a blocked response read re-checks the shutdown token.
const READ_POLL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct BenchConfig {
    pub server_address: String,
    pub tot_requests: usize,
    /// Share of slow requests, integer percent in 0..=100.
    pub slow_percent: u32,
    /// Arrival rate of the fast class, requests per second.
    pub fast_rate: f64,
    /// Arrival rate of the slow class, requests per second.
    pub slow_rate: f64,
    pub concurrency: usize,
    pub max_open_conns: usize,
    pub max_idle_conns: usize,
}

/// Per-metric reduction of one request class.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricSummary {
    pub mean_us: f64,
    pub min_us: f64,
    pub max_us: f64,
    pub std_dev_us: f64,
}

impl From<&Accumulator> for MetricSummary {
    fn from(acc: &Accumulator) -> MetricSummary {
        MetricSummary {
            mean_us: acc.mean(),
            min_us: acc.min(),
            max_us: acc.max(),
            std_dev_us: acc.std_dev(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ClassSummary {
    pub count: u64,
    pub residence: MetricSummary,
    pub waiting: MetricSummary,
    pub round_trip: MetricSummary,
}

#[derive(Debug, Clone, Default)]
pub struct BenchResult {
    pub fast: ClassSummary,
    pub slow: ClassSummary,
    pub samples: u64,
    pub elapsed: Duration,
    pub requests_per_second: f64,
    pub memory_mean: f64,
    pub jobs_mean: f64,
    pub cpu_mean: f64,
}

struct RequestSample {
    class: RequestClass,
    residence_us: f64,
    waiting_us: f64,
    round_trip_us: f64,
    memory: u64,
    jobs: i64,
    cpu: f64,
}

#[derive(Debug, Error)]
enum RequestError {
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("write: {0}")]
    Write(io::Error),
    #[error("read: {0}")]
    Read(io::Error),
    #[error("server closed the connection")]
    Eof,
    #[error("response exceeds {RESPONSE_SCRATCH} bytes")]
    Oversized,
    #[error("malformed response: {0}")]
    Decode(serde_json::Error),
}

/// Run one benchmark block to completion (or cancellation) and reduce the
/// collected samples. On cancellation the result covers whatever was
/// measured up to that point.
pub fn run(config: &BenchConfig, token: &ShutdownToken) -> BenchResult {
    let pool = Arc::new(TcpConnPool::new(PoolConfig {
        address: config.server_address.clone(),
        max_open: config.max_open_conns,
        max_idle: config.max_idle_conns,
    }));

    let n_slow = config.tot_requests * config.slow_percent.min(100) as usize / 100;
    let n_fast = config.tot_requests - n_slow;

    let stream_cap = config.tot_requests.max(1);
    let (arrivals_tx, arrivals_rx) = bounded::<RequestClass>(stream_cap);
    let (samples_tx, samples_rx) = bounded::<RequestSample>(stream_cap);

    let started = Instant::now();

    let mut generators = Vec::with_capacity(2);
    for (class, count, rate) in [
        (RequestClass::Slow, n_slow, config.slow_rate),
        (RequestClass::Fast, n_fast, config.fast_rate),
    ] {
        let arrivals = arrivals_tx.clone();
        let token = token.clone();
        generators.push(thread::spawn(move || {
            generate_arrivals(class, count, rate, &arrivals, &token);
        }));
    }
    drop(arrivals_tx);

    let mut workers = Vec::with_capacity(config.concurrency.max(1));
    for _ in 0..config.concurrency.max(1) {
        let arrivals = arrivals_rx.clone();
        let samples = samples_tx.clone();
        let pool = pool.clone();
        let token = token.clone();
        workers.push(thread::spawn(move || {
            drive_requests(&arrivals, &samples, &pool, &token);
        }));
    }
    drop(arrivals_rx);
    drop(samples_tx);

    // Reduce on the caller thread; finishes when the last worker hangs up.
    let result = reduce(&samples_rx, started);

    for handle in generators.into_iter().chain(workers) {
        let _ = handle.join();
    }
    pool.close();
    result
}

/// Emit `count` arrivals of one class with Exp(rate) inter-arrival waits.
fn generate_arrivals(
    class: RequestClass,
    count: usize,
    rate: f64,
    arrivals: &Sender<RequestClass>,
    token: &ShutdownToken,
) {
    let inter_arrival = match Exp::new(rate) {
        Ok(distribution) => distribution,
        Err(err) => {
            if count > 0 {
                tracing::warn!(%class, rate, error = %err, "invalid arrival rate");
            }
            return;
        }
    };
    let mut rng = rand::thread_rng();
    for _ in 0..count {
        let wait = Duration::from_secs_f64(inter_arrival.sample(&mut rng));
        select! {
            recv(token.channel()) -> _ => return,
            recv(after(wait)) -> _ => {}
        }
        select! {
            recv(token.channel()) -> _ => return,
            send(arrivals, class) -> sent => {
                if sent.is_err() {
                    return;
                }
            }
        }
    }
}

/// Worker loop: one request per arrival, samples forwarded to the reducer.
/// Failed requests are logged and their samples dropped.
fn drive_requests(
    arrivals: &Receiver<RequestClass>,
    samples: &Sender<RequestSample>,
    pool: &TcpConnPool,
    token: &ShutdownToken,
) {
    let buffers = BufferPool::new();
    for class in arrivals.iter() {
        if token.is_triggered() {
            return;
        }
        match issue_request(class, pool, &buffers, token) {
            Ok(Some(sample)) => {
                if samples.send(sample).is_err() {
                    return;
                }
            }
            // Cancelled mid-request.
            Ok(None) => return,
            Err(err) => tracing::warn!(%class, error = %err, "request dropped"),
        }
    }
}

fn issue_request(
    class: RequestClass,
    pool: &TcpConnPool,
    buffers: &BufferPool,
    token: &ShutdownToken,
) -> Result<Option<RequestSample>, RequestError> {
    let started = Instant::now();
    let conn = pool.get()?;
    if let Err(err) = conn.stream.set_read_timeout(Some(READ_POLL)) {
        pool.discard(conn);
        return Err(RequestError::Read(err));
    }

    let mut tag = buffers.lease(TAG_LEN);
    class.encode(tag.as_mut_slice());
    if let Err(err) = (&conn.stream).write_all(&tag.as_slice()[..TAG_LEN]) {
        pool.discard(conn);
        return Err(RequestError::Write(err));
    }
    drop(tag);

    let response = match read_response(&conn.stream, buffers, token) {
        Ok(Some(response)) => response,
        Ok(None) => {
            pool.discard(conn);
            return Ok(None);
        }
        Err(err) => {
            pool.discard(conn);
            return Err(err);
        }
    };
    let round_trip = started.elapsed();
    pool.put(conn);

    Ok(Some(RequestSample {
        class,
        residence_us: response.finished_ts.saturating_sub(response.accepted_ts) as f64,
        waiting_us: response.running_ts.saturating_sub(response.accepted_ts) as f64,
        round_trip_us: round_trip.as_micros() as f64,
        memory: response.memory,
        jobs: response.jobs_number,
        cpu: response.cpu,
    }))
}

/// Read one newline-terminated JSON response into pooled scratch.
/// `Ok(None)` means cancellation fired while waiting.
fn read_response(
    stream: &TcpStream,
    buffers: &BufferPool,
    token: &ShutdownToken,
) -> Result<Option<Response>, RequestError> {
    let mut lease = buffers.lease(RESPONSE_SCRATCH);
    let buf = lease.as_mut_slice();
    let mut reader = stream;
    let mut filled = 0;
    loop {
        if let Some(end) = buf[..filled].iter().position(|&b| b == b'\n') {
            return serde_json::from_slice(&buf[..end])
                .map(Some)
                .map_err(RequestError::Decode);
        }
        if filled == buf.len() {
            return Err(RequestError::Oversized);
        }
        match reader.read(&mut buf[filled..]) {
            Ok(0) => return Err(RequestError::Eof),
            Ok(n) => filled += n,
            Err(err)
                if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
            {
                if token.is_triggered() {
                    return Ok(None);
                }
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(RequestError::Read(err)),
        }
    }
}

#[derive(Default)]
struct ClassAccumulators {
    residence: Accumulator,
    waiting: Accumulator,
    round_trip: Accumulator,
}

impl ClassAccumulators {
    fn push(&mut self, sample: &RequestSample) {
        self.residence.push(sample.residence_us);
        self.waiting.push(sample.waiting_us);
        self.round_trip.push(sample.round_trip_us);
    }

    fn summary(&self) -> ClassSummary {
        ClassSummary {
            count: self.residence.count(),
            residence: MetricSummary::from(&self.residence),
            waiting: MetricSummary::from(&self.waiting),
            round_trip: MetricSummary::from(&self.round_trip),
        }
    }
}

fn reduce(samples: &Receiver<RequestSample>, started: Instant) -> BenchResult {
    let mut fast = ClassAccumulators::default();
    let mut slow = ClassAccumulators::default();
    let mut memory = Accumulator::new();
    let mut jobs = Accumulator::new();
    let mut cpu = Accumulator::new();

    for sample in samples.iter() {
        match sample.class {
            RequestClass::Fast => fast.push(&sample),
            RequestClass::Slow => slow.push(&sample),
        }
        memory.push(sample.memory as f64);
        jobs.push(sample.jobs as f64);
        cpu.push(sample.cpu);
    }

    let elapsed = started.elapsed();
    let total = fast.residence.count() + slow.residence.count();
    let requests_per_second = if elapsed.is_zero() {
        0.0
    } else {
        total as f64 / elapsed.as_secs_f64()
    };

    BenchResult {
        fast: fast.summary(),
        slow: slow.summary(),
        samples: total,
        elapsed,
        requests_per_second,
        memory_mean: memory.mean(),
        jobs_mean: jobs.mean(),
        cpu_mean: cpu.mean(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slow_share_is_floored() {
        // 7 requests at 50% -> 3 slow, 4 fast.
        let n_slow = 7usize * 50 / 100;
        assert_eq!(n_slow, 3);
        assert_eq!(7 - n_slow, 4);
    }

    #[test]
    fn generator_with_zero_count_sends_nothing() {
        let (tx, rx) = bounded(4);
        let token = ShutdownToken::new();
        generate_arrivals(RequestClass::Slow, 0, 100.0, &tx, &token);
        drop(tx);
        assert!(rx.iter().next().is_none());
    }

    #[test]
    fn generator_emits_requested_count() {
        let (tx, rx) = bounded(64);
        let token = ShutdownToken::new();
        generate_arrivals(RequestClass::Fast, 10, 10_000.0, &tx, &token);
        drop(tx);
        assert_eq!(rx.iter().count(), 10);
    }

    #[test]
    fn generator_stops_on_cancellation() {
        let (tx, rx) = bounded(1024);
        let token = ShutdownToken::new();
        let emitter = {
            let token = token.clone();
            thread::spawn(move || generate_arrivals(RequestClass::Fast, 1_000_000, 100.0, &tx, &token))
        };
        thread::sleep(Duration::from_millis(50));
        token.trigger();
        emitter.join().unwrap();
        assert!(rx.iter().count() < 1_000_000);
    }
}
