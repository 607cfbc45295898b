// Measurement server binary.
//
// Wires the TCP front end, the selected scheduling discipline, and the work
// sink over rendezvous channels, then serves until SIGINT/SIGTERM. Clean
// shutdown exits 0; configuration problems exit nonzero before anything
// starts.

use anyhow::{anyhow, bail, Context};
use crossbeam_channel::bounded;
use schedbench::scheduler::{Drr, Fcfs, Scheduler, SchedulerKind, FAST_PRIORITY, SLOW_PRIORITY};
use schedbench::server::{Routing, Server};
use schedbench::sink::WorkSink;
use schedbench::ShutdownToken;
use std::sync::atomic::AtomicI64;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const DEFAULT_LISTEN_ADDRESS: &str = "127.0.0.1:8000";

/// Command-line options parsed from program arguments.
struct CliOptions {
    listen_address: String,
    scheduler: Option<String>,
    slow_time: Duration,
}

fn parse_cli_options() -> anyhow::Result<CliOptions> {
    let mut listen_address = DEFAULT_LISTEN_ADDRESS.to_string();
    let mut scheduler = None;
    let mut slow_time = Duration::from_millis(1);

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        let (key, value) = match arg.split_once('=') {
            Some((key, value)) => (key.to_string(), value.to_string()),
            None => {
                let value = args
                    .next()
                    .ok_or_else(|| anyhow!("missing value for {arg}"))?;
                (arg, value)
            }
        };
        match key.as_str() {
            "--listen-address" => listen_address = value,
            "--scheduler" => scheduler = Some(value),
            "--slow-time" => {
                slow_time = parse_duration(&value)
                    .map_err(|err| anyhow!("invalid --slow-time {value:?}: {err}"))?;
            }
            other => bail!("unknown argument: {other}"),
        }
    }

    Ok(CliOptions {
        listen_address,
        scheduler,
        slow_time,
    })
}

/// Parse duration strings of the form `250ns`, `10us`, `1ms`, `2s`.
fn parse_duration(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .ok_or("missing unit (ns, us, ms or s)")?;
    let (number, unit) = value.split_at(split);
    let number: f64 = number.parse().map_err(|_| "not a number".to_string())?;
    let nanos = match unit {
        "ns" => number,
        "us" | "µs" => number * 1e3,
        "ms" => number * 1e6,
        "s" => number * 1e9,
        other => return Err(format!("unknown unit {other:?}")),
    };
    if nanos < 0.0 {
        return Err("negative duration".to_string());
    }
    Ok(Duration::from_nanos(nanos as u64))
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let options = parse_cli_options()?;
    let kind: SchedulerKind = options
        .scheduler
        .as_deref()
        .ok_or_else(|| anyhow!("--scheduler is required (fcfs or drr)"))?
        .parse()
        .map_err(|err: String| anyhow!(err))?;

    run(kind, &options)
}

fn run(kind: SchedulerKind, options: &CliOptions) -> anyhow::Result<()> {
    let token = ShutdownToken::new();
    token
        .install_signal_handler()
        .context("cannot install signal handler")?;

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
            drr.register_input(FAST_PRIORITY, high_rx)?;
            drr.register_input(SLOW_PRIORITY, low_rx)?;
            (Scheduler::Drr(drr), Routing::ByClass)
        }
    };

    let scheduler_thread = {
        let token = token.clone();
        thread::spawn(move || scheduler.run(&token))
    };
    let sink = WorkSink::new(out_rx, options.slow_time, in_flight.clone());
    let sink_thread = thread::spawn(move || sink.run());

    let server = Server::new(high_tx, low_tx, routing, in_flight);
    let bound = server
        .bind(&options.listen_address)
        .with_context(|| format!("cannot listen on {}", options.listen_address))?;
    tracing::info!(
        addr = %bound.local_addr()?,
        scheduler = %kind,
        slow_time = ?options.slow_time,
        "serving"
    );
    bound.serve(&token)?;
    drop(bound);

    scheduler_thread
        .join()
        .map_err(|_| anyhow!("scheduler thread panicked"))?;
    sink_thread
        .join()
        .map_err(|_| anyhow!("sink thread panicked"))?;
    tracing::info!("shutdown complete");
    Ok(())
}
