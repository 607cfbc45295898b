// Benchmark driver.
//
// Replays the blocks of a workload file against a running measurement
// server, one closed-loop run per block, and appends one CSV row per block
// to the output file (stdout by default). SIGINT stops after the current
// block; the row for an interrupted block still reports the configured
// request count alongside whatever samples were measured.

use anyhow::{anyhow, bail, Context};
use indicatif::{ProgressBar, ProgressStyle};
use schedbench::bench::{self, BenchConfig};
use schedbench::workload::{self, Workload};
use schedbench::{SchedulerKind, ShutdownToken};
use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;

const DEFAULT_SERVER_ADDRESS: &str = "127.0.0.1:8000";
const DEFAULT_MAX_OPEN_CONNS: usize = 8;
const DEFAULT_MAX_IDLE_CONNS: usize = 8;
const DEFAULT_CONCURRENCY: usize = 8;

struct CliOptions {
    server_address: String,
    scheduler: Option<String>,
    input_file: Option<PathBuf>,
    output_file: Option<PathBuf>,
    max_open_conns: usize,
    max_idle_conns: usize,
    concurrency: usize,
}

fn parse_cli_options() -> anyhow::Result<CliOptions> {
    let mut options = CliOptions {
        server_address: DEFAULT_SERVER_ADDRESS.to_string(),
        scheduler: None,
        input_file: None,
        output_file: None,
        max_open_conns: DEFAULT_MAX_OPEN_CONNS,
        max_idle_conns: DEFAULT_MAX_IDLE_CONNS,
        concurrency: DEFAULT_CONCURRENCY,
    };

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
            "--server-address" => options.server_address = value,
            "--scheduler" => options.scheduler = Some(value),
            "--input-file" => options.input_file = Some(PathBuf::from(value)),
            "--output-file" => options.output_file = Some(PathBuf::from(value)),
            "--max-open-connections" => {
                options.max_open_conns = value
                    .parse()
                    .map_err(|_| anyhow!("invalid --max-open-connections {value:?}"))?;
            }
            "--max-idle-connections" => {
                options.max_idle_conns = value
                    .parse()
                    .map_err(|_| anyhow!("invalid --max-idle-connections {value:?}"))?;
            }
            "--concurrency" => {
                options.concurrency = value
                    .parse()
                    .map_err(|_| anyhow!("invalid --concurrency {value:?}"))?;
            }
            other => bail!("unknown argument: {other}"),
        }
    }

    Ok(options)
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
    let input = options
        .input_file
        .as_deref()
        .ok_or_else(|| anyhow!("--input-file is required"))?;
    let blocks = Workload::from_file(input)
        .with_context(|| format!("cannot load workload {}", input.display()))?;

    let token = ShutdownToken::new();
    token
        .install_signal_handler()
        .context("cannot install signal handler")?;

    let mut out: Box<dyn Write> = match &options.output_file {
        Some(path) => Box::new(
            File::create(path).with_context(|| format!("cannot create {}", path.display()))?,
        ),
        None => Box::new(io::stdout()),
    };
    workload::write_csv_header(&mut out)?;

    let progress = ProgressBar::new(blocks.workload.len() as u64);
    progress.set_style(
        ProgressStyle::with_template(
            "{prefix:>8} [{bar:40.cyan/blue}] {pos:>2}/{len:2} blocks ({elapsed})",
        )
        .expect("static template")
        .progress_chars("=>-"),
    );
    progress.set_prefix("bench");

    for (index, block) in blocks.workload.iter().enumerate() {
        tracing::info!(
            block = index,
            tot_requests = block.tot_requests,
            fast_rate = block.fast_rate,
            slow_rate = block.slow_rate,
            slow_percent = block.slow_percent,
            "starting block"
        );
        let config = BenchConfig {
            server_address: options.server_address.clone(),
            tot_requests: block.tot_requests,
            slow_percent: block.slow_percent,
            fast_rate: block.fast_rate,
            slow_rate: block.slow_rate,
            concurrency: options.concurrency,
            max_open_conns: options.max_open_conns,
            max_idle_conns: options.max_idle_conns,
        };

        let result = bench::run(&config, &token);
        workload::write_csv_row(&mut out, &kind.to_string(), block, &result)?;
        out.flush()?;
        progress.inc(1);
        tracing::info!(
            block = index,
            samples = result.samples,
            rps = result.requests_per_second,
            "block finished"
        );

        if token.is_triggered() {
            tracing::info!("interrupted, stopping after current block");
            break;
        }
    }

    progress.finish_and_clear();
    Ok(())
}
