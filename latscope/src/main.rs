//! # latscope - Main Entry Point
//!
//! Resolves the target, runs the pre-flight checks, then hands one session to
//! the [`LifecycleController`]. Samples go to stdout; status, diagnostics and
//! the `--stats` summary go to stderr.

use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, info, warn};
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::signal::unix::{signal, SignalKind};

use latscope::cli::{Args, OutputFormat};
use latscope::consumer::{JsonSink, LatencySink, StatsSink, TextSink};
use latscope::domain::Pid;
use latscope::lifecycle::{LifecycleController, Request};
use latscope::platform::UprobePlatform;
use latscope::preflight::{run_preflight_checks, Unsupported, EXIT_UNSUPPORTED};
use latscope::process::{exe_path, maps_binary};
use latscope::process_lookup::find_process;

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;

/// Arguments that parse but do not name a target
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct UsageError(String);

fn main() {
    let args = Args::parse();
    init_logging(args.quiet);

    std::process::exit(match run(args) {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            exit_code_for(&e)
        }
    });
}

/// `RUST_LOG` wins; otherwise info, or warn with `--quiet`
fn init_logging(quiet: bool) {
    let default = if quiet { "warn" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default))
        .format_timestamp(None)
        .init();
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    if err.downcast_ref::<Unsupported>().is_some() {
        EXIT_UNSUPPORTED
    } else if err.downcast_ref::<UsageError>().is_some() {
        EXIT_USAGE
    } else {
        EXIT_ERROR
    }
}

/// Resolve PID and binary path from CLI arguments.
///
/// Supports three modes:
/// - `latscope my-app` - find process by name, binary from /proc
/// - `latscope --pid 1234` - explicit PID, binary from /proc
/// - `latscope --pid 1234 --target ./libsvc.so` - explicit PID and binary
fn resolve_pid_and_target(args: &Args) -> Result<(Pid, PathBuf)> {
    if let Some(ref name) = args.process {
        if args.pid.is_some() {
            return Err(UsageError(
                "Cannot use PROCESS argument with --pid.\n\n\
                 Use either:\n  \
                 latscope my-app --symbol f        (auto-detect)\n  \
                 latscope --pid 1234 --symbol f    (explicit PID)"
                    .to_string(),
            )
            .into());
        }
        let info = find_process(name, &args.symbol)?;
        debug!("{name} resolved to {} ({})", info.pid, info.command);
        let target = match &args.target {
            Some(t) => canonical(t)?,
            None => info.exe_path,
        };
        return Ok((info.pid, target));
    }

    if let Some(pid) = args.pid.map(Pid) {
        let target = match &args.target {
            Some(t) => canonical(t)?,
            None => exe_path(pid)?,
        };
        return Ok((pid, target));
    }

    Err(UsageError(
        "Missing required argument: PROCESS or --pid\n\n\
         Usage:\n  \
         latscope my-app --symbol f        Auto-detect PID and binary\n  \
         latscope --pid 1234 --symbol f    Explicit PID, auto-detect binary\n\n\
         Run 'latscope --help' for more options"
            .to_string(),
    )
    .into())
}

fn canonical(path: &Path) -> Result<PathBuf> {
    std::fs::canonicalize(path).with_context(|| format!("Failed to resolve path: {}", path.display()))
}

/// Resolves on SIGINT, SIGTERM, or after `duration_secs` (0 = never)
///
/// Both handlers are installed before returning, so a signal that arrives
/// while probes are still being attached is not lost.
fn shutdown_signal(duration_secs: u64) -> Result<impl Future<Output = ()> + Send + 'static> {
    let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let deadline = (duration_secs > 0).then(|| Duration::from_secs(duration_secs));

    Ok(async move {
        let expired = async {
            match deadline {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            _ = sigint.recv() => info!("Interrupted"),
            _ = sigterm.recv() => info!("Terminated"),
            () = expired => info!("Duration limit reached"),
        }
    })
}

fn output_sink(format: OutputFormat) -> Box<dyn LatencySink> {
    match format {
        OutputFormat::Text => Box::new(TextSink::new(io::stdout())),
        OutputFormat::Json => Box::new(JsonSink::new(io::stdout())),
    }
}

#[tokio::main]
async fn run(args: Args) -> Result<()> {
    let quiet = args.quiet;
    let (pid, target) = resolve_pid_and_target(&args)?;

    run_preflight_checks(&target, pid, quiet)?;
    match maps_binary(pid, &target) {
        Ok(true) => {}
        Ok(false) => warn!(
            "{} is not mapped by {pid}; probes will not fire until it is loaded",
            target.display()
        ),
        Err(e) => debug!("Skipping mapping check: {e:#}"),
    }

    if !quiet {
        eprintln!("latscope v{}", env!("CARGO_PKG_VERSION"));
        eprintln!("target: {}", target.display());
        eprintln!("pid: {}", pid.0);
        eprintln!("symbol: {}", args.symbol);
    }

    let request = Request {
        binary: target.clone(),
        symbol: args.symbol.clone(),
        pid,
        exit_mode: args.exit_mode,
    };
    let mut platform = UprobePlatform::new(args.object_source(), args.ring_size, target);
    let mut sink = StatsSink::new(output_sink(args.format));
    let mut controller = LifecycleController::new(shutdown_signal(args.duration)?);

    let started = Instant::now();
    let report = controller.run(&mut platform, &request, &mut sink).await?;

    if !quiet {
        eprintln!(
            "\n{:.1}s, {} probe(s), {} samples ({} dropped, {} malformed, {} read errors)",
            started.elapsed().as_secs_f64(),
            report.probes,
            report.consumer.samples,
            report.consumer.dropped,
            report.consumer.malformed,
            report.consumer.read_errors,
        );
    }
    if args.stats {
        eprintln!("latency: {}", sink.stats());
    }
    Ok(())
}
