// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Entry point: parses CLI options, selects the TCTI and logger, starts the
//! pipeline, and runs until a shutdown signal is observed.

use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use clap::Parser;
use nix::sys::signal::SigSet;
use nix::sys::signal::Signal;
use tabd::bus::LocalBusTransport;
use tabd::logging;
use tabd::logging::LoggerKind;
use tabd::pipeline::Pipeline;
use tabd::pipeline::PipelineConfig;
use tabd::pipeline::rand_file_from_env;
use tabd_tcti::DeviceTcti;
use tabd_tcti::LoopbackTcti;
use tabd_tcti::Tcti;

/// `tabd`: a TPM 2.0 access broker daemon.
#[derive(Parser)]
#[command(name = "tabd", about = "TPM 2.0 access broker daemon")]
struct Options {
    /// Where to send log output.
    #[arg(long, value_enum, default_value_t = LoggerKind::Stdout)]
    logger: LoggerKind,

    /// Use the system bus instead of the per-session bus.
    #[arg(long)]
    system: bool,

    /// TCTI transport to use: `loopback`, or `device:<path>` for a
    /// `/dev/tpmrm*`-style character device.
    #[arg(long, default_value = "device:/dev/tpmrm0")]
    tcti: String,

    /// Maximum accepted declared command size, in bytes.
    #[arg(long, default_value_t = tabd_protocol::DEFAULT_MAX_CMD)]
    max_cmd_size: u32,

    /// Depth of each pipeline stage's inbound queue.
    #[arg(long, default_value_t = 64)]
    queue_depth: usize,
}

fn parse_tcti(spec: &str) -> Result<Box<dyn Tcti>, String> {
    if spec == "loopback" {
        return Ok(Box::new(LoopbackTcti::new()));
    }
    if let Some(path) = spec.strip_prefix("device:") {
        return Ok(Box::new(DeviceTcti::new(path)));
    }
    Err(format!("unrecognized --tcti value: {spec:?}"))
}

fn main() -> ExitCode {
    let opts = Options::parse();
    logging::init(opts.logger);

    if opts.system {
        tracing::info!("requesting the system bus instead of the session bus");
    }

    let tcti = match parse_tcti(&opts.tcti) {
        Ok(tcti) => tcti,
        Err(err) => {
            tracing::error!(%err, "invalid --tcti");
            return ExitCode::FAILURE;
        }
    };

    let config = PipelineConfig {
        max_cmd: opts.max_cmd_size,
        queue_depth: opts.queue_depth,
        rand_file: rand_file_from_env(),
    };

    // Block SIGINT/SIGTERM on this thread before spawning the pipeline's
    // workers: a blocked signal mask is inherited by every thread spawned
    // afterward, so the workers never receive these signals directly and
    // the dedicated sigwait thread stays the sole handler.
    let mask = block_shutdown_signals();

    let pipeline = match Pipeline::start(tcti, config) {
        Ok(pipeline) => pipeline,
        Err(err) => {
            tracing::error!(%err, "failed to start tabd");
            return ExitCode::FAILURE;
        }
    };

    // The bus facade is only ever handed a fully-constructed `Pipeline`, so
    // no handler can observe partial initialization. A real bus binding
    // would take `_transport` from here and register it for dispatch; that
    // plumbing is an external collaborator this crate doesn't provide.
    let _transport = LocalBusTransport::new(pipeline.clone());

    let shutdown_requested = spawn_signal_wait_thread(mask);

    tracing::info!("tabd running");
    while !shutdown_requested.load(Ordering::Acquire) {
        thread::sleep(Duration::from_millis(200));
    }

    tracing::info!("shutdown signal received, stopping tabd");
    pipeline.shutdown();
    ExitCode::SUCCESS
}

/// Blocks `SIGINT`/`SIGTERM` on the calling thread via `pthread_sigmask`.
/// Must run on the main thread before any worker thread is spawned: a
/// thread inherits its creator's signal mask only at spawn time, so
/// blocking here first is what keeps these signals from ever being
/// delivered to (and killing) a pipeline worker.
fn block_shutdown_signals() -> SigSet {
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGINT);
    mask.add(Signal::SIGTERM);
    mask.thread_block().expect("failed to block SIGINT/SIGTERM on the main thread");
    mask
}

/// Spawns a dedicated thread that `sigwait`s on `mask`, flipping a shared
/// flag once one arrives. The signal-handling thread owns a cancellation
/// token shared with the main supervisor loop, and never touches pipeline
/// state directly.
fn spawn_signal_wait_thread(mask: SigSet) -> Arc<AtomicBool> {
    let flag = Arc::new(AtomicBool::new(false));
    let thread_flag = flag.clone();
    thread::Builder::new()
        .name("tabd-signal".into())
        .spawn(move || match mask.wait() {
            Ok(signal) => {
                tracing::debug!(?signal, "received shutdown signal");
                thread_flag.store(true, Ordering::Release);
            }
            Err(err) => {
                tracing::warn!(%err, "sigwait failed; falling back to uncontrolled shutdown");
                thread_flag.store(true, Ordering::Release);
            }
        })
        .expect("failed to spawn signal-handling thread");
    flag
}
