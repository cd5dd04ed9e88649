use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use perfcapd::capture::Capture;
use perfcapd::config::Config;

/// Performance-capture daemon for Linux/Android targets on Arm CPUs.
#[derive(Parser)]
#[command(name = "perfcapd", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,

    /// Run as an agent subprocess (spawned by the daemon itself).
    #[command(hide = true)]
    Agent {
        /// Agent personality: "external" or "perf".
        kind: String,

        /// File descriptor carrying the agent's data pipe.
        #[arg(long)]
        data_fd: Option<i32>,
    },
}

/// Build-time version info.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Target OS.
    pub fn target_os() -> &'static str {
        std::env::consts::OS
    }

    /// Target architecture.
    pub fn target_arch() -> &'static str {
        std::env::consts::ARCH
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!("{} ({}/{})", RELEASE, target_os(), target_arch())
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle the version subcommand before anything else.
    if let Some(Command::Version) = &cli.command {
        println!("perfcapd {}", version::full());
        return Ok(());
    }

    // Initialize tracing. Agent processes log to stderr; stdout is their
    // IPC channel.
    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    // Agent personality: serve the shell side and exit.
    if let Some(Command::Agent { kind, data_fd }) = &cli.command {
        if let Some(fd) = data_fd {
            tracing::debug!(fd, "agent data pipe attached");
        }
        return perfcapd::agents::agent_main(kind);
    }

    let cfg = match &cli.config {
        Some(path) => {
            Config::load(path).with_context(|| format!("loading config from {}", path.display()))?
        }
        None => Config::default(),
    };

    tracing::info!(version = version::RELEASE, "starting perfcapd");

    // The supervisor's reactor: exactly two cooperative worker threads,
    // one spare in case the other blocks in a syscall.
    let thread_counter = std::sync::atomic::AtomicUsize::new(0);
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name_fn(move || {
            let n = thread_counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            format!("perfcapd-iocx-{n}")
        })
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg).await })
}

async fn run(cfg: Config) -> Result<()> {
    let duration = cfg.session.duration;

    let mut capture = Capture::new(cfg)?;
    capture.start().await?;

    // Drain the frame streams. The controller transport sits here in a
    // full deployment; standalone runs account the bytes and discard them.
    if let Some(consumer) = capture.take_attrs_consumer() {
        spawn_drain("attrs", consumer);
    }
    if let Some(consumer) = capture.take_external_consumer() {
        spawn_drain("external", consumer);
    }

    // Wait for a terminal signal or the configured capture duration.
    let terminal = capture.terminal_token();
    match duration {
        Some(limit) => {
            tokio::select! {
                _ = terminal.cancelled() => {}
                _ = tokio::time::sleep(limit) => {
                    tracing::info!(?limit, "capture duration reached");
                }
            }
        }
        None => terminal.cancelled().await,
    }

    capture.stop().await?;

    tracing::info!("perfcapd stopped");

    Ok(())
}

/// Consume a frame stream on a blocking thread, logging throughput.
fn spawn_drain(name: &'static str, consumer: perfcapd::frame::FrameConsumer) {
    tokio::task::spawn_blocking(move || {
        let mut frames = 0u64;
        let mut bytes = 0u64;
        while let Some(frame) = consumer.read_frame() {
            frames += 1;
            bytes += frame.len() as u64;
        }
        tracing::debug!(stream = name, frames, bytes, "frame stream closed");
    });
}
