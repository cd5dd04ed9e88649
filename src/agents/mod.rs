//! Agent subprocess management: spawning, supervision, and the agent-side
//! entry point.

pub mod monitor;
pub mod spawner;
pub mod supervisor;
pub mod worker;

pub use monitor::{ProcessEvent, ProcessEventStream, ProcessMonitor, ProcessState};
pub use spawner::{AgentKind, AgentSpawner, SelfExecSpawner, SpawnedAgent, AGENT_DATA_FD};
pub use supervisor::{Supervisor, SupervisorDelegate};
pub use worker::{AgentWorker, WorkerState};

use std::io::{BufRead, Write};

use anyhow::{bail, Context, Result};
use tracing::{debug, info};

/// Entry point for the hidden `agent` subcommand.
///
/// The shell side owns the lifecycle: this process announces readiness on
/// stdout, then serves until the control channel delivers a shutdown
/// command or closes. The personality-specific work (owning perf fds,
/// gathering external bytes) happens behind this handshake.
pub fn agent_main(kind_arg: &str) -> Result<()> {
    let kind = match kind_arg {
        "external" => AgentKind::ExternalSource,
        "perf" => AgentKind::Perf,
        other => bail!("unknown agent kind: {other}"),
    };

    info!(kind = kind.arg(), "agent process starting");

    let stdout = std::io::stdout();
    {
        let mut out = stdout.lock();
        writeln!(out, "{}", worker::READY_HANDSHAKE).context("writing ready handshake")?;
        out.flush().context("flushing ready handshake")?;
    }

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line.context("reading control channel")?;
        match line.trim() {
            worker::SHUTDOWN_COMMAND => {
                debug!("shutdown requested");
                break;
            }
            other => debug!(command = other, "ignoring unknown control command"),
        }
    }

    info!(kind = kind.arg(), "agent process exiting");
    Ok(())
}
