//! Agent process spawning.
//!
//! Agents are the daemon's own binary re-executed with the hidden `agent`
//! subcommand, so privilege and isolation boundaries stay inside one
//! shipped executable. The spawner abstraction keeps the supervisor
//! testable without forking real processes.

use std::io::{Read, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::PathBuf;
use std::process::{Command, Stdio};

use anyhow::{Context, Result};
use tracing::debug;

/// Which agent personality to launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentKind {
    /// Relays externally-produced counter bytes into the capture.
    ExternalSource,
    /// Owns the perf_event_open file descriptors.
    Perf,
}

impl AgentKind {
    pub fn arg(self) -> &'static str {
        match self {
            AgentKind::ExternalSource => "external",
            AgentKind::Perf => "perf",
        }
    }
}

/// A freshly spawned agent: its pid and the IPC channel endpoints.
pub struct SpawnedAgent {
    pub pid: i32,
    /// Shell-to-agent control channel (the agent's stdin).
    pub control: Box<dyn Write + Send>,
    /// Agent-to-shell event channel (the agent's stdout).
    pub events: Box<dyn Read + Send>,
}

/// Launches agent subprocesses.
pub trait AgentSpawner: Send + Sync {
    /// Spawn an agent, optionally handing it `data_fd` as its data-out
    /// file descriptor. Ownership of the fd moves to the child.
    fn spawn(&self, kind: AgentKind, data_fd: Option<OwnedFd>) -> Result<SpawnedAgent>;
}

/// File descriptor the child finds its data pipe on.
pub const AGENT_DATA_FD: i32 = 3;

/// Spawner that re-executes the current binary as an agent.
pub struct SelfExecSpawner {
    exe: PathBuf,
}

impl SelfExecSpawner {
    pub fn new() -> Result<Self> {
        let exe = std::env::current_exe().context("locating daemon binary")?;
        Ok(Self { exe })
    }
}

impl AgentSpawner for SelfExecSpawner {
    fn spawn(&self, kind: AgentKind, data_fd: Option<OwnedFd>) -> Result<SpawnedAgent> {
        let mut command = Command::new(&self.exe);
        command
            .arg("agent")
            .arg(kind.arg())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        if let Some(fd) = data_fd {
            let raw = fd.as_raw_fd();
            // Move the pipe's write end onto the well-known fd. dup2 clears
            // O_CLOEXEC on the duplicate, so it survives the exec; the
            // original closes with it.
            unsafe {
                use std::os::unix::process::CommandExt;
                command.pre_exec(move || {
                    if libc::dup2(raw, AGENT_DATA_FD) < 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
            // Keep the fd alive until the child has been forked.
            command.arg("--data-fd");
            command.arg(AGENT_DATA_FD.to_string());
            let child = spawn_with_fd(command, fd)?;
            return wrap_child(child);
        }

        let child = command.spawn().context("spawning agent process")?;
        wrap_child(child)
    }
}

fn spawn_with_fd(mut command: Command, fd: OwnedFd) -> Result<std::process::Child> {
    let child = command.spawn().context("spawning agent process")?;
    // The child holds its duplicate; release the parent's copy.
    drop(fd);
    Ok(child)
}

fn wrap_child(mut child: std::process::Child) -> Result<SpawnedAgent> {
    let pid = child.id() as i32;
    let control = child.stdin.take().context("agent stdin missing")?;
    let events = child.stdout.take().context("agent stdout missing")?;

    debug!(pid, "spawned agent process");

    // The Child handle is dropped without waiting; the process monitor
    // reaps it on SIGCHLD.
    Ok(SpawnedAgent {
        pid,
        control: Box::new(control),
        events: Box::new(events),
    })
}
