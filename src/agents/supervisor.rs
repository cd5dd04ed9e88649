//! Supervisor for the agent worker processes.
//!
//! All mutable supervisor state (the pid → worker map, the `terminated`
//! and `created_any` flags) lives inside one command-processing task, the
//! strand: commands arrive over a channel and are applied strictly in
//! order, so no lock is ever held across an await. A companion signal
//! dispatcher owns the process signal set and feeds `SIGCHLD` into the
//! process monitor.

use std::collections::HashMap;
use std::os::fd::OwnedFd;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::monitor::ProcessMonitor;
use super::spawner::{AgentKind, AgentSpawner};
use super::worker::{AgentWorker, WorkerState};

/// Callbacks into the object owning the supervisor.
pub trait SupervisorDelegate: Send + Sync + 'static {
    /// A terminal signal (HUP/INT/TERM/ABRT) arrived.
    fn on_terminal_signal(&self, signo: i32);
    /// The last agent exited and the supervisor stopped.
    fn on_agent_thread_terminated(&self);
}

enum Command {
    AddAgent {
        kind: AgentKind,
        data_fd: Option<OwnedFd>,
        reply: oneshot::Sender<bool>,
    },
    WorkerTerminated {
        pid: i32,
    },
    Shutdown,
}

/// Spawns, monitors, and reaps agent subprocesses.
pub struct Supervisor {
    command_tx: mpsc::UnboundedSender<Command>,
    monitor: Arc<ProcessMonitor>,
    stopped: CancellationToken,
}

struct Strand {
    spawner: Arc<dyn AgentSpawner>,
    delegate: Arc<dyn SupervisorDelegate>,
    monitor: Arc<ProcessMonitor>,
    command_tx: mpsc::UnboundedSender<Command>,
    stopped: CancellationToken,

    agent_workers: HashMap<i32, Arc<AgentWorker>>,
    created_any: bool,
    terminated: bool,
}

impl Supervisor {
    /// Create the supervisor and start its strand and signal dispatcher.
    pub fn start(
        spawner: Arc<dyn AgentSpawner>,
        delegate: Arc<dyn SupervisorDelegate>,
    ) -> Self {
        let monitor = Arc::new(ProcessMonitor::new());
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let stopped = CancellationToken::new();

        let strand = Strand {
            spawner,
            delegate: Arc::clone(&delegate),
            monitor: Arc::clone(&monitor),
            command_tx: command_tx.clone(),
            stopped: stopped.clone(),
            agent_workers: HashMap::new(),
            created_any: false,
            terminated: false,
        };
        tokio::spawn(strand.run(command_rx));

        spawn_signal_dispatcher(Arc::clone(&monitor), delegate, stopped.clone());

        Self {
            command_tx,
            monitor,
            stopped,
        }
    }

    /// Spawn a new agent and wait until it is ready.
    ///
    /// Returns `false` without launching when the supervisor has already
    /// terminated, or when the spawn or handshake fails.
    pub async fn add_agent(&self, kind: AgentKind, data_fd: Option<OwnedFd>) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .command_tx
            .send(Command::AddAgent {
                kind,
                data_fd,
                reply: reply_tx,
            })
            .is_err()
        {
            return false;
        }
        reply_rx.await.unwrap_or(false)
    }

    /// Request a graceful stop of every agent and, once the worker map has
    /// drained, of the supervisor itself. Idempotent.
    pub fn shutdown(&self) {
        let _ = self.command_tx.send(Command::Shutdown);
    }

    /// Resolved once the supervisor has fully stopped.
    pub fn stopped(&self) -> CancellationToken {
        self.stopped.clone()
    }

    pub fn is_terminated(&self) -> bool {
        self.stopped.is_cancelled()
    }

    /// The process monitor backing the pid observers.
    pub fn monitor(&self) -> &Arc<ProcessMonitor> {
        &self.monitor
    }
}

impl Strand {
    async fn run(mut self, mut command_rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = command_rx.recv().await {
            match command {
                Command::AddAgent {
                    kind,
                    data_fd,
                    reply,
                } => self.handle_add_agent(kind, data_fd, reply),
                Command::WorkerTerminated { pid } => {
                    debug!(pid, "agent terminated notification");
                    self.agent_workers.remove(&pid);
                    self.check_terminated();
                }
                Command::Shutdown => {
                    if self.agent_workers.is_empty() {
                        self.terminate();
                    } else {
                        debug!("requesting all agents to shut down");
                        for worker in self.agent_workers.values() {
                            worker.shutdown();
                        }
                    }
                }
            }

            if self.terminated {
                break;
            }
        }
        // Dropping the receiver makes every later command fail fast at the
        // sender, so add_agent after termination yields false.
    }

    fn handle_add_agent(
        &mut self,
        kind: AgentKind,
        data_fd: Option<OwnedFd>,
        reply: oneshot::Sender<bool>,
    ) {
        if self.terminated {
            let _ = reply.send(false);
            return;
        }

        debug!(?kind, "creating agent process");
        let spawned = match self.spawner.spawn(kind, data_fd) {
            Ok(spawned) => spawned,
            Err(e) => {
                warn!(?kind, error = %e, "agent spawn failed");
                let _ = reply.send(false);
                return;
            }
        };

        let pid = spawned.pid;
        let worker = Arc::new(AgentWorker::launch(spawned, kind));

        self.created_any = true;
        self.agent_workers.insert(pid, Arc::clone(&worker));

        self.observe_agent_pid(pid, Arc::clone(&worker));
        self.observe_worker_state(pid, Arc::clone(&worker));

        // Resolve the caller once the handshake (or early death) lands;
        // never block the strand on it.
        tokio::spawn(async move {
            let _ = reply.send(worker.wait_launched().await);
        });
    }

    /// Pump process-monitor events for one pid into its worker.
    fn observe_agent_pid(&self, pid: i32, worker: Arc<AgentWorker>) {
        let mut stream = self.monitor.monitor_forked_pid(pid);
        tokio::spawn(async move {
            while let Some(event) = stream.next_event().await {
                debug!(pid, state = ?event.state, "agent process event");
                if event.state.is_terminal() {
                    worker.on_sigchild();
                    return;
                }
                // Attaching/attached and friends are informational only.
            }
        });
    }

    /// Translate the worker's terminal state change into a strand command.
    fn observe_worker_state(&self, pid: i32, worker: Arc<AgentWorker>) {
        let command_tx = self.command_tx.clone();
        let mut rx = worker.subscribe();
        tokio::spawn(async move {
            loop {
                if *rx.borrow_and_update() == WorkerState::Terminated {
                    let _ = command_tx.send(Command::WorkerTerminated { pid });
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        });
    }

    fn check_terminated(&mut self) {
        if self.created_any && self.agent_workers.is_empty() {
            self.terminate();
        }
    }

    fn terminate(&mut self) {
        debug!("all agents exited, terminating");
        self.terminated = true;
        self.stopped.cancel();
        self.delegate.on_agent_thread_terminated();
    }
}

/// Subscribe to the daemon's signal set and dispatch until the supervisor
/// stops. `SIGCHLD` feeds the process monitor; terminal signals are
/// forwarded to the delegate.
fn spawn_signal_dispatcher(
    monitor: Arc<ProcessMonitor>,
    delegate: Arc<dyn SupervisorDelegate>,
    stopped: CancellationToken,
) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut sighup = match signal(SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "signal dispatcher not installed");
                return;
            }
        };
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "signal dispatcher not installed");
                return;
            }
        };
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "signal dispatcher not installed");
                return;
            }
        };
        let mut sigabrt = match signal(SignalKind::from_raw(libc::SIGABRT)) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "signal dispatcher not installed");
                return;
            }
        };
        let mut sigchld = match signal(SignalKind::child()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "signal dispatcher not installed");
                return;
            }
        };

        loop {
            tokio::select! {
                _ = stopped.cancelled() => return,
                _ = sigchld.recv() => monitor.on_sigchild(),
                _ = sighup.recv() => delegate.on_terminal_signal(libc::SIGHUP),
                _ = sigint.recv() => delegate.on_terminal_signal(libc::SIGINT),
                _ = sigterm.recv() => delegate.on_terminal_signal(libc::SIGTERM),
                _ = sigabrt.recv() => delegate.on_terminal_signal(libc::SIGABRT),
            }
        }
    });
}
