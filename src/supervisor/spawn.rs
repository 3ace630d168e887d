//! Worker process spawning and per-child watching.
//!
//! Each worker is this binary re-executed with the hidden `worker`
//! subcommand. The listening socket crosses `exec` as an inherited
//! descriptor; settings travel in the environment. One watcher task per
//! child owns the `Child`, forwards its status lines, delivers signals while
//! the child is known to be unreaped, and reports the exit.

use std::ffi::OsString;
use std::os::fd::RawFd;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::mpsc;

use crate::net::LISTEN_FD_ENV;
use crate::supervisor::table::WorkerId;
use crate::worker::{WorkerMessage, WorkerSettings, WORKER_SETTINGS_ENV};

/// How worker processes are launched.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    program: PathBuf,
    args: Vec<OsString>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// This executable, re-run as `<exe> worker`.
    pub fn current_exe() -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?).arg("worker"))
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }
}

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Normal exit with status code.
    Exited(i32),
    /// Killed by signal.
    Signaled(i32),
    /// `wait` itself failed.
    Unknown,
}

impl ExitReason {
    pub fn from_status(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            ExitReason::Exited(code)
        } else if let Some(signal) = status.signal() {
            ExitReason::Signaled(signal)
        } else {
            ExitReason::Unknown
        }
    }

    pub fn code(&self) -> Option<i32> {
        match self {
            ExitReason::Exited(code) => Some(*code),
            _ => None,
        }
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitReason::Exited(code) => write!(f, "exited with status {}", code),
            ExitReason::Signaled(raw) => match Signal::try_from(*raw) {
                Ok(signal) => write!(f, "killed by signal {}", signal),
                Err(_) => write!(f, "killed by signal {}", raw),
            },
            ExitReason::Unknown => f.write_str("unknown reason"),
        }
    }
}

/// Something a worker did, as seen by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    Message(WorkerMessage),
    Exited(ExitReason),
}

/// Supervisor-side handle to one worker process.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pid: u32,
    signals: mpsc::UnboundedSender<Signal>,
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Ask the watcher to deliver `signal`. Returns false once the process is reaped.
    pub fn signal(&self, signal: Signal) -> bool {
        self.signals.send(signal).is_ok()
    }

    /// A handle with no process behind it.
    #[cfg(test)]
    pub fn detached(pid: u32) -> Self {
        let (signals, _) = mpsc::unbounded_channel();
        Self { pid, signals }
    }
}

/// Spawn one worker process.
///
/// Events are delivered on `events` tagged with `id`, ending with exactly one
/// [`WorkerEvent::Exited`].
pub fn spawn_worker(
    command: &WorkerCommand,
    listen_fd: RawFd,
    settings: &WorkerSettings,
    id: WorkerId,
    events: mpsc::UnboundedSender<(WorkerId, WorkerEvent)>,
) -> std::io::Result<ProcessHandle> {
    let encoded = settings.to_env_value().map_err(std::io::Error::other)?;

    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args)
        .env(LISTEN_FD_ENV, listen_fd.to_string())
        .env(WORKER_SETTINGS_ENV, encoded)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        // Terminal signals go to the supervisor only.
        .process_group(0)
        .kill_on_drop(true);

    // SAFETY: only async-signal-safe fcntl runs between fork and exec.
    unsafe {
        cmd.pre_exec(move || {
            fcntl(listen_fd, FcntlArg::F_SETFD(FdFlag::empty()))?;
            Ok(())
        });
    }

    let mut child = cmd.spawn()?;
    let pid = child
        .id()
        .ok_or_else(|| std::io::Error::other("worker exited before its pid was read"))?;
    let stdout = child.stdout.take();

    let (signal_tx, signal_rx) = mpsc::unbounded_channel();
    tokio::spawn(watch_child(id, child, stdout, signal_rx, events));

    tracing::debug!(worker = %id, pid, slot = settings.slot, "Worker spawned");
    Ok(ProcessHandle {
        pid,
        signals: signal_tx,
    })
}

async fn watch_child(
    id: WorkerId,
    mut child: Child,
    stdout: Option<ChildStdout>,
    mut signals: mpsc::UnboundedReceiver<Signal>,
    events: mpsc::UnboundedSender<(WorkerId, WorkerEvent)>,
) {
    let pid = child.id().map(|pid| Pid::from_raw(pid as i32));
    let mut lines = stdout.map(|out| BufReader::new(out).lines());

    let status = loop {
        tokio::select! {
            line = next_line(&mut lines), if lines.is_some() => match line {
                Some(line) => forward_line(id, &line, &events),
                None => lines = None,
            },
            Some(signal) = signals.recv() => {
                // Only reached while the child is unreaped, so the pid is still ours.
                if let Some(pid) = pid {
                    if let Err(e) = kill(pid, signal) {
                        tracing::debug!(worker = %id, signal = %signal, error = %e, "Signal delivery failed");
                    }
                }
            }
            status = child.wait() => break status,
        }
    };

    // Pick up whatever the worker wrote right before exiting.
    if lines.is_some() {
        let rest = async {
            while let Some(line) = next_line(&mut lines).await {
                forward_line(id, &line, &events);
            }
        };
        let _ = tokio::time::timeout(Duration::from_secs(1), rest).await;
    }

    let reason = match status {
        Ok(status) => ExitReason::from_status(status),
        Err(e) => {
            tracing::warn!(worker = %id, error = %e, "Waiting on worker failed");
            ExitReason::Unknown
        }
    };
    let _ = events.send((id, WorkerEvent::Exited(reason)));
}

async fn next_line(lines: &mut Option<Lines<BufReader<ChildStdout>>>) -> Option<String> {
    match lines {
        Some(lines) => lines.next_line().await.ok().flatten(),
        None => None,
    }
}

fn forward_line(id: WorkerId, line: &str, events: &mpsc::UnboundedSender<(WorkerId, WorkerEvent)>) {
    match WorkerMessage::from_line(line) {
        Ok(message) => {
            let _ = events.send((id, WorkerEvent::Message(message)));
        }
        Err(_) => tracing::debug!(worker = %id, line, "Ignoring non-protocol worker output"),
    }
}
