//! Child process lifecycle: spawn, signal, and a single exit notification.

use std::fmt;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::error::ProbeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Starting,
    Running,
    Terminating,
    Exited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermSignal {
    Terminate,
    Kill,
}

impl TermSignal {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Terminate => "SIGTERM",
            Self::Kill => "SIGKILL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExitReport {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitReport {
    pub const fn from_code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub const fn from_signal(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    pub const fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
        }
    }

    pub fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            Self {
                code: status.code(),
                signal: status.signal(),
            }
        }
        #[cfg(not(unix))]
        {
            Self {
                code: status.code(),
                signal: None,
            }
        }
    }

    pub const fn success(&self) -> bool {
        matches!(self.code, Some(0))
    }
}

impl fmt::Display for ExitReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exited with code {code}"),
            (None, Some(signal)) => write!(f, "killed by signal {signal}"),
            (None, None) => write!(f, "exited with unknown status"),
        }
    }
}

#[derive(Debug)]
struct Shared {
    state: Mutex<LifecycleState>,
    exit: Mutex<Option<ExitReport>>,
}

/// Cheap, cloneable view of a spawned child. Signals go through here; the
/// process itself is owned by the exit watcher task.
#[derive(Debug, Clone)]
pub struct ChildHandle {
    pid: u32,
    shared: Arc<Shared>,
}

pub struct ChildStreams {
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

pub struct Launched {
    pub handle: ChildHandle,
    pub streams: ChildStreams,
    /// Resolves exactly once, when the child has been reaped.
    pub exit: oneshot::Receiver<ExitReport>,
}

pub struct ProcessSupervisor;

impl ProcessSupervisor {
    pub fn launch(command: &str, args: &[String]) -> Result<Launched, ProbeError> {
        let launch_err = |source: std::io::Error| ProbeError::Launch {
            command: command.to_string(),
            source,
        };

        let mut child = Command::new(command)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(launch_err)?;

        let pid = child
            .id()
            .ok_or_else(|| launch_err(std::io::Error::other("child exited before pid was read")))?;
        let streams = take_streams(&mut child).map_err(launch_err)?;

        let shared = Arc::new(Shared {
            state: Mutex::new(LifecycleState::Starting),
            exit: Mutex::new(None),
        });
        let handle = ChildHandle { pid, shared };
        handle.set_state(LifecycleState::Running);
        info!(pid, command, args = ?args, "launched child process");

        let (tx, exit) = oneshot::channel();
        tokio::spawn(watch_exit(child, handle.clone(), tx));

        Ok(Launched {
            handle,
            streams,
            exit,
        })
    }
}

fn take_streams(child: &mut Child) -> std::io::Result<ChildStreams> {
    let missing = |name: &str| std::io::Error::other(format!("failed to capture child {name}"));
    Ok(ChildStreams {
        stdin: child.stdin.take().ok_or_else(|| missing("stdin"))?,
        stdout: child.stdout.take().ok_or_else(|| missing("stdout"))?,
        stderr: child.stderr.take().ok_or_else(|| missing("stderr"))?,
    })
}

async fn watch_exit(mut child: Child, handle: ChildHandle, tx: oneshot::Sender<ExitReport>) {
    let report = match child.wait().await {
        Ok(status) => ExitReport::from_status(status),
        Err(err) => {
            warn!(pid = handle.pid, error = %err, "failed waiting for child");
            ExitReport::unknown()
        }
    };
    {
        let mut state = handle.shared.state.lock();
        *handle.shared.exit.lock() = Some(report);
        *state = LifecycleState::Exited;
    }
    debug!(pid = handle.pid, %report, "child reaped");
    let _ = tx.send(report);
}

impl ChildHandle {
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    pub fn state(&self) -> LifecycleState {
        *self.shared.state.lock()
    }

    pub fn exit_report(&self) -> Option<ExitReport> {
        *self.shared.exit.lock()
    }

    fn set_state(&self, next: LifecycleState) {
        *self.shared.state.lock() = next;
    }

    /// Asks the child to stop. Returns `Ok(false)` without signaling when the
    /// child is already terminating or gone.
    pub fn terminate(&self, signal: TermSignal) -> Result<bool, ProbeError> {
        let mut state = self.shared.state.lock();
        match (*state, signal) {
            (LifecycleState::Exited, _) | (LifecycleState::Terminating, TermSignal::Terminate) => {
                return Ok(false);
            }
            _ => {}
        }
        send_signal(self.pid, signal)?;
        *state = LifecycleState::Terminating;
        info!(pid = self.pid, signal = signal.name(), "signaled child");
        Ok(true)
    }

    /// Escalation used after a termination grace period runs out.
    pub fn kill(&self) -> Result<bool, ProbeError> {
        self.terminate(TermSignal::Kill)
    }
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: TermSignal) -> Result<(), ProbeError> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid).map_err(|_| ProbeError::Signal {
        pid,
        reason: "pid out of range".to_string(),
    })?;
    let sig = match signal {
        TermSignal::Terminate => Signal::SIGTERM,
        TermSignal::Kill => Signal::SIGKILL,
    };
    match kill(Pid::from_raw(raw), sig) {
        // Exited but not yet reaped; the watcher will report it.
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(errno) => Err(ProbeError::Signal {
            pid,
            reason: errno.desc().to_string(),
        }),
    }
}

#[cfg(not(unix))]
fn send_signal(pid: u32, _signal: TermSignal) -> Result<(), ProbeError> {
    Err(ProbeError::Signal {
        pid,
        reason: "signals are only supported on unix".to_string(),
    })
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Duration;

    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn reports_exit_code_once() {
        let launched = ProcessSupervisor::launch("sh", &sh("exit 7")).expect("launch");
        let report = tokio::time::timeout(Duration::from_secs(5), launched.exit)
            .await
            .expect("exit in time")
            .expect("exit report");
        assert_eq!(report, ExitReport::from_code(7));
        assert_eq!(launched.handle.state(), LifecycleState::Exited);
        assert_eq!(launched.handle.exit_report(), Some(report));
    }

    #[tokio::test]
    async fn missing_executable_is_launch_error() {
        let err = ProcessSupervisor::launch("/definitely/not/a/real/binary", &[])
            .err()
            .expect("launch must fail");
        assert!(matches!(err, ProbeError::Launch { .. }));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn terminate_is_idempotent() {
        let launched = ProcessSupervisor::launch("sleep", &["30".to_string()]).expect("launch");
        let handle = launched.handle.clone();
        assert_eq!(handle.state(), LifecycleState::Running);

        assert!(handle.terminate(TermSignal::Terminate).expect("first terminate"));
        assert!(!handle.terminate(TermSignal::Terminate).expect("second terminate"));
        assert_eq!(handle.state(), LifecycleState::Terminating);

        let report = tokio::time::timeout(Duration::from_secs(5), launched.exit)
            .await
            .expect("exit in time")
            .expect("exit report");
        assert_eq!(report.signal, Some(15));
        assert!(!handle.terminate(TermSignal::Terminate).expect("after exit"));
        assert!(!handle.kill().expect("kill after exit"));
    }

    #[test]
    fn exit_report_display() {
        assert_eq!(ExitReport::from_code(0).to_string(), "exited with code 0");
        assert_eq!(ExitReport::from_signal(9).to_string(), "killed by signal 9");
        assert!(ExitReport::from_code(0).success());
        assert!(!ExitReport::from_signal(15).success());
    }
}
