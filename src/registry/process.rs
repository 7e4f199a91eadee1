// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Operating system process control.
//!
//! Liveness checks and termination of processes by id. On unix this is done
//! with signals: signal 0 for liveness, SIGTERM for a graceful stop, and
//! SIGKILL for a forced one. A process leading its own process group is
//! signaled along with its group. Elsewhere liveness is read from the
//! system process table, and `taskkill` does the stopping.

use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

/// Interval between liveness checks while waiting for a process to exit.
const WAIT_INTERVAL: Duration = Duration::from_millis(100);

/// How a process is asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Ask politely, then kill once the grace period runs out.
    Graceful(Duration),

    /// Kill immediately.
    Forced,
}

/// How a process ended up stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Process exited after termination request.
    Terminated,

    /// Process ignored termination request within grace period, and was
    /// killed.
    Killed,

    /// Process was not running to begin with.
    AlreadyGone,
}

/// Check if a process with the given id is alive.
pub fn is_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        use nix::{errno::Errno, sys::signal::kill, unistd::Pid};

        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };

        // INVARIANT: EPERM means the process exists but belongs to someone else.
        match kill(Pid::from_raw(raw), None) {
            Ok(()) => true,
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    #[cfg(not(unix))]
    {
        use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

        let pid = Pid::from_u32(pid);
        let mut system = System::new();
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::new(),
        );
        system.process(pid).is_some()
    }
}

/// Stop a process.
///
/// A graceful stop waits up to its grace period for the process to exit
/// before killing it.
///
/// # Errors
///
/// - Return [`ProcessError`] if a signal cannot be delivered for reasons
///   other than the process being gone.
#[instrument(level = "debug")]
pub fn terminate(pid: u32, mode: StopMode) -> Result<Termination> {
    if !is_alive(pid) {
        debug!("process {pid} is not running");
        reap(pid);
        return Ok(Termination::AlreadyGone);
    }

    if let StopMode::Graceful(timeout) = mode {
        debug!("send termination request to process {pid}");
        if !signal(pid, Signal::Terminate)? {
            return Ok(Termination::AlreadyGone);
        }

        if wait_for_exit(pid, timeout) {
            return Ok(Termination::Terminated);
        }

        warn!("process {pid} still running after {timeout:?}, killing it");
    }

    debug!("kill process {pid}");
    if !signal(pid, Signal::Kill)? {
        return Ok(Termination::AlreadyGone);
    }

    if !wait_for_exit(pid, Duration::from_secs(1)) {
        warn!("process {pid} still visible after kill");
    }

    Ok(Termination::Killed)
}

/// Wait until process is gone or timeout expires.
///
/// Returns whether the process is gone.
pub fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let start = Instant::now();
    loop {
        reap(pid);
        if !is_alive(pid) {
            return true;
        }

        if start.elapsed() >= timeout {
            return false;
        }

        std::thread::sleep(WAIT_INTERVAL);
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Terminate,
    Kill,
}

/// Deliver signal, returning false if process no longer exists.
fn signal(pid: u32, signal: Signal) -> Result<bool> {
    #[cfg(unix)]
    {
        use nix::{
            errno::Errno,
            sys::signal::{kill, Signal as NixSignal},
            unistd::{getpgid, Pid},
        };

        let raw = i32::try_from(pid).map_err(|_| ProcessError::InvalidPid(pid))?;
        let nix_signal = match signal {
            Signal::Terminate => NixSignal::SIGTERM,
            Signal::Kill => NixSignal::SIGKILL,
        };

        // INVARIANT: A group leader takes its whole group down with it, so
        // servers that fork workers leave none behind.
        let target = match getpgid(Some(Pid::from_raw(raw))) {
            Ok(group) if group.as_raw() == raw => Pid::from_raw(-raw),
            _ => Pid::from_raw(raw),
        };

        match kill(target, nix_signal) {
            Ok(()) => Ok(true),
            Err(Errno::ESRCH) => Ok(false),
            Err(source) => Err(ProcessError::Signal { pid, source }),
        }
    }

    #[cfg(not(unix))]
    {
        use std::process::Command;

        let mut command = Command::new("taskkill");
        command.args(["/PID", &pid.to_string(), "/T"]);
        if let Signal::Kill = signal {
            command.arg("/F");
        }

        let output = command
            .output()
            .map_err(|source| ProcessError::Signal { pid, source })?;
        if output.status.success() {
            return Ok(true);
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("not found") {
            Ok(false)
        } else {
            Err(ProcessError::Signal {
                pid,
                source: std::io::Error::other(stderr.into_owned()),
            })
        }
    }
}

/// Collect exit status of process if it is our child.
///
/// Zombie children still answer liveness checks, so they are reaped before
/// checking. Processes that are not our children are left to their parent.
fn reap(pid: u32) {
    #[cfg(unix)]
    {
        use nix::{
            sys::wait::{waitpid, WaitPidFlag},
            unistd::Pid,
        };

        if let Ok(raw) = i32::try_from(pid) {
            let _ = waitpid(Pid::from_raw(raw), Some(WaitPidFlag::WNOHANG));
        }
    }

    #[cfg(not(unix))]
    let _ = pid;
}

/// Process control error types.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// Process id does not fit the platform's id type.
    #[error("invalid process id {0}")]
    InvalidPid(u32),

    /// Signal could not be delivered.
    #[cfg(unix)]
    #[error("cannot signal process {pid}")]
    Signal {
        pid: u32,
        #[source]
        source: nix::errno::Errno,
    },

    /// Signal could not be delivered.
    #[cfg(not(unix))]
    #[error("cannot signal process {pid}")]
    Signal {
        pid: u32,
        #[source]
        source: std::io::Error,
    },
}

/// Friendly result alias :3
type Result<T, E = ProcessError> = std::result::Result<T, E>;
