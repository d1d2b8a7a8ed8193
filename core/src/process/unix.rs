//! Unix process spawning in a dedicated session
//!
//! Every child calls `setsid()` before exec, so it leads a new process group
//! whose id equals its pid. Signals are sent to the whole group, which takes
//! down shell wrappers together with the programs they started.

// setsid() has to run in the pre_exec hook
#![allow(unsafe_code)]

use super::CommandSpec;
use crate::{CoreError, Result};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::process::Stdio;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tracing::{debug, error};

/// A spawned child that leads its own process group
#[derive(Debug)]
pub struct ChildProcess {
    pid: Pid,
    child: Child,
}

impl ChildProcess {
    /// Process id (also the process group id)
    pub fn pid(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    /// Wait for the child to exit
    pub async fn wait(&mut self) -> Result<std::process::ExitStatus> {
        self.child.wait().await.map_err(|e| {
            CoreError::ProcessWait(format!("Failed to wait for process {}: {}", self.pid, e))
        })
    }

    /// Take the piped stdout
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    /// Take the piped stderr
    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }
}

/// Spawn `spec` with piped stdout/stderr in a new session
///
/// ```rust,no_run
/// use devdash_core::process::{unix::spawn, CommandSpec};
///
/// # async fn example() -> devdash_core::Result<()> {
/// let mut child = spawn(&CommandSpec::shell("echo hello"))?;
/// let status = child.wait().await?;
/// assert!(status.success());
/// # Ok(())
/// # }
/// ```
pub fn spawn(spec: &CommandSpec) -> Result<ChildProcess> {
    debug!("Spawning process: {}", spec);

    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .envs(&spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &spec.dir {
        command.current_dir(dir);
    }

    // Safety: setsid() is async-signal-safe and touches no parent state
    unsafe {
        command.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let child = command.spawn().map_err(|e| {
        error!("Failed to spawn '{}': {}", spec, e);
        CoreError::ProcessSpawn(format!("Failed to spawn '{}': {}", spec.program, e))
    })?;
    let raw_pid = child
        .id()
        .ok_or_else(|| CoreError::ProcessSpawn("Spawned child did not have a PID".to_string()))?;

    Ok(ChildProcess {
        pid: Pid::from_raw(raw_pid as i32),
        child,
    })
}

/// Send SIGKILL to the child's process group
///
/// A group that is already gone counts as success.
pub fn kill_group(child: &ChildProcess) -> Result<()> {
    signal_group(child, Signal::SIGKILL)
}

fn signal_group(child: &ChildProcess, signal: Signal) -> Result<()> {
    match killpg(child.pid, signal) {
        Ok(()) => {
            debug!("Sent {} to process group {}", signal, child.pid);
            Ok(())
        }
        Err(nix::errno::Errno::ESRCH) | Err(nix::errno::Errno::EPERM) => {
            debug!("Process group {} already exited", child.pid);
            Ok(())
        }
        Err(e) => Err(CoreError::ProcessSignal(format!(
            "Failed to send {} to process group {}: {}",
            signal, child.pid, e
        ))),
    }
}
