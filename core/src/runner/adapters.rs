//! Process adapters abstracting how service processes are spawned
//!
//! The process runner only talks to [`ProcessAdapter`] and
//! [`ManagedProcess`], so tests can script process output and exit codes with
//! [`MockProcessAdapter`] instead of spawning real programs.

use crate::process::CommandSpec;
use crate::{CoreError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use schema::{ServiceEvent, ServiceExit};
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;
use tracing::debug;

/// Readable output stream of a child
pub type OutputStream = Pin<Box<dyn AsyncRead + Send + Unpin>>;

/// Spawns processes
#[async_trait]
pub trait ProcessAdapter: Send + Sync {
    /// Launch `command` with piped output
    async fn spawn(&self, command: &CommandSpec) -> Result<Box<dyn ManagedProcess>>;
}

/// A launched process
#[async_trait]
pub trait ManagedProcess: Send {
    /// Process id
    fn pid(&self) -> u32;

    /// Wait for the process to exit
    async fn wait(&mut self) -> Result<ServiceExit>;

    /// Kill the process and everything it started
    async fn kill(&mut self) -> Result<()>;

    /// Take the stdout stream; `None` once taken
    fn take_stdout(&mut self) -> Option<OutputStream>;

    /// Take the stderr stream; `None` once taken
    fn take_stderr(&mut self) -> Option<OutputStream>;
}

fn exit_of(pid: u32, status: std::process::ExitStatus) -> ServiceExit {
    #[cfg(unix)]
    let signal = {
        use std::os::unix::process::ExitStatusExt;
        status.signal()
    };
    #[cfg(not(unix))]
    let signal = None;

    ServiceExit {
        pid,
        exit_code: status.code(),
        signal,
        timestamp: ServiceEvent::current_timestamp(),
    }
}

/// Adapter spawning real processes in their own process group
#[cfg(unix)]
#[derive(Copy, Clone, Debug, Default)]
pub struct UnixProcessAdapter;

#[cfg(unix)]
#[async_trait]
impl ProcessAdapter for UnixProcessAdapter {
    async fn spawn(&self, command: &CommandSpec) -> Result<Box<dyn ManagedProcess>> {
        let child = crate::process::unix::spawn(command)?;
        Ok(Box::new(UnixManagedProcess { child }))
    }
}

#[cfg(unix)]
struct UnixManagedProcess {
    child: crate::process::unix::ChildProcess,
}

#[cfg(unix)]
#[async_trait]
impl ManagedProcess for UnixManagedProcess {
    fn pid(&self) -> u32 {
        self.child.pid()
    }

    async fn wait(&mut self) -> Result<ServiceExit> {
        let status = self.child.wait().await?;
        Ok(exit_of(self.pid(), status))
    }

    async fn kill(&mut self) -> Result<()> {
        crate::process::unix::kill_group(&self.child)
    }

    fn take_stdout(&mut self) -> Option<OutputStream> {
        self.child
            .take_stdout()
            .map(|s| Box::pin(s) as OutputStream)
    }

    fn take_stderr(&mut self) -> Option<OutputStream> {
        self.child
            .take_stderr()
            .map(|s| Box::pin(s) as OutputStream)
    }
}

/// Adapter spawning real processes with plain `tokio::process`
#[cfg(not(unix))]
#[derive(Copy, Clone, Debug, Default)]
pub struct PlainProcessAdapter;

#[cfg(not(unix))]
#[async_trait]
impl ProcessAdapter for PlainProcessAdapter {
    async fn spawn(&self, command: &CommandSpec) -> Result<Box<dyn ManagedProcess>> {
        use std::process::Stdio;

        let mut cmd = tokio::process::Command::new(&command.program);
        cmd.args(&command.args)
            .envs(&command.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &command.dir {
            cmd.current_dir(dir);
        }
        let child = cmd.spawn().map_err(|e| {
            CoreError::ProcessSpawn(format!("Failed to spawn '{}': {}", command.program, e))
        })?;
        Ok(Box::new(PlainManagedProcess { child }))
    }
}

#[cfg(not(unix))]
struct PlainManagedProcess {
    child: tokio::process::Child,
}

#[cfg(not(unix))]
#[async_trait]
impl ManagedProcess for PlainManagedProcess {
    fn pid(&self) -> u32 {
        self.child.id().unwrap_or(0)
    }

    async fn wait(&mut self) -> Result<ServiceExit> {
        let pid = self.pid();
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| CoreError::ProcessWait(format!("Failed to wait for {pid}: {e}")))?;
        Ok(exit_of(pid, status))
    }

    async fn kill(&mut self) -> Result<()> {
        self.child
            .start_kill()
            .map_err(|e| CoreError::ProcessSignal(e.to_string()))
    }

    fn take_stdout(&mut self) -> Option<OutputStream> {
        self.child
            .stdout
            .take()
            .map(|s| Box::pin(s) as OutputStream)
    }

    fn take_stderr(&mut self) -> Option<OutputStream> {
        self.child
            .stderr
            .take()
            .map(|s| Box::pin(s) as OutputStream)
    }
}

/// The adapter for real processes on this platform
pub fn system_adapter() -> Arc<dyn ProcessAdapter> {
    #[cfg(unix)]
    {
        Arc::new(UnixProcessAdapter)
    }
    #[cfg(not(unix))]
    {
        Arc::new(PlainProcessAdapter)
    }
}

/// Scripted behavior of one mock process
#[derive(Debug, Clone)]
pub struct MockInstruction {
    /// Bytes the process writes to stdout
    pub stdout: Vec<u8>,
    /// Bytes the process writes to stderr
    pub stderr: Vec<u8>,
    /// Time until the process exits by itself; `None` runs until killed
    pub exit_after: Option<Duration>,
    /// Exit code of a process that exits by itself
    pub exit_code: i32,
    /// Make the spawn itself fail with this message
    pub spawn_error: Option<String>,
    /// Exit code reported after a kill; `None` reports signal 9
    pub kill_exit_code: Option<i32>,
}

impl Default for MockInstruction {
    fn default() -> Self {
        Self {
            stdout: Vec::new(),
            stderr: Vec::new(),
            exit_after: Some(Duration::ZERO),
            exit_code: 0,
            spawn_error: None,
            kill_exit_code: None,
        }
    }
}

impl MockInstruction {
    /// A process that exits right away with `code`
    pub fn exits(code: i32) -> Self {
        Self {
            exit_code: code,
            ..Default::default()
        }
    }

    /// A process that runs until it is killed
    pub fn runs_forever() -> Self {
        Self {
            exit_after: None,
            ..Default::default()
        }
    }

    /// A process that cannot be launched
    pub fn spawn_failure(message: impl Into<String>) -> Self {
        Self {
            spawn_error: Some(message.into()),
            ..Default::default()
        }
    }

    /// Add stdout lines
    #[must_use]
    pub fn with_stdout(mut self, text: &str) -> Self {
        self.stdout.extend_from_slice(text.as_bytes());
        self
    }

    /// Add stderr lines
    #[must_use]
    pub fn with_stderr(mut self, text: &str) -> Self {
        self.stderr.extend_from_slice(text.as_bytes());
        self
    }

    /// Exit by itself after `delay`
    #[must_use]
    pub fn exit_after(mut self, delay: Duration) -> Self {
        self.exit_after = Some(delay);
        self
    }

    /// Exit with `code` when killed, like a process handling SIGTERM itself
    #[must_use]
    pub fn exits_when_killed(mut self, code: i32) -> Self {
        self.kill_exit_code = Some(code);
        self
    }
}

#[derive(Debug, Default)]
struct MockState {
    queued: VecDeque<MockInstruction>,
    fallback: Option<MockInstruction>,
    spawned: Vec<CommandSpec>,
}

/// Process adapter replaying scripted instructions, for tests
#[derive(Debug, Clone, Default)]
pub struct MockProcessAdapter {
    state: Arc<Mutex<MockState>>,
}

static NEXT_MOCK_PID: AtomicU32 = AtomicU32::new(10_000);

impl MockProcessAdapter {
    /// Adapter whose processes exit right away with code 0
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the behavior of the next spawned process
    pub fn push(&self, instruction: MockInstruction) {
        self.state.lock().queued.push_back(instruction);
    }

    /// Behavior used once the queue is empty
    pub fn set_fallback(&self, instruction: MockInstruction) {
        self.state.lock().fallback = Some(instruction);
    }

    /// Commands spawned so far
    pub fn spawned(&self) -> Vec<CommandSpec> {
        self.state.lock().spawned.clone()
    }
}

#[async_trait]
impl ProcessAdapter for MockProcessAdapter {
    async fn spawn(&self, command: &CommandSpec) -> Result<Box<dyn ManagedProcess>> {
        let instruction = {
            let mut state = self.state.lock();
            state.spawned.push(command.clone());
            state
                .queued
                .pop_front()
                .or_else(|| state.fallback.clone())
                .unwrap_or_default()
        };
        if let Some(message) = instruction.spawn_error {
            return Err(CoreError::ProcessSpawn(message));
        }
        let pid = NEXT_MOCK_PID.fetch_add(1, Ordering::Relaxed);
        debug!("Spawned mock process {} for {}", pid, command);
        Ok(Box::new(MockManagedProcess {
            pid,
            stdout: Some(instruction.stdout),
            stderr: Some(instruction.stderr),
            exit_after: instruction.exit_after,
            exit_code: instruction.exit_code,
            kill_exit_code: instruction.kill_exit_code,
            killed: false,
        }))
    }
}

struct MockManagedProcess {
    pid: u32,
    stdout: Option<Vec<u8>>,
    stderr: Option<Vec<u8>>,
    exit_after: Option<Duration>,
    exit_code: i32,
    kill_exit_code: Option<i32>,
    killed: bool,
}

#[async_trait]
impl ManagedProcess for MockManagedProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    async fn wait(&mut self) -> Result<ServiceExit> {
        let (exit_code, signal) = if self.killed {
            match self.kill_exit_code {
                Some(code) => (Some(code), None),
                None => (None, Some(9)),
            }
        } else {
            match self.exit_after {
                Some(delay) => {
                    tokio::time::sleep(delay).await;
                    (Some(self.exit_code), None)
                }
                None => std::future::pending().await,
            }
        };
        Ok(ServiceExit {
            pid: self.pid,
            exit_code,
            signal,
            timestamp: ServiceEvent::current_timestamp(),
        })
    }

    async fn kill(&mut self) -> Result<()> {
        self.killed = true;
        Ok(())
    }

    fn take_stdout(&mut self) -> Option<OutputStream> {
        self.stdout
            .take()
            .map(|b| Box::pin(std::io::Cursor::new(b)) as OutputStream)
    }

    fn take_stderr(&mut self) -> Option<OutputStream> {
        self.stderr
            .take()
            .map(|b| Box::pin(std::io::Cursor::new(b)) as OutputStream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_mock_replays_output_and_exit_code() {
        let adapter = MockProcessAdapter::new();
        adapter.push(MockInstruction::exits(3).with_stdout("hello\n"));

        let mut process = adapter.spawn(&CommandSpec::shell("anything")).await.unwrap();
        let mut out = String::new();
        process
            .take_stdout()
            .unwrap()
            .read_to_string(&mut out)
            .await
            .unwrap();
        assert_eq!(out, "hello\n");
        assert!(process.take_stdout().is_none());

        let exit = process.wait().await.unwrap();
        assert_eq!(exit.exit_code, Some(3));
        assert_eq!(adapter.spawned()[0].args[1], "anything");
    }

    #[tokio::test]
    async fn test_mock_kill_ends_forever_process() {
        let adapter = MockProcessAdapter::new();
        adapter.push(MockInstruction::runs_forever());
        let mut process = adapter.spawn(&CommandSpec::shell("sleep")).await.unwrap();

        let waited =
            tokio::time::timeout(Duration::from_millis(50), process.wait()).await;
        assert!(waited.is_err(), "process should still run");

        process.kill().await.unwrap();
        let exit = process.wait().await.unwrap();
        assert_eq!(exit.exit_code, None);
        assert_eq!(exit.signal, Some(9));
    }

    #[tokio::test]
    async fn test_mock_spawn_failure_and_fallback() {
        let adapter = MockProcessAdapter::new();
        adapter.push(MockInstruction::spawn_failure("no such file"));
        adapter.set_fallback(MockInstruction::exits(7));

        let err = adapter
            .spawn(&CommandSpec::shell("x"))
            .await
            .err()
            .expect("spawn should fail");
        assert_eq!(err.code(), "CORE009");

        for _ in 0..2 {
            let mut process = adapter.spawn(&CommandSpec::shell("x")).await.unwrap();
            assert_eq!(process.wait().await.unwrap().exit_code, Some(7));
        }
        assert_eq!(adapter.spawned().len(), 3);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unix_adapter_runs_shell() {
        let adapter = system_adapter();
        let mut process = adapter
            .spawn(&CommandSpec::shell("echo out; echo err >&2; exit 4"))
            .await
            .unwrap();
        let mut out = String::new();
        let mut err = String::new();
        process.take_stdout().unwrap().read_to_string(&mut out).await.unwrap();
        process.take_stderr().unwrap().read_to_string(&mut err).await.unwrap();
        assert_eq!(out, "out\n");
        assert_eq!(err, "err\n");
        assert_eq!(process.wait().await.unwrap().exit_code, Some(4));
    }
}
