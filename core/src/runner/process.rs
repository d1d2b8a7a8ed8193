//! Process runner: launches a command and follows it until it exits

use super::adapters::{ManagedProcess, OutputStream};
use crate::framing::frame_lines;
use crate::process::CommandSpec;
use crate::service::Service;
use crate::Result;
use schema::ServiceExit;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long output readers may lag behind the process exit
const READER_GRACE: Duration = Duration::from_secs(1);

/// Stop signal shared between the runner and the supervising task
#[derive(Debug, Default)]
pub(crate) struct ProcessControl {
    stop: Notify,
}

impl ProcessControl {
    /// Ask the task to kill its process. A stop issued before the task waits
    /// is kept as a permit.
    pub(crate) fn stop(&self) {
        self.stop.notify_one();
    }
}

/// Mark the service as starting and supervise `command` in a task
pub(crate) fn launch(
    svc: &Service,
    command: CommandSpec,
    generation: u64,
    control: Arc<ProcessControl>,
) {
    svc.state_machine().about_to_start(svc);
    tokio::spawn(supervise(svc.clone(), command, generation, control));
}

fn spawn_reader(svc: &Service, stream: OutputStream, is_error: bool) -> JoinHandle<()> {
    let svc = svc.clone();
    tokio::spawn(async move {
        let result = frame_lines(stream, |line| {
            if is_error {
                svc.logger()
                    .handle_error_line(&svc, &line.text, line.replaces_previous);
            } else {
                svc.logger()
                    .handle_out_line(&svc, &line.text, line.replaces_previous);
            }
        })
        .await;
        if let Err(e) = result {
            debug!(service = %svc.name(), "Output stream closed: {}", e);
        }
    })
}

async fn supervise(svc: Service, command: CommandSpec, generation: u64, control: Arc<ProcessControl>) {
    let name = svc.name();
    let adapter = svc.env().adapter.clone();
    let mut process: Box<dyn ManagedProcess> = match adapter.spawn(&command).await {
        Ok(process) => process,
        Err(e) => {
            warn!(service = %name, "Unable to start {}: {}", command, e);
            svc.runner().finish_process(generation, || {
                svc.logger().log_other(&svc, "FAILED TO START");
                svc.logger()
                    .error(&svc, format!("Unable to start {}: {}", command, e));
            });
            return;
        }
    };
    info!(service = %name, pid = process.pid(), "Process started");

    let mut readers = Vec::new();
    if let Some(stdout) = process.take_stdout() {
        readers.push(spawn_reader(&svc, stdout, false));
    }
    if let Some(stderr) = process.take_stderr() {
        readers.push(spawn_reader(&svc, stderr, true));
    }

    let waited = tokio::select! {
        result = process.wait() => Some(result),
        _ = control.stop.notified() => None,
    };
    let result = match waited {
        Some(result) => result,
        None => {
            svc.logger().log_other(&svc, format!("Stopping {name}"));
            if let Err(e) = process.kill().await {
                warn!(service = %name, "Failed to kill process: {}", e);
            }
            process.wait().await
        }
    };

    for mut reader in readers {
        if tokio::time::timeout(READER_GRACE, &mut reader).await.is_err() {
            reader.abort();
        }
    }
    svc.logger().log_other(&svc, "PROCESS FINISHED");

    let reported = svc.runner().finish_process(generation, || report_exit(&svc, result));
    if !reported {
        debug!(service = %name, "Process of a stopped or replaced run ended");
    }
}

/// Map the end of a run that was not stopped to the service state
fn report_exit(svc: &Service, result: Result<ServiceExit>) {
    let name = svc.name();
    let state = svc.state_machine();
    match result {
        Err(e) => {
            svc.logger().log_error(svc, e.to_string());
            state.set_failed(svc);
        }
        Ok(exit) if !exit.success() => {
            let reason = match (exit.exit_code, exit.signal) {
                (Some(code), _) => format!("Exit code: {code}"),
                (None, Some(signal)) => format!("Killed by signal {signal}"),
                (None, None) => "Exit code: unknown".to_string(),
            };
            info!(service = %name, "Process ended: {}", reason);
            svc.logger().log_other(svc, reason);
            state.set_exit_error(svc);
        }
        Ok(_) => {
            info!(service = %name, "Process ended");
            state.stopped(svc);
        }
    }
}
