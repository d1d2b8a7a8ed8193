//! External runner: polls a URL or port service that runs outside devdash
//!
//! The service is reported up or down on every poll. A down service whose
//! group leader has a restart command gets restarted once per incident;
//! further failures while the restart is in flight are part of the same
//! incident until the service comes back up.

use super::PollerControl;
use crate::health::{create_probe, Probe, PROBE_TIMEOUT};
use crate::process::CommandSpec;
use crate::service::Service;
use crate::utilities::parse_poll_interval;
use schema::ServiceState;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Explain that the service is only observed
pub(crate) fn add_initial_external_message(svc: &Service) {
    let logger = svc.logger();
    logger.log_other(
        svc,
        "This service is not running in the dashboard so can not be controlled by it. Running state display only.",
    );
    if svc.spec().restart_cmd.is_some() {
        logger.log_other(svc, "Watchdog mode: service will be restarted when down.");
    }
}

/// Put the service in WAITING and start polling it
pub(crate) fn launch(svc: &Service, control: Arc<PollerControl>) {
    add_initial_external_message(svc);
    svc.state_machine().reset(svc);
    svc.state_machine().set_waiting(svc);
    tokio::spawn(poll_loop(svc.clone(), control));
}

fn initialize(svc: &Service) -> Option<Box<dyn Probe + Send + Sync>> {
    let location = svc.spec().location_text().unwrap_or_default().to_string();
    match create_probe(svc.location_type(), &location, PROBE_TIMEOUT) {
        Ok(probe) => {
            svc.logger()
                .log_other(svc, format!("Checking location: {}", probe.target()));
            if svc.current_state().is_error() {
                svc.state_machine().set_waiting(svc);
            }
            Some(probe)
        }
        Err(e) => {
            warn!(service = %svc.name(), "Unable to check location: {}", e);
            let logger = svc.logger();
            logger.log_error(
                svc,
                format!("Unable to check: location configuration not supported: {location}"),
            );
            logger.log_error(
                svc,
                "Supported locations are URLs (http[s]://...) and PORTs ([host:]port)",
            );
            svc.state_machine().set_error(svc);
            None
        }
    }
}

async fn poll_loop(svc: Service, control: Arc<PollerControl>) {
    let mut probe = None;
    let mut restarting = false;
    while control.is_running() {
        if control.take_reconfigure() || probe.is_none() {
            probe = initialize(&svc);
        }
        if let Some(p) = &probe {
            let result = p.check().await;
            if !control.is_running() {
                break;
            }
            if let Err(e) = &result {
                debug!(service = %svc.name(), "Probe {} failed: {}", p.target(), e);
            }
            handle_down_state(&svc, result.is_err(), &mut restarting);
        }
        let pause = Duration::from_millis(parse_poll_interval(svc.spec().poll_interval.as_deref()));
        control.pause(pause).await;
    }
    debug!(service = %svc.name(), "External poller stopped");
}

/// Apply one probe result to the service state
pub(crate) fn handle_down_state(svc: &Service, is_down: bool, restarting: &mut bool) {
    let state = svc.state_machine();
    let logger = svc.logger();

    if state.get() == ServiceState::Waiting && !is_down {
        logger.log_other(svc, "Service is up.");
        state.set_running_immediately(svc);
    }
    if is_down == state.get().is_error() && !*restarting {
        return;
    }
    if is_down && *restarting {
        // output may have cleared the error, but the service is still down
        state.set_error(svc);
    } else if is_down {
        logger.log_other(svc, "Service is down.");
        state.set_error(svc);
        if svc.is_group_lead() {
            if let Some(cmd) = svc.spec().restart_cmd.clone() {
                restart(svc, &cmd);
                *restarting = true;
            }
        }
    } else {
        if *restarting {
            logger.log_other(svc, "Stopped waiting for restart.");
            *restarting = false;
        }
        logger.log_other(svc, "Service is up.");
        state.set_running_immediately(svc);
    }
}

fn restart(svc: &Service, cmd: &str) {
    let spec = svc.spec();
    let target = match &spec.group {
        Some(group) => format!("group: {group}"),
        None => format!(": {}", spec.name),
    };
    info!(service = %spec.name, "Restarting {} with {}", target, cmd);
    svc.logger().log_other(
        svc,
        format!("Attempting restart of service {target} -- {cmd}"),
    );

    let dir = spec
        .restart_dir
        .as_deref()
        .or(spec.dir.as_deref())
        .map(|d| svc.resolve_path(d))
        .unwrap_or_else(|| svc.root());
    let command = CommandSpec::shell(cmd).in_dir(Some(dir));
    let svc = svc.clone();
    tokio::spawn(async move {
        let adapter = svc.env().adapter.clone();
        match adapter.spawn(&command).await {
            Ok(mut process) => {
                // restart output is informational; the probe decides the state
                let mut readers = Vec::new();
                for stream in [process.take_stdout(), process.take_stderr()].into_iter().flatten() {
                    let svc = svc.clone();
                    readers.push(tokio::spawn(async move {
                        let _ = crate::framing::frame_lines(stream, |line| {
                            if !line.replaces_previous {
                                svc.logger().log_other(&svc, line.text);
                            }
                        })
                        .await;
                    }));
                }
                if let Err(e) = process.wait().await {
                    warn!(service = %svc.name(), "Restart command failed: {}", e);
                }
                for reader in readers {
                    let _ = reader.await;
                }
                svc.logger()
                    .log_other(&svc, "Now waiting for service to come back up.");
            }
            Err(e) => {
                warn!(service = %svc.name(), "Restart command failed: {}", e);
                svc.logger()
                    .log_other(&svc, format!("[ERROR] Restart failed: {e}"));
            }
        }
    });
}
