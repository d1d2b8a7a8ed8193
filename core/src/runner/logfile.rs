//! Log runner: follows a log file written by a service outside devdash
//!
//! New content is read every second. A file that shrinks was rotated or
//! truncated, in which case the buffer is cleared and the file is read
//! again from the start.

use super::external::add_initial_external_message;
use super::PollerControl;
use crate::service::Service;
use regex::Regex;
use schema::LocationType;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(1_000);

/// Most bytes read in one poll; older content is skipped
pub const MAX_BLOCK: u64 = 100 * 1024;

static LINE_BREAK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\r\n|\r|\n").expect("line break pattern"));

/// Start following the service's log file
pub(crate) fn launch(svc: &Service, path: PathBuf, control: Arc<PollerControl>) {
    let is_log_service = svc.location_type() == LocationType::Log;
    if is_log_service {
        svc.state_machine().reset(svc);
        svc.state_machine().set_waiting(svc);
    }
    svc.logger()
        .log_other(svc, format!("Reading log file: {}", path.display()));
    if is_log_service {
        if path.exists() {
            svc.logger().log_other(svc, "Service is up.");
            svc.state_machine().set_running(svc);
        } else {
            svc.logger().log_error(svc, "Service is down.");
            svc.state_machine().set_error(svc);
        }
    }
    tokio::spawn(poll_loop(svc.clone(), path, control));
}

async fn poll_loop(svc: Service, mut path: PathBuf, control: Arc<PollerControl>) {
    let mut tail = LogTail::default();
    while control.is_running() {
        if control.take_reconfigure() {
            if let Some(new_path) = svc.log_file_path() {
                if new_path != path {
                    debug!(service = %svc.name(), "Log file moved to {}", new_path.display());
                    path = new_path;
                    tail = LogTail::default();
                }
            }
        }
        tail.poll(&path, |event| match event {
            TailEvent::Restart => {
                svc.logger().clear(&svc);
                add_initial_external_message(&svc);
                svc.logger()
                    .log_other(&svc, format!("Reading log file: {}", path.display()));
            }
            TailEvent::Line(line) => svc.logger().handle_out_line(&svc, line, false),
            TailEvent::ReadError(e) => {
                warn!(service = %svc.name(), "Failure to read log file: {}", e);
                svc.logger()
                    .handle_error_line(&svc, &format!("Failure to read log file: {e}"), false);
            }
        });
        control.pause(POLL_INTERVAL).await;
    }
    debug!(service = %svc.name(), "Log poller stopped");
}

/// Something the tail found in one poll
#[derive(Debug, PartialEq, Eq)]
pub enum TailEvent<'a> {
    /// The file is read from the start again
    Restart,
    /// A complete line
    Line(&'a str),
    /// The file could not be read
    ReadError(String),
}

/// Incremental reader of a growing file
#[derive(Debug, Default)]
pub struct LogTail {
    previous_len: Option<u64>,
}

impl LogTail {
    /// Length consumed so far, `None` before the first read
    pub fn position(&self) -> Option<u64> {
        self.previous_len
    }

    /// Read what was appended since the last poll.
    ///
    /// Only complete lines are reported; a trailing partial line is read
    /// again on the next poll.
    pub fn poll(&mut self, path: &Path, mut on_event: impl FnMut(TailEvent<'_>)) {
        let len = match std::fs::metadata(path) {
            Ok(meta) => meta.len(),
            Err(_) => return,
        };
        if self.previous_len == Some(len) {
            return;
        }
        let from = match self.previous_len {
            Some(prev) if len > prev => prev,
            _ => {
                on_event(TailEvent::Restart);
                0
            }
        };
        match read_lines(path, from, len, &mut on_event) {
            Ok(consumed) => self.previous_len = Some(consumed),
            Err(e) => on_event(TailEvent::ReadError(e.to_string())),
        }
    }
}

/// Report complete lines in `from..len`; returns the offset after the last one
fn read_lines(
    path: &Path,
    from: u64,
    len: u64,
    on_event: &mut impl FnMut(TailEvent<'_>),
) -> std::io::Result<u64> {
    let start = from.max(len.saturating_sub(MAX_BLOCK));
    let mut file = std::fs::File::open(path)?;
    file.seek(SeekFrom::Start(start))?;
    let mut bytes = Vec::with_capacity((len - start) as usize);
    file.take(len - start).read_to_end(&mut bytes)?;

    // a trailing \r may be the first half of a \r\n that is still being
    // written, so that line is read again on the next poll
    let complete = match bytes.last() {
        Some(b'\r') => &bytes[..bytes.len() - 1],
        _ => &bytes[..],
    };
    let Some(last_break) = complete.iter().rposition(|b| *b == b'\n' || *b == b'\r') else {
        return Ok(start);
    };
    let text = String::from_utf8_lossy(&bytes[..=last_break]);
    let mut pieces: Vec<&str> = LINE_BREAK.split(&text).collect();
    // text ends with a break, so the last piece is empty
    pieces.pop();
    for line in pieces {
        on_event(TailEvent::Line(line));
    }
    Ok(start + last_break as u64 + 1)
}
