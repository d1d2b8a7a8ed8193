//! Per-service line buffer with classification and redaction
//!
//! Raw lines from runners are redacted with the service's `logDeletes`,
//! classified (stack traces and `[ERROR]` lines count as errors even on
//! stdout), stored in a bounded buffer, fed to the state machine and
//! broadcast as [`ServiceEvent::LogLine`].

use super::Service;
use crate::logging::{next_line_index, LineBuffer, MAX_OUTPUT_LINE_COUNT};
use lru::LruCache;
use parking_lot::Mutex;
use regex::Regex;
use schema::{LineInfo, LineType, ServiceEvent};
use std::num::NonZeroUsize;
use std::sync::LazyLock;
use tracing::{debug, error, warn};

const DELETE_CACHE_SIZE: usize = 100;

static ERROR_LINE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"^(\w+\.)+\w+Exception: .*$",
        r"^\tat \w+\..*$",
        r"^(Caused|Wrapped) by: (\w+\.){2,}.*$",
        r"^\t\.\.\. \d+ more$",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("error line pattern"))
    .collect()
});

// Compiled log-delete patterns shared by all services. Invalid patterns are
// cached as `None` so they are reported only once.
static DELETE_PATTERNS: LazyLock<Mutex<LruCache<String, Option<Regex>>>> = LazyLock::new(|| {
    Mutex::new(LruCache::new(
        NonZeroUsize::new(DELETE_CACHE_SIZE).expect("nonzero cache size"),
    ))
});

/// Whether an output line looks like error output
pub fn is_error_line(line: &str) -> bool {
    line.starts_with("[ERROR]") || ERROR_LINE_PATTERNS.iter().any(|p| p.is_match(line))
}

/// Remove every match of every pattern from `line`
pub fn apply_log_deletes(line: &str, deletes: &[String]) -> String {
    if deletes.is_empty() {
        return line.to_string();
    }
    let mut cache = DELETE_PATTERNS.lock();
    let mut text = line.to_string();
    for pattern in deletes {
        let regex = cache.get_or_insert(pattern.clone(), || match Regex::new(pattern) {
            Ok(regex) => Some(regex),
            Err(e) => {
                warn!("Ignoring invalid log delete pattern {:?}: {}", pattern, e);
                None
            }
        });
        if let Some(regex) = regex {
            text = regex.replace_all(&text, "").into_owned();
        }
    }
    text
}

/// Buffered, classified output of one service
#[derive(Debug)]
pub struct ServiceLogger {
    buffer: Mutex<LineBuffer>,
}

impl Default for ServiceLogger {
    fn default() -> Self {
        Self::new(MAX_OUTPUT_LINE_COUNT)
    }
}

impl ServiceLogger {
    /// Create a logger keeping at most `capacity` lines
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: Mutex::new(LineBuffer::new(capacity)),
        }
    }

    /// Copy of the buffered lines, oldest first
    pub fn lines(&self) -> Vec<LineInfo> {
        self.buffer.lock().snapshot()
    }

    /// Buffered lines with an index greater than `after_index`
    pub fn lines_after(&self, after_index: u64) -> Vec<LineInfo> {
        self.buffer.lock().iter_after(after_index)
    }

    /// Number of buffered lines
    pub fn len(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Whether the buffer is empty
    pub fn is_empty(&self) -> bool {
        self.buffer.lock().is_empty()
    }

    /// Empty the buffer and tell subscribers
    pub fn clear(&self, svc: &Service) {
        self.buffer.lock().clear();
        svc.emit(ServiceEvent::LogCleared {
            service: svc.name(),
        });
    }

    fn add_line(&self, svc: &Service, line_type: LineType, text: String, replaces: bool) {
        let line = LineInfo {
            index: next_line_index(),
            time: svc.now(),
            line_type,
            text,
            replaces,
        };
        if !replaces {
            self.buffer.lock().push(line.clone());
        }

        let state = svc.state_machine();
        match line_type {
            LineType::Error => {
                debug!(service = %svc.name(), "error line: {}", line.text);
                state.handle_line(svc, true, &line.text, replaces);
            }
            LineType::Out => state.handle_line(svc, false, &line.text, replaces),
            // reported together with the state change that follows it
            LineType::InitError => state.record_line(svc, false, &line.text, replaces),
            LineType::Other | LineType::Waiting => {}
        }

        svc.emit(ServiceEvent::LogLine {
            service: svc.name(),
            line,
        });
    }

    /// Handle a line from the service's regular output
    pub fn handle_out_line(&self, svc: &Service, line: &str, replaces: bool) {
        let text = apply_log_deletes(line, &svc.spec().log_deletes);
        let line_type = if is_error_line(&text) {
            LineType::Error
        } else {
            LineType::Out
        };
        self.add_line(svc, line_type, text, replaces);
    }

    /// Handle a line from the service's error output
    pub fn handle_error_line(&self, svc: &Service, line: &str, replaces: bool) {
        if svc.spec().err_to_out {
            return self.handle_out_line(svc, line, replaces);
        }
        let text = apply_log_deletes(line, &svc.spec().log_deletes);
        self.add_line(svc, LineType::Error, text, replaces);
    }

    /// Log an error line produced by devdash on behalf of the service
    pub fn log_error(&self, svc: &Service, text: impl Into<String>) {
        self.add_line(svc, LineType::Error, text.into(), false);
    }

    /// Log a devdash notice that does not affect the state
    pub fn log_other(&self, svc: &Service, text: impl Into<String>) {
        self.add_line(svc, LineType::Other, text.into(), false);
    }

    /// Log a dependency-wait notice
    pub fn log_waiting(&self, svc: &Service, text: impl Into<String>) {
        self.add_line(svc, LineType::Waiting, text.into(), false);
    }

    /// Log a launch failure and put the service in INIT_ERROR
    pub fn error(&self, svc: &Service, text: impl Into<String>) {
        let text = text.into();
        error!(service = %svc.name(), "{}", text);
        self.add_line(svc, LineType::InitError, text, false);
        svc.state_machine().set_init_failed(svc);
    }
}
