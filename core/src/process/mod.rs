//! Child process spawning for process-backed services
//!
//! [`CommandSpec`] describes what to run. On Unix, [`unix::spawn`] starts it
//! in its own session so that the whole process tree can be killed at once
//! when the service is stopped.

#[cfg(unix)]
pub mod unix;

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Program, arguments, working directory and extra environment of a child
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    /// Executable name or path
    pub program: String,
    /// Arguments, unquoted
    pub args: Vec<String>,
    /// Working directory; inherited when `None`
    pub dir: Option<PathBuf>,
    /// Environment added to the inherited one
    pub env: BTreeMap<String, String>,
}

impl CommandSpec {
    /// Run `program` with `args`
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            ..Default::default()
        }
    }

    /// Run a command line through the platform shell
    pub fn shell(command_line: &str) -> Self {
        if cfg!(windows) {
            Self::new("cmd", vec!["/C".to_string(), command_line.to_string()])
        } else {
            Self::new("sh", vec!["-c".to_string(), command_line.to_string()])
        }
    }

    /// Set the working directory
    #[must_use]
    pub fn in_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.dir = dir;
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " \"{arg}\"")?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}
