//! Log line types shared between the engine and its consumers

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Classification of a log line
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LineType {
    /// Dependency-wait notice; never affects state
    Waiting,
    /// Regular output
    Out,
    /// Error output
    Error,
    /// Error raised by devdash itself before the service came up
    InitError,
    /// Informational notice from devdash; never affects state
    Other,
}

impl LineType {
    /// Whether lines of this type are fed to the state machine
    pub fn affects_state(&self) -> bool {
        !matches!(self, LineType::Other | LineType::Waiting)
    }
}

/// A single classified log line
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LineInfo {
    /// Process-wide monotonic line index
    pub index: u64,
    /// Epoch millis when the line was received
    pub time: u64,
    /// Line classification
    #[serde(rename = "type")]
    pub line_type: LineType,
    /// Line text, after redaction
    pub text: String,
    /// Whether this line overwrites the previously emitted one
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub replaces: bool,
}
