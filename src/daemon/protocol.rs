//! Wire-level types for the prediction engine's line protocol.
//!
//! Requests are arbitrary bytes terminated by `\n`. Each request yields
//! exactly one response line of the form `<value> [tag]`.

use crate::error::{DaemonError, Result};
use serde::Serialize;
use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

pub const END_OF_LINE: u8 = b'\n';

/// Append the line terminator unless the request already ends with one.
pub fn terminate_line(request: &[u8]) -> Result<Cow<'_, [u8]>> {
    match request.last() {
        None => Err(DaemonError::EmptyRequest),
        Some(&END_OF_LINE) => Ok(Cow::Borrowed(request)),
        Some(_) => {
            let mut owned = Vec::with_capacity(request.len() + 1);
            owned.extend_from_slice(request);
            owned.push(END_OF_LINE);
            Ok(Cow::Owned(owned))
        }
    }
}

/// Result of one prediction: the engine's scalar and the echoed example tag.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    pub value: f64,
    pub tag: String,
}

impl FromStr for Prediction {
    type Err = DaemonError;

    fn from_str(line: &str) -> Result<Self> {
        let malformed = |reason: &str| DaemonError::MalformedResponse {
            line: line.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = line.trim_end_matches(['\n', '\r']).trim();
        let (raw_value, tag) = match trimmed.split_once(char::is_whitespace) {
            Some((value, tag)) => (value, tag.trim()),
            None => (trimmed, ""),
        };

        if raw_value.is_empty() {
            return Err(malformed("empty response line"));
        }

        let value = raw_value
            .parse::<f64>()
            .map_err(|e| malformed(&format!("value {raw_value:?} is not a number: {e}")))?;

        Ok(Self {
            value,
            tag: tag.to_string(),
        })
    }
}

impl fmt::Display for Prediction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.tag.is_empty() {
            write!(f, "{}", self.value)
        } else {
            write!(f, "{} {}", self.value, self.tag)
        }
    }
}

/// Lifecycle of the instance currently bound to a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DaemonState {
    /// Constructed, process not launched
    Stopped,
    /// Process verified and pool filled
    Running,
    /// A hot reload is building the replacement instance
    Swapping,
}

impl DaemonState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DaemonState::Stopped => "stopped",
            DaemonState::Running => "running",
            DaemonState::Swapping => "swapping",
        }
    }
}
