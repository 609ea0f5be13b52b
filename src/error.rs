//! Error taxonomy surfaced in per-source status.
//!
//! Internally everything propagates `anyhow::Error`; when an error reaches
//! a status surface it is classified into one of these kinds so operators
//! can tell a dead camera from a failed recording.

use serde::Serialize;
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Device open/read failure. Fatal to that source's loop only.
    Capture,
    /// Detector invocation failure. The frame counts as "no detection".
    /// Kept as the source's `detection_error`.
    Detection,
    /// Notifier failure. Logged, never retried.
    Delivery,
    /// Output could not be opened or written. The session aborts.
    Recording,
    /// Unusable configuration, such as a detector that could not be built
    /// for a source.
    Config,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Capture => "capture",
            ErrorKind::Detection => "detection",
            ErrorKind::Delivery => "delivery",
            ErrorKind::Recording => "recording",
            ErrorKind::Config => "config",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SourceError {
    pub kind: ErrorKind,
    pub message: String,
}

impl SourceError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Classify an `anyhow` chain, keeping every context layer in the message.
    pub fn from_anyhow(kind: ErrorKind, err: &anyhow::Error) -> Self {
        Self::new(kind, format!("{err:#}"))
    }
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error: {}", self.kind, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn from_anyhow_keeps_context_chain() {
        let err = Err::<(), _>(anyhow::anyhow!("device busy"))
            .context("open /dev/video0")
            .unwrap_err();
        let source_err = SourceError::from_anyhow(ErrorKind::Capture, &err);
        assert_eq!(source_err.message, "open /dev/video0: device busy");
        assert_eq!(
            source_err.to_string(),
            "capture error: open /dev/video0: device busy"
        );
    }
}
