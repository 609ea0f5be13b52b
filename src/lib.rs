//! watchpost - multi-camera surveillance pipeline
//!
//! This crate watches several live video sources at once, runs a detector on
//! every captured frame and reacts to sightings of a target label with
//! rate-limited side effects: an alert delivered through a notifier and a
//! bounded-length recording written to disk.
//!
//! # Architecture
//!
//! Each configured source gets its own capture thread:
//!
//! ```text
//! FrameSource -> Frame -> FrameCache (latest only) -> Detector -> AlertGate
//!                              |                                   |
//!                              +------> Recorder <---- permitted ---+---> Notifier
//! ```
//!
//! - `ingest`: frame sources (synthetic `stub://`, V4L2, RTSP)
//! - `frame`: immutable frames and the single-writer latest-frame cache
//! - `detect`: detector backends and the per-source factory
//! - `alert`: per-source cooldown gate with atomic check-and-set
//! - `record`: triggered evidence recording on dedicated threads
//! - `notify`: fire-and-forget alert delivery
//! - `supervisor`: lifecycle of all pipelines and status aggregation
//! - `api`: loopback status API for renderers and operators
//!
//! No operation owned by one source blocks another source's thread.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

pub mod alert;
pub mod api;
pub mod config;
pub mod detect;
pub mod error;
pub mod events;
pub mod frame;
pub mod ingest;
pub mod notify;
pub mod operator;
mod pipeline;
pub mod record;
pub mod status;
pub mod supervisor;
pub mod sync;
pub mod ui;

pub use alert::{AlertGate, TriggerDecision};
pub use config::SurveillanceConfig;
pub use detect::{Detection, DetectionResult, DetectorBackend, DetectorFactory};
pub use error::{ErrorKind, SourceError};
pub use events::{TriggerEvent, TriggerFeed};
pub use frame::{Frame, FrameCache};
pub use ingest::{DeviceOpener, FrameRead, FrameSource, SourceOpener, SourceSpec};
pub use notify::{AlertPayload, Notifier, NotifyDispatcher};
pub use operator::{OperatorDirectory, StaticOperator};
pub use record::{Recorder, RecordingSession, RecordingSessions};
pub use status::{SourceState, SourceStatus};
pub use supervisor::SurveillanceSupervisor;
pub use sync::StopSignal;

/// Identifier of one configured camera or stream.
///
/// The identifier is whatever the configuration lists: a device index
/// (`"0"`), a device path, an `rtsp://` URL or a `stub://` synthetic source.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(String);

impl SourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Filesystem-safe rendering of the identifier, used for output names.
    pub fn file_stem(&self) -> String {
        let stem: String = self
            .0
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        let trimmed = stem.trim_matches('_');
        if trimmed.is_empty() {
            "source".to_string()
        } else {
            trimmed.to_string()
        }
    }

    /// `file_stem` plus a short digest of the raw identifier, so ids that
    /// sanitize alike (`cam-1`, `cam_1`) still get distinct output names.
    pub fn unique_stem(&self) -> String {
        let digest = Sha256::digest(self.0.as_bytes());
        format!("{}-{}", self.file_stem(), hex::encode(&digest[..4]))
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SourceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for SourceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_stem_replaces_url_punctuation() {
        let id = SourceId::new("rtsp://192.168.1.20:554/stream1");
        assert_eq!(id.file_stem(), "rtsp___192_168_1_20_554_stream1");
        assert_eq!(SourceId::new("0").file_stem(), "0");
        assert_eq!(SourceId::new("///").file_stem(), "source");
    }

    #[test]
    fn unique_stem_separates_ids_that_sanitize_alike() {
        let dash = SourceId::new("cam-1");
        let underscore = SourceId::new("cam_1");
        assert_eq!(dash.file_stem(), underscore.file_stem());
        assert_ne!(dash.unique_stem(), underscore.unique_stem());
        assert!(dash.unique_stem().starts_with("cam_1-"));
        assert_eq!(dash.unique_stem().len(), "cam_1-".len() + 8);
        assert_eq!(dash.unique_stem(), SourceId::new("cam-1").unique_stem());
    }
}
