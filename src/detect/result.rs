use serde::Serialize;

/// One recognised object.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Detection {
    pub label: String,
    pub confidence: f32,
}

impl Detection {
    pub fn new(label: impl Into<String>, confidence: f32) -> Self {
        Self {
            label: label.into(),
            confidence,
        }
    }
}

/// Result of running detection on a frame.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct DetectionResult {
    pub detections: Vec<Detection>,
}

impl DetectionResult {
    pub fn new(detections: Vec<Detection>) -> Self {
        Self { detections }
    }

    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }

    /// Highest-confidence detection of `label` at or above `min_confidence`.
    pub fn best_match(&self, label: &str, min_confidence: f32) -> Option<&Detection> {
        self.detections
            .iter()
            .filter(|d| d.label.eq_ignore_ascii_case(label) && d.confidence >= min_confidence)
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
    }
}
