#![cfg(feature = "backend-tract")]

use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use image::imageops::FilterType;
use image::RgbImage;
use tract_onnx::prelude::*;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{Detection, DetectionResult};
use crate::frame::Frame;

/// Anchors scoring below this never leave the backend.
const SCORE_FLOOR: f32 = 0.25;

pub type SharedPlan = Arc<TypedRunnableModel<TypedModel>>;

/// Load a YOLOv8-style ONNX detector (`[1, 3, H, W]` in, `[1, 4 + classes, anchors]` out).
///
/// The plan is immutable once built and `run` takes `&self`, so one loaded
/// model is shared by every source's backend without a lock.
pub fn load_plan<P: AsRef<Path>>(model_path: P, width: u32, height: u32) -> Result<SharedPlan> {
    let model_path = model_path.as_ref();
    let plan = tract_onnx::onnx()
        .model_for_path(model_path)
        .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
        .with_input_fact(
            0,
            InferenceFact::dt_shape(
                f32::datum_type(),
                tvec!(1, 3, height as usize, width as usize),
            ),
        )
        .context("failed to set input fact")?
        .into_optimized()
        .context("failed to optimize ONNX model")?
        .into_runnable()
        .context("failed to build runnable ONNX model")?;
    Ok(Arc::new(plan))
}

/// Tract-based backend running a shared YOLO plan.
pub struct TractBackend {
    plan: SharedPlan,
    width: u32,
    height: u32,
    labels: Arc<Vec<String>>,
}

impl TractBackend {
    pub fn new(plan: SharedPlan, width: u32, height: u32, labels: Arc<Vec<String>>) -> Self {
        Self {
            plan,
            width,
            height,
            labels,
        }
    }

    fn build_input(&self, frame: &Frame) -> Result<Tensor> {
        let image = RgbImage::from_raw(frame.width, frame.height, frame.pixels().to_vec())
            .ok_or_else(|| anyhow!("frame buffer does not match its dimensions"))?;
        let resized = if frame.width == self.width && frame.height == self.height {
            image
        } else {
            image::imageops::resize(&image, self.width, self.height, FilterType::Triangle)
        };

        let width = self.width as usize;
        let raw = resized.as_raw();
        let input = tract_ndarray::Array4::from_shape_fn(
            (1, 3, self.height as usize, width),
            |(_, channel, y, x)| raw[(y * width + x) * 3 + channel] as f32 / 255.0,
        );
        Ok(input.into_tensor())
    }

    fn label_for(&self, class_id: usize) -> String {
        self.labels
            .get(class_id)
            .cloned()
            .unwrap_or_else(|| format!("class_{class_id}"))
    }

    fn decode(&self, outputs: TVec<TValue>) -> Result<DetectionResult> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let preds = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = preds.shape();
        if shape.len() != 3 || shape[1] <= 4 {
            return Err(anyhow!("unexpected detector output shape {:?}", shape));
        }
        let classes = shape[1] - 4;
        let anchors = shape[2];

        // Keep the best score per class; the pipeline only asks "is there a
        // confident <label> in this frame", so boxes and NMS are not needed.
        let mut best = vec![0.0f32; classes];
        for anchor in 0..anchors {
            for (class_id, slot) in best.iter_mut().enumerate() {
                let score = preds[&[0, 4 + class_id, anchor][..]];
                if score > *slot {
                    *slot = score;
                }
            }
        }

        let detections = best
            .into_iter()
            .enumerate()
            .filter(|(_, score)| score.is_finite() && *score >= SCORE_FLOOR)
            .map(|(class_id, score)| Detection::new(self.label_for(class_id), score))
            .collect();
        Ok(DetectionResult::new(detections))
    }
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect(&mut self, frame: &Frame) -> Result<DetectionResult> {
        let input = self.build_input(frame)?;
        let outputs = self
            .plan
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        self.decode(outputs)
    }
}
