use std::path::Path;

use anyhow::{anyhow, Context, Result};
use tract_onnx::prelude::*;

use super::annotate::{self, PixelRect, DETECTION};
use super::{FrameProcessor, ProcessedFrame};
use crate::frame::{Frame, PixelFormat};

/// ONNX object detector run through tract.
///
/// Input is a `1x3xHxW` float tensor scaled to `0..1`. A `[1, N, K]` output
/// with `K >= 5` is read as YOLO rows (`cx, cy, w, h, objectness, classes..`)
/// and every row above the threshold becomes a boxed detection. Any other
/// output shape counts the scores above the threshold.
pub struct TractProcessor {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    width: u32,
    height: u32,
    confidence_threshold: f32,
}

impl TractProcessor {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P, width: u32, height: u32) -> Result<Self> {
        let model_path = model_path.as_ref();
        let model = tract_onnx::onnx()
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

        Ok(Self {
            model,
            width,
            height,
            confidence_threshold: 0.4,
        })
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    fn build_input(&self, frame: &Frame) -> Result<Tensor> {
        if frame.width() != self.width || frame.height() != self.height {
            return Err(anyhow!(
                "frame size {}x{} does not match model input {}x{}",
                frame.width(),
                frame.height(),
                self.width,
                self.height
            ));
        }
        let (bpp, swap) = match frame.format() {
            PixelFormat::Rgb => (3, false),
            PixelFormat::Bgr => (3, true),
            PixelFormat::Rgba => (4, false),
            PixelFormat::Gray => {
                return Err(anyhow!("tract processor needs color frames, got gray"))
            }
        };

        let pixels = frame.pixels();
        let width = self.width as usize;
        let input = tract_ndarray::Array4::from_shape_fn(
            (1, 3, self.height as usize, width),
            |(_, channel, y, x)| {
                let channel = if swap { 2 - channel } else { channel };
                let idx = (y * width + x) * bpp + channel;
                pixels[idx] as f32 / 255.0
            },
        );

        Ok(input.into_tensor())
    }

    fn detections(&self, outputs: TVec<TValue>) -> Result<(usize, Vec<PixelRect>)> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let scores = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = scores.shape().to_vec();

        if shape.len() == 3 && shape[2] >= 5 {
            let rows = scores
                .into_shape((shape[1], shape[2]))
                .context("reshape detection output")?;
            let mut boxes = Vec::new();
            for row in rows.outer_iter() {
                let class_score = row
                    .iter()
                    .skip(5)
                    .cloned()
                    .fold(None, |best: Option<f32>, v| Some(best.map_or(v, |b| b.max(v))))
                    .unwrap_or(1.0);
                let confidence = row[4] * class_score;
                if !confidence.is_finite() || confidence < self.confidence_threshold {
                    continue;
                }
                if let Some(rect) =
                    PixelRect::from_center(row[0], row[1], row[2], row[3], self.width, self.height)
                {
                    boxes.push(rect);
                }
            }
            return Ok((boxes.len(), boxes));
        }

        let count = scores
            .iter()
            .filter(|v| v.is_finite() && **v >= self.confidence_threshold)
            .count();
        Ok((count, Vec::new()))
    }
}

impl FrameProcessor for TractProcessor {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn process(&mut self, frame: &Frame) -> Result<ProcessedFrame> {
        let input = self.build_input(frame)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        let (count, boxes) = self.detections(outputs)?;

        let frame = if boxes.is_empty() {
            frame.clone()
        } else {
            annotate::draw_boxes(frame, &boxes, 2, DETECTION)
        };
        Ok(ProcessedFrame { frame, count })
    }
}
