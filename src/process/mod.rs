//! Optional per-frame processing between ingest and publish.
//!
//! A processor returns a (possibly annotated) frame and an object count. The
//! input frame is shared with other stages and is never written to;
//! annotation always lands on a copy.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

use crate::frame::Frame;

pub mod annotate;
mod motion;
mod stage;
#[cfg(feature = "backend-tract")]
mod tract;

pub use motion::MotionProcessor;
pub use stage::{ProcessingStage, ProcessingStats};
#[cfg(feature = "backend-tract")]
pub use tract::TractProcessor;

/// Output of one processing step.
#[derive(Clone, Debug)]
pub struct ProcessedFrame {
    pub frame: Frame,
    /// Objects found in the frame.
    pub count: usize,
}

impl ProcessedFrame {
    pub fn unchanged(frame: Frame) -> Self {
        Self { frame, count: 0 }
    }
}

pub trait FrameProcessor: Send {
    /// Processor identifier, used in logs.
    fn name(&self) -> &'static str;

    /// Process one frame. Must not mutate `frame`.
    fn process(&mut self, frame: &Frame) -> Result<ProcessedFrame>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessorKind {
    #[default]
    None,
    Motion,
    Tract,
}

impl FromStr for ProcessorKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "none" | "passthrough" | "" => Ok(ProcessorKind::None),
            "motion" => Ok(ProcessorKind::Motion),
            "tract" | "onnx" => Ok(ProcessorKind::Tract),
            other => Err(anyhow!("unknown processor '{}'", other)),
        }
    }
}

impl std::fmt::Display for ProcessorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessorKind::None => f.write_str("none"),
            ProcessorKind::Motion => f.write_str("motion"),
            ProcessorKind::Tract => f.write_str("tract"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ProcessorConfig {
    pub kind: ProcessorKind,
    pub model_path: PathBuf,
    pub confidence_threshold: f32,
    /// Model input size; frames of any other size are rejected by `tract`.
    pub input_width: u32,
    pub input_height: u32,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            kind: ProcessorKind::None,
            model_path: PathBuf::from("model.onnx"),
            confidence_threshold: 0.4,
            input_width: 640,
            input_height: 480,
        }
    }
}

/// Build the configured processor. `None` means frames bypass processing.
pub fn build_processor(config: &ProcessorConfig) -> Result<Option<Box<dyn FrameProcessor>>> {
    let processor: Box<dyn FrameProcessor> = match config.kind {
        ProcessorKind::None => return Ok(None),
        ProcessorKind::Motion => Box::new(MotionProcessor::new()),
        #[cfg(feature = "backend-tract")]
        ProcessorKind::Tract => Box::new(
            TractProcessor::new(&config.model_path, config.input_width, config.input_height)?
                .with_threshold(config.confidence_threshold),
        ),
        #[cfg(not(feature = "backend-tract"))]
        ProcessorKind::Tract => {
            return Err(anyhow!(
                "tract processor requires the backend-tract feature (model {})",
                config.model_path.display()
            ))
        }
    };
    log::info!("frame processor '{}' ready", processor.name());
    Ok(Some(processor))
}
