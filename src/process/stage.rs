use std::panic::{self, AssertUnwindSafe};

use super::{FrameProcessor, ProcessedFrame};
use crate::error::RelayError;
use crate::frame::Frame;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProcessingStats {
    pub frames: u64,
    pub failures: u64,
    pub objects: u64,
}

/// Runs an optional processor with failure isolation.
///
/// Whatever the processor does (error or panic), the caller always gets a
/// frame back: on failure it is the original, with a count of zero.
pub struct ProcessingStage {
    processor: Option<Box<dyn FrameProcessor>>,
    stats: ProcessingStats,
}

impl ProcessingStage {
    pub fn new(processor: Option<Box<dyn FrameProcessor>>) -> Self {
        Self {
            processor,
            stats: ProcessingStats::default(),
        }
    }

    pub fn processor_name(&self) -> &'static str {
        self.processor.as_ref().map_or("none", |p| p.name())
    }

    pub fn run(&mut self, frame: Frame) -> ProcessedFrame {
        self.stats.frames += 1;
        let Some(processor) = self.processor.as_mut() else {
            return ProcessedFrame::unchanged(frame);
        };
        let name = processor.name();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| processor.process(&frame)));
        let reason = match outcome {
            Ok(Ok(processed)) => {
                self.stats.objects += processed.count as u64;
                return processed;
            }
            Ok(Err(err)) => format!("{:#}", err),
            Err(payload) => format!("panicked: {}", panic_message(payload.as_ref())),
        };
        self.stats.failures += 1;
        log::warn!(
            "{}; forwarding frame unprocessed",
            RelayError::Processing {
                processor: name.to_string(),
                reason,
            }
        );
        ProcessedFrame::unchanged(frame)
    }

    pub fn stats(&self) -> ProcessingStats {
        self.stats
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
