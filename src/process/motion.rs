use anyhow::Result;
use sha2::{Digest, Sha256};

use super::annotate::{self, ALERT};
use super::{FrameProcessor, ProcessedFrame};
use crate::frame::Frame;

const BORDER_THICKNESS: u32 = 4;

/// Frame-difference motion detector.
///
/// Compares a digest of each frame with the previous one. A changed frame
/// counts as one object and gets a red border; an unchanged one passes
/// through without a copy.
#[derive(Default)]
pub struct MotionProcessor {
    last_hash: Option<[u8; 32]>,
}

impl MotionProcessor {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FrameProcessor for MotionProcessor {
    fn name(&self) -> &'static str {
        "motion"
    }

    fn process(&mut self, frame: &Frame) -> Result<ProcessedFrame> {
        let mut hasher = Sha256::new();
        hasher.update(frame.width().to_le_bytes());
        hasher.update(frame.height().to_le_bytes());
        hasher.update(frame.pixels());
        let current_hash: [u8; 32] = hasher.finalize().into();

        let motion = self.last_hash.is_some_and(|prev| prev != current_hash);
        self.last_hash = Some(current_hash);

        if motion {
            Ok(ProcessedFrame {
                frame: annotate::draw_border(frame, BORDER_THICKNESS, ALERT),
                count: 1,
            })
        } else {
            Ok(ProcessedFrame::unchanged(frame.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PixelFormat;

    #[test]
    fn reports_change_between_frames() {
        let mut motion = MotionProcessor::new();
        let still = Frame::solid(16, 16, PixelFormat::Rgb, 10).unwrap();
        let moved = Frame::solid(16, 16, PixelFormat::Rgb, 90).unwrap();

        let r1 = motion.process(&still).unwrap();
        assert_eq!(r1.count, 0);
        assert!(r1.frame.ptr_eq(&still));

        let r2 = motion.process(&moved).unwrap();
        assert_eq!(r2.count, 1);
        assert!(!r2.frame.ptr_eq(&moved));
        assert_eq!(&r2.frame.pixels()[0..3], &[255, 0, 0]);
        // Input is untouched.
        assert!(moved.pixels().iter().all(|b| *b == 90));

        let r3 = motion.process(&moved).unwrap();
        assert_eq!(r3.count, 0);
    }
}
