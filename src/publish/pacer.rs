use anyhow::Result;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use super::clock::{FrameTiming, PublisherClock};
use crate::frame::{Frame, LatestFrameSlot};

/// A frame stamped for emission.
#[derive(Clone, Debug)]
pub struct TimedFrame {
    pub frame: Frame,
    pub timing: FrameTiming,
}

/// Outbound counters, shared by every sink.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PublisherStats {
    pub frames_emitted: u64,
    /// Ticks with no frame available yet.
    pub ticks_skipped: u64,
    pub push_failures: u64,
    pub frames_pushed: u64,
    pub viewers: usize,
}

/// Couples the latest-frame cell with the synthetic clock.
///
/// Producers call `push_frame` from any thread. The sink calls `on_need_data`
/// whenever it wants a frame; neither call blocks beyond a short lock.
pub struct FramePacer {
    slot: LatestFrameSlot,
    clock: Mutex<PublisherClock>,
    frames_pushed: AtomicU64,
    frames_emitted: AtomicU64,
    ticks_skipped: AtomicU64,
    push_failures: AtomicU64,
    viewers: AtomicUsize,
}

impl FramePacer {
    pub fn new(fps: u32) -> Result<Self> {
        Ok(Self {
            slot: LatestFrameSlot::new(),
            clock: Mutex::new(PublisherClock::new(fps)?),
            frames_pushed: AtomicU64::new(0),
            frames_emitted: AtomicU64::new(0),
            ticks_skipped: AtomicU64::new(0),
            push_failures: AtomicU64::new(0),
            viewers: AtomicUsize::new(0),
        })
    }

    /// Replace the candidate frame for the next tick.
    pub fn push_frame(&self, frame: Frame) {
        self.slot.set(frame);
        self.frames_pushed.fetch_add(1, Ordering::Relaxed);
    }

    /// Take the newest frame and stamp it. `None` skips the tick without
    /// advancing the clock.
    pub fn on_need_data(&self) -> Option<TimedFrame> {
        let Some(frame) = self.slot.latest() else {
            self.ticks_skipped.fetch_add(1, Ordering::Relaxed);
            return None;
        };
        let timing = self
            .clock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .tick();
        self.frames_emitted.fetch_add(1, Ordering::Relaxed);
        Some(TimedFrame { frame, timing })
    }

    pub fn record_push_failure(&self) {
        self.push_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_viewers(&self, viewers: usize) {
        self.viewers.store(viewers, Ordering::Relaxed);
    }

    pub fn frame_duration(&self) -> u64 {
        self.clock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .frame_duration()
    }

    pub fn fps(&self) -> u32 {
        self.clock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .fps()
    }

    pub fn stats(&self) -> PublisherStats {
        PublisherStats {
            frames_emitted: self.frames_emitted.load(Ordering::Relaxed),
            ticks_skipped: self.ticks_skipped.load(Ordering::Relaxed),
            push_failures: self.push_failures.load(Ordering::Relaxed),
            frames_pushed: self.frames_pushed.load(Ordering::Relaxed),
            viewers: self.viewers.load(Ordering::Relaxed),
        }
    }
}
