//! Frames and the two hand-off structures between pipeline threads.
//!
//! - `Frame`: immutable image buffer. Pixel bytes live in an `Arc<[u8]>`, so a
//!   frame moved to another thread can never be written by the sender.
//! - `FrameBuffer`: bounded FIFO that sheds the oldest frame when full.
//! - `LatestFrameSlot`: single-slot, most-recent-wins cell read by the publisher.
//!
//! Neither structure holds its lock across I/O; locks cover a single push,
//! pop or swap.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// Channel layout of a frame's pixel bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Rgb,
    Bgr,
    Rgba,
    Gray,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgb | PixelFormat::Bgr => 3,
            PixelFormat::Rgba => 4,
            PixelFormat::Gray => 1,
        }
    }

    /// GStreamer raw video format name (`video/x-raw,format=...`).
    pub fn caps_name(self) -> &'static str {
        match self {
            PixelFormat::Rgb => "RGB",
            PixelFormat::Bgr => "BGR",
            PixelFormat::Rgba => "RGBA",
            PixelFormat::Gray => "GRAY8",
        }
    }

    /// Single-byte code used in the raw frame stream header.
    pub fn wire_code(self) -> u8 {
        match self {
            PixelFormat::Rgb => 1,
            PixelFormat::Bgr => 2,
            PixelFormat::Rgba => 3,
            PixelFormat::Gray => 4,
        }
    }

    pub fn from_wire_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(PixelFormat::Rgb),
            2 => Some(PixelFormat::Bgr),
            3 => Some(PixelFormat::Rgba),
            4 => Some(PixelFormat::Gray),
            _ => None,
        }
    }
}

impl FromStr for PixelFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rgb" => Ok(PixelFormat::Rgb),
            "bgr" => Ok(PixelFormat::Bgr),
            "rgba" => Ok(PixelFormat::Rgba),
            "gray" | "gray8" => Ok(PixelFormat::Gray),
            other => Err(anyhow!("unknown pixel format '{}'", other)),
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.caps_name())
    }
}

/// A decoded video frame. Carries no timestamp; the publisher assigns timing.
///
/// Cloning is cheap and shares the pixel buffer. There is no API that writes
/// into an existing frame: annotation goes through [`Frame::map_pixels`],
/// which produces a new one.
#[derive(Clone)]
pub struct Frame {
    data: Arc<[u8]>,
    width: u32,
    height: u32,
    format: PixelFormat,
}

impl Frame {
    /// Wrap decoded pixels. The byte length must match the dimensions.
    pub fn new(data: Vec<u8>, width: u32, height: u32, format: PixelFormat) -> Result<Self> {
        let expected = expected_len(width, height, format)?;
        if data.len() != expected {
            return Err(anyhow!(
                "frame {}x{} {} needs {} bytes, got {}",
                width,
                height,
                format,
                expected,
                data.len()
            ));
        }
        Ok(Self {
            data: data.into(),
            width,
            height,
            format,
        })
    }

    /// A frame with every byte set to `value`.
    pub fn solid(width: u32, height: u32, format: PixelFormat, value: u8) -> Result<Self> {
        let len = expected_len(width, height, format)?;
        Self::new(vec![value; len], width, height, format)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    /// True when both frames share the same pixel buffer.
    pub fn ptr_eq(&self, other: &Frame) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    /// Copy the pixels, let `f` edit the copy, and return it as a new frame.
    /// `self` is left untouched.
    pub fn map_pixels<F>(&self, f: F) -> Frame
    where
        F: FnOnce(&mut [u8], u32, u32, PixelFormat),
    {
        let mut copy = self.data.to_vec();
        f(&mut copy, self.width, self.height, self.format);
        Frame {
            data: copy.into(),
            width: self.width,
            height: self.height,
            format: self.format,
        }
    }
}

// Pixel content is never written to logs.
impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("bytes", &self.data.len())
            .finish()
    }
}

fn expected_len(width: u32, height: u32, format: PixelFormat) -> Result<usize> {
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|v| v.checked_mul(format.bytes_per_pixel()))
        .ok_or_else(|| anyhow!("frame dimensions overflow"))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // Frames are plain data; a panic while holding the lock cannot leave the
    // queue half-updated, so a poisoned lock is still usable.
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ----------------------------------------------------------------------------
// FrameBuffer: bounded, drop-oldest hand-off queue
// ----------------------------------------------------------------------------

/// Bounded FIFO between a producer and consumers running on other threads.
///
/// `put` never blocks: when the queue is full the oldest frame is shed. A live
/// source makes stale frames worthless, so the consumer always sees the most
/// recent `capacity` frames in arrival order.
pub struct FrameBuffer {
    state: Mutex<BufferState>,
    ready: Condvar,
    capacity: usize,
}

struct BufferState {
    frames: VecDeque<Frame>,
    stopped: bool,
    dropped: u64,
}

impl FrameBuffer {
    /// Capacity is clamped to at least one frame.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(BufferState {
                frames: VecDeque::with_capacity(capacity),
                stopped: false,
                dropped: 0,
            }),
            ready: Condvar::new(),
            capacity,
        }
    }

    /// Enqueue a frame, shedding the oldest one if full.
    ///
    /// Returns how many frames were dropped to make room (0 or 1). After
    /// `stop()` the frame is discarded and 0 is returned.
    pub fn put(&self, frame: Frame) -> usize {
        let mut state = lock(&self.state);
        if state.stopped {
            return 0;
        }
        let mut shed = 0;
        while state.frames.len() >= self.capacity {
            state.frames.pop_front();
            state.dropped += 1;
            shed += 1;
        }
        state.frames.push_back(frame);
        drop(state);
        self.ready.notify_one();
        shed
    }

    /// Block until a frame is available. `None` means the buffer was stopped
    /// and everything queued before the stop has been handed out.
    pub fn get(&self) -> Option<Frame> {
        let mut state = lock(&self.state);
        loop {
            if let Some(frame) = state.frames.pop_front() {
                return Some(frame);
            }
            if state.stopped {
                return None;
            }
            state = self
                .ready
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Like `get`, but gives up after `timeout`.
    pub fn get_timeout(&self, timeout: Duration) -> Option<Frame> {
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.state);
        loop {
            if let Some(frame) = state.frames.pop_front() {
                return Some(frame);
            }
            if state.stopped {
                return None;
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (next, _) = self
                .ready
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = next;
        }
    }

    /// Non-blocking pop.
    pub fn try_get(&self) -> Option<Frame> {
        lock(&self.state).frames.pop_front()
    }

    /// Refuse further puts and wake every blocked consumer. Frames already
    /// queued are still returned; end-of-stream follows once they are gone.
    pub fn stop(&self) {
        let mut state = lock(&self.state);
        state.stopped = true;
        drop(state);
        self.ready.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        lock(&self.state).stopped
    }

    pub fn len(&self) -> usize {
        lock(&self.state).frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total frames shed since construction.
    pub fn dropped(&self) -> u64 {
        lock(&self.state).dropped
    }
}

// ----------------------------------------------------------------------------
// LatestFrameSlot: most-recent-wins cell
// ----------------------------------------------------------------------------

/// Single-slot cell. Each `set` replaces the previous frame; reads do not
/// consume, so a slow source gets its last frame re-emitted at output rate.
#[derive(Default)]
pub struct LatestFrameSlot {
    frame: Mutex<Option<Frame>>,
}

impl LatestFrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `frame`, returning true if it replaced an earlier one.
    pub fn set(&self, frame: Frame) -> bool {
        lock(&self.frame).replace(frame).is_some()
    }

    /// The most recently set frame, if any.
    pub fn latest(&self) -> Option<Frame> {
        lock(&self.frame).clone()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.frame).is_none()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
