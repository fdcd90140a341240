//! Upstream ingestion.
//!
//! - `FrameSource`: the upstream collaborator (open / read / release).
//! - `RtspSource`: GStreamer RTSP decode (feature: rtsp-gstreamer), or a
//!   synthetic generator for `stub://` URLs.
//! - `StreamIngester`: the self-healing connect-and-pull loop.
//! - `retry`: backoff policy and the connection state machine.
//!
//! Only connection-level retry exists. A failed or empty read ends the
//! session; nothing attempts to recover a partial frame.

use anyhow::Result;

use crate::frame::Frame;

mod ingester;
pub mod retry;
pub mod rtsp;

pub use ingester::{FrameDelivery, IngestStats, IngesterConfig, StreamIngester};
pub use retry::{Backoff, ConnectionMachine, ConnectionState, NextStep, RetryPolicy};
pub use rtsp::{RtspConfig, RtspSource};

/// An upstream stream that can be opened, read frame by frame, and released.
///
/// Implementations may block in `read` for up to their own read timeout; the
/// ingester checks for shutdown between reads.
pub trait FrameSource: Send {
    /// Open (or re-open) the stream at `url`.
    fn open(&mut self, url: &str) -> Result<()>;

    /// Next decoded frame. `Ok(None)` means the stream ended.
    fn read(&mut self) -> Result<Option<Frame>>;

    /// Tear down the connection. Must be safe to call when not open.
    fn release(&mut self);
}

impl FrameSource for Box<dyn FrameSource> {
    fn open(&mut self, url: &str) -> Result<()> {
        (**self).open(url)
    }

    fn read(&mut self) -> Result<Option<Frame>> {
        (**self).read()
    }

    fn release(&mut self) {
        (**self).release()
    }
}
