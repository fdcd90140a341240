//! RTSP frame relay
//!
//! Pulls a live video stream from an upstream source, optionally runs each
//! frame through a processing step, and re-publishes the result as a live
//! stream viewers can connect to.
//!
//! # Architecture
//!
//! The relay keeps two promises:
//!
//! 1. **The outbound stream outlives the upstream.** Upstream failures are
//!    retried forever with capped exponential backoff; viewers see a stalled
//!    picture, never a refused connection.
//! 2. **Output timing is synthetic.** Every emitted frame advances a
//!    nanosecond clock by exactly `1/fps`, however irregular the input.
//!
//! # Module Structure
//!
//! - `frame`: Frame, FrameBuffer (bounded, drop-oldest), LatestFrameSlot
//! - `ingest`: FrameSource, RtspSource, StreamIngester, retry policy
//! - `process`: FrameProcessor, ProcessingStage (failure isolation)
//! - `publish`: FramePacer, StreamSink, TcpFrameSink, GstRtspSink, StreamPublisher
//! - `relay`: the orchestrator
//! - `config`: RelayConfig (JSON file + environment)

pub mod config;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod process;
pub mod publish;
pub mod relay;
pub mod shutdown;

pub use config::RelayConfig;
pub use error::{redact_url, RelayError};
pub use frame::{Frame, FrameBuffer, LatestFrameSlot, PixelFormat};
pub use ingest::{
    ConnectionState, FrameSource, RetryPolicy, RtspConfig, RtspSource, StreamIngester,
};
pub use process::{FrameProcessor, ProcessedFrame, ProcessingStage};
pub use publish::{FramePacer, FrameTiming, PublisherConfig, StreamPublisher, StreamSink};
pub use relay::{DeliveryMode, Relay, RelayStats};
pub use shutdown::StopSignal;
