//! Outbound live stream.
//!
//! The publisher never blocks its producers: `push_frame` only swaps the
//! latest-frame cell. Sinks pull from the `FramePacer` on their own cadence
//! and every emitted frame carries a synthetic timestamp advanced by exactly
//! one frame duration.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::frame::PixelFormat;
use crate::shutdown::StopSignal;

pub mod clock;
#[cfg(feature = "rtsp-server-gstreamer")]
mod gst;
mod pacer;
mod publisher;
pub mod tcp;

pub use clock::{FrameTiming, PublisherClock, NANOS_PER_SECOND};
#[cfg(feature = "rtsp-server-gstreamer")]
pub use gst::GstRtspSink;
pub use pacer::{FramePacer, PublisherStats, TimedFrame};
pub use publisher::StreamPublisher;
pub use tcp::{FrameStreamClient, TcpFrameSink};

/// A downstream server that viewers connect to.
///
/// `bind` runs on the caller's thread so that a taken port fails `start()`.
/// `service` runs on the publisher's thread until `stop` fires; `release`
/// follows it on the same thread and must free the listener.
pub trait StreamSink: Send {
    fn name(&self) -> &'static str;

    fn bind(&mut self, pacer: Arc<FramePacer>) -> Result<SocketAddr>;

    fn service(&mut self, stop: &StopSignal) -> Result<()>;

    fn release(&mut self);
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    #[default]
    Tcp,
    Gstreamer,
}

impl FromStr for SinkKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(SinkKind::Tcp),
            "gstreamer" | "rtsp" => Ok(SinkKind::Gstreamer),
            other => Err(anyhow!("unknown output sink '{}'", other)),
        }
    }
}

impl std::fmt::Display for SinkKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SinkKind::Tcp => f.write_str("tcp"),
            SinkKind::Gstreamer => f.write_str("gstreamer"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct PublisherConfig {
    pub listen_address: String,
    pub port: u16,
    pub mount_path: String,
    pub fps: u32,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub sink: SinkKind,
    pub join_timeout: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0".to_string(),
            port: 8554,
            mount_path: "/live".to_string(),
            fps: 30,
            width: 640,
            height: 480,
            format: PixelFormat::Rgb,
            sink: SinkKind::Tcp,
            join_timeout: Duration::from_secs(5),
        }
    }
}

impl PublisherConfig {
    /// Mount path with exactly one leading slash.
    pub fn normalized_mount(&self) -> String {
        format!("/{}", self.mount_path.trim_start_matches('/'))
    }

    /// Encoder graph fed by the `source` appsrc; `pay0` is the RTP payloader
    /// the RTSP server looks for.
    pub fn pipeline_description(&self) -> String {
        format!(
            "appsrc name=source is-live=true format=time \
             caps=video/x-raw,format={},width={},height={},framerate={}/1 \
             ! videoconvert \
             ! x264enc speed-preset=ultrafast tune=zerolatency \
             ! rtph264pay config-interval=1 name=pay0 pt=96",
            self.format.caps_name(),
            self.width,
            self.height,
            self.fps
        )
    }

    pub fn endpoint(&self) -> String {
        let scheme = match self.sink {
            SinkKind::Tcp => "http",
            SinkKind::Gstreamer => "rtsp",
        };
        format!(
            "{}://{}:{}{}",
            scheme,
            self.listen_address,
            self.port,
            self.normalized_mount()
        )
    }

    pub fn validate(&self) -> Result<()> {
        if self.fps == 0 {
            return Err(anyhow!("output fps must be greater than zero"));
        }
        if self.width == 0 || self.height == 0 {
            return Err(anyhow!(
                "output dimensions must be non-zero (got {}x{})",
                self.width,
                self.height
            ));
        }
        if self.listen_address.trim().is_empty() {
            return Err(anyhow!("output listen address is empty"));
        }
        Ok(())
    }
}

/// Build the sink named by `config.sink`.
pub fn build_sink(config: &PublisherConfig) -> Result<Box<dyn StreamSink>> {
    match config.sink {
        SinkKind::Tcp => Ok(Box::new(TcpFrameSink::new(config.clone()))),
        #[cfg(feature = "rtsp-server-gstreamer")]
        SinkKind::Gstreamer => Ok(Box::new(GstRtspSink::new(config.clone()))),
        #[cfg(not(feature = "rtsp-server-gstreamer"))]
        SinkKind::Gstreamer => Err(anyhow!(
            "gstreamer output requires the rtsp-server-gstreamer feature"
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_carries_caps_and_payloader() {
        let config = PublisherConfig {
            width: 320,
            height: 240,
            fps: 15,
            ..PublisherConfig::default()
        };
        let desc = config.pipeline_description();
        assert!(desc.starts_with("appsrc name=source is-live=true"));
        assert!(desc.contains("format=RGB,width=320,height=240,framerate=15/1"));
        assert!(desc.contains("tune=zerolatency"));
        assert!(desc.contains("name=pay0 pt=96"));
    }

    #[test]
    fn mount_path_is_normalized() {
        let mut config = PublisherConfig::default();
        config.mount_path = "live".to_string();
        assert_eq!(config.normalized_mount(), "/live");
        config.mount_path = "//cam/1".to_string();
        assert_eq!(config.normalized_mount(), "/cam/1");
        assert_eq!(config.endpoint(), "http://0.0.0.0:8554/cam/1");
    }

    #[test]
    fn sink_kind_parses() {
        assert_eq!("TCP".parse::<SinkKind>().unwrap(), SinkKind::Tcp);
        assert_eq!(
            "gstreamer".parse::<SinkKind>().unwrap(),
            SinkKind::Gstreamer
        );
        assert!("udp".parse::<SinkKind>().is_err());
    }

    #[test]
    fn validate_rejects_zero_fps() {
        let config = PublisherConfig {
            fps: 0,
            ..PublisherConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[cfg(not(feature = "rtsp-server-gstreamer"))]
    #[test]
    fn gstreamer_sink_needs_feature() {
        let config = PublisherConfig {
            sink: SinkKind::Gstreamer,
            ..PublisherConfig::default()
        };
        assert!(build_sink(&config).is_err());
    }
}
