//! RTSP frame source.
//!
//! `RtspSource` implements [`FrameSource`] with one of two backends, picked
//! per `open` from the URL scheme:
//!
//! - `stub://...`: synthetic frames generated in-process. The query string
//!   scripts a flaky upstream for tests and demos:
//!   `fail_connects=N` refuses the first N opens, `session_frames=M` ends each
//!   session after M frames, `pattern=gradient|noise|solid` picks the content.
//! - anything else: GStreamer `rtspsrc ! decodebin ! videoconvert ! appsink`
//!   (feature: rtsp-gstreamer).
//!
//! The source MUST NOT retain frames beyond handoff to the ingester.

#[cfg(feature = "rtsp-gstreamer")]
use anyhow::Context;
use anyhow::{anyhow, Result};
use rand::RngCore;
use std::time::Duration;

use super::FrameSource;
use crate::frame::{Frame, PixelFormat};

const STUB_SCHEME: &str = "stub://";

/// Decode settings shared by both backends.
#[derive(Clone, Debug)]
pub struct RtspConfig {
    /// Target frame rate. The synthetic backend paces itself to this rate;
    /// GStreamer uses it to size the read timeout.
    pub target_fps: u32,
    /// Width of every delivered frame. Camera video is scaled to it.
    pub width: u32,
    /// Height of every delivered frame. Camera video is scaled to it.
    pub height: u32,
    /// `rtspsrc` jitter-buffer latency in milliseconds.
    pub latency_ms: u32,
}

impl RtspConfig {
    /// GStreamer decode pipeline for `url`, scaled to `width`x`height` RGB.
    pub fn ingest_pipeline(&self, url: &str) -> String {
        format!(
            "rtspsrc location={} latency={} ! decodebin ! videoconvert ! videoscale ! \
             video/x-raw,format=RGB,width={},height={} ! \
             appsink name=appsink sync=false max-buffers=1 drop=true",
            url, self.latency_ms, self.width, self.height
        )
    }
}

impl Default for RtspConfig {
    fn default() -> Self {
        Self {
            target_fps: 30,
            width: 640,
            height: 480,
            latency_ms: 0,
        }
    }
}

/// Upstream source for RTSP cameras (and `stub://` test streams).
pub struct RtspSource {
    config: RtspConfig,
    backend: Option<RtspBackend>,
    /// Opens of `stub://` URLs so far; drives `fail_connects`.
    synthetic_opens: u64,
}

enum RtspBackend {
    Synthetic(SyntheticRtspSource),
    #[cfg(feature = "rtsp-gstreamer")]
    Gstreamer(GstreamerRtspSource),
}

impl RtspSource {
    pub fn new(config: RtspConfig) -> Self {
        Self {
            config,
            backend: None,
            synthetic_opens: 0,
        }
    }

    /// Check that this build can open `url` at all.
    ///
    /// A URL that can never be opened would otherwise retry forever.
    pub fn supports(url: &str) -> Result<()> {
        if url.starts_with(STUB_SCHEME) {
            return SyntheticOptions::parse(url).map(|_| ());
        }
        let parsed = url::Url::parse(url).map_err(|e| anyhow!("invalid source url: {}", e))?;
        match parsed.scheme() {
            "rtsp" | "rtsps" | "rtspt" | "http" | "https" => {}
            other => return Err(anyhow!("unsupported source scheme '{}'", other)),
        }
        #[cfg(feature = "rtsp-gstreamer")]
        {
            Ok(())
        }
        #[cfg(not(feature = "rtsp-gstreamer"))]
        {
            Err(anyhow!("RTSP requires the rtsp-gstreamer feature"))
        }
    }
}

impl FrameSource for RtspSource {
    fn open(&mut self, url: &str) -> Result<()> {
        self.release();
        Self::supports(url)?;
        if url.starts_with(STUB_SCHEME) {
            self.synthetic_opens += 1;
            let source = SyntheticRtspSource::open(&self.config, url, self.synthetic_opens)?;
            self.backend = Some(RtspBackend::Synthetic(source));
            return Ok(());
        }
        #[cfg(feature = "rtsp-gstreamer")]
        {
            let source = GstreamerRtspSource::open(&self.config, url)?;
            self.backend = Some(RtspBackend::Gstreamer(source));
            Ok(())
        }
        #[cfg(not(feature = "rtsp-gstreamer"))]
        {
            Err(anyhow!("RTSP requires the rtsp-gstreamer feature"))
        }
    }

    fn read(&mut self) -> Result<Option<Frame>> {
        match &mut self.backend {
            None => Err(anyhow!("source is not open")),
            Some(RtspBackend::Synthetic(source)) => source.next_frame(),
            #[cfg(feature = "rtsp-gstreamer")]
            Some(RtspBackend::Gstreamer(source)) => source.next_frame(),
        }
    }

    fn release(&mut self) {
        if let Some(backend) = self.backend.take() {
            match backend {
                RtspBackend::Synthetic(_) => {}
                #[cfg(feature = "rtsp-gstreamer")]
                RtspBackend::Gstreamer(mut source) => source.close(),
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Synthetic source (stub://) for tests and demos
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Pattern {
    Gradient,
    Noise,
    Solid,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct SyntheticOptions {
    fail_connects: u64,
    session_frames: Option<u64>,
    pattern: Pattern,
}

impl SyntheticOptions {
    fn parse(url: &str) -> Result<Self> {
        let parsed = url::Url::parse(url).map_err(|e| anyhow!("invalid stub url: {}", e))?;
        let mut options = Self {
            fail_connects: 0,
            session_frames: None,
            pattern: Pattern::Gradient,
        };
        for (key, value) in parsed.query_pairs() {
            match key.as_ref() {
                "fail_connects" => {
                    options.fail_connects = value
                        .parse()
                        .map_err(|_| anyhow!("fail_connects must be an integer"))?;
                }
                "session_frames" => {
                    options.session_frames = Some(
                        value
                            .parse()
                            .map_err(|_| anyhow!("session_frames must be an integer"))?,
                    );
                }
                "pattern" => {
                    options.pattern = match value.as_ref() {
                        "gradient" => Pattern::Gradient,
                        "noise" => Pattern::Noise,
                        "solid" => Pattern::Solid,
                        other => return Err(anyhow!("unknown stub pattern '{}'", other)),
                    };
                }
                other => return Err(anyhow!("unknown stub option '{}'", other)),
            }
        }
        Ok(options)
    }
}

struct SyntheticRtspSource {
    width: u32,
    height: u32,
    frame_interval: Option<Duration>,
    options: SyntheticOptions,
    frame_count: u64,
    /// Simulated scene state; changes every 50 frames.
    scene_state: u8,
}

impl SyntheticRtspSource {
    fn open(config: &RtspConfig, url: &str, open_number: u64) -> Result<Self> {
        let options = SyntheticOptions::parse(url)?;
        if open_number <= options.fail_connects {
            return Err(anyhow!(
                "synthetic upstream refused connection ({} of {})",
                open_number,
                options.fail_connects
            ));
        }
        log::info!(
            "RtspSource: connected to {} (synthetic)",
            crate::error::redact_url(url)
        );
        let frame_interval = if config.target_fps == 0 {
            None
        } else {
            Some(Duration::from_nanos(
                1_000_000_000 / u64::from(config.target_fps),
            ))
        };
        Ok(Self {
            width: config.width,
            height: config.height,
            frame_interval,
            options,
            frame_count: 0,
            scene_state: 0,
        })
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if let Some(limit) = self.options.session_frames {
            if self.frame_count >= limit {
                return Ok(None);
            }
        }
        if let Some(interval) = self.frame_interval {
            std::thread::sleep(interval);
        }
        self.frame_count += 1;
        let pixels = self.generate_pixels();
        Frame::new(pixels, self.width, self.height, PixelFormat::Rgb).map(Some)
    }

    fn generate_pixels(&mut self) -> Vec<u8> {
        let pixel_count = (self.width as usize) * (self.height as usize) * 3;

        if self.frame_count % 50 == 0 {
            self.scene_state = self.scene_state.wrapping_add(1);
        }

        match self.options.pattern {
            Pattern::Gradient => {
                let mut pixels = vec![0u8; pixel_count];
                for (i, pixel) in pixels.iter_mut().enumerate() {
                    *pixel = ((i as u64 + self.frame_count + self.scene_state as u64) % 256) as u8;
                }
                pixels
            }
            Pattern::Noise => {
                let mut pixels = vec![0u8; pixel_count];
                rand::thread_rng().fill_bytes(&mut pixels);
                pixels
            }
            Pattern::Solid => vec![self.scene_state.wrapping_mul(40); pixel_count],
        }
    }
}

// ----------------------------------------------------------------------------
// Production RTSP source using GStreamer
// ----------------------------------------------------------------------------

#[cfg(feature = "rtsp-gstreamer")]
struct GstreamerRtspSource {
    url: String,
    target_fps: u32,
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
    last_error: Option<String>,
}

#[cfg(feature = "rtsp-gstreamer")]
impl GstreamerRtspSource {
    fn open(config: &RtspConfig, url: &str) -> Result<Self> {
        use gstreamer::prelude::*;

        gstreamer::init().context("initialize gstreamer")?;

        let pipeline = gstreamer::parse::launch(&config.ingest_pipeline(url))
            .context("build RTSP pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("RTSP pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow!("appsink element has unexpected type"))?;

        let caps = gstreamer::Caps::builder("video/x-raw")
            .field("format", "RGB")
            .field("width", config.width as i32)
            .field("height", config.height as i32)
            .build();
        appsink.set_caps(Some(&caps));
        appsink.set_max_buffers(1);
        appsink.set_drop(true);
        appsink.set_sync(false);

        let mut source = Self {
            url: url.to_string(),
            target_fps: config.target_fps,
            pipeline,
            appsink,
            last_error: None,
        };
        if let Err(err) = source
            .pipeline
            .set_state(gstreamer::State::Playing)
            .context("set RTSP pipeline to Playing")
        {
            source.close();
            return Err(err);
        }
        log::info!(
            "RtspSource: connected to {}",
            crate::error::redact_url(&source.url)
        );
        Ok(source)
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        self.poll_bus();
        if let Some(err) = &self.last_error {
            return Err(anyhow!("{}", err));
        }

        let timeout = gstreamer::ClockTime::from_mseconds(self.frame_timeout().as_millis() as u64);
        let Some(sample) = self.appsink.try_pull_sample(timeout) else {
            if self.appsink.is_eos() {
                return Ok(None);
            }
            return Err(anyhow!("RTSP stream stalled"));
        };

        sample_to_frame(&sample).map(Some)
    }

    fn close(&mut self) {
        use gstreamer::prelude::*;

        if let Err(err) = self.pipeline.set_state(gstreamer::State::Null) {
            log::warn!("RtspSource: failed to stop pipeline: {}", err);
        }
    }

    fn frame_timeout(&self) -> Duration {
        let base_ms = if self.target_fps == 0 {
            500
        } else {
            (1000 / self.target_fps).saturating_mul(4)
        };
        Duration::from_millis(base_ms.max(500) as u64)
    }

    fn poll_bus(&mut self) {
        use gstreamer::prelude::*;

        let Some(bus) = self.pipeline.bus() else {
            return;
        };
        while let Some(message) = bus.timed_pop(gstreamer::ClockTime::ZERO) {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    self.last_error = Some(format!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    ));
                }
                MessageView::Eos(..) => {
                    self.last_error = Some("gstreamer reached EOS".to_string());
                }
                _ => {}
            }
        }
    }
}

#[cfg(feature = "rtsp-gstreamer")]
impl Drop for GstreamerRtspSource {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(feature = "rtsp-gstreamer")]
fn sample_to_frame(sample: &gstreamer::Sample) -> Result<Frame> {
    let buffer = sample.buffer().context("RTSP sample missing buffer")?;
    let caps = sample.caps().context("RTSP sample missing caps")?;
    let info =
        gstreamer_video::VideoInfo::from_caps(caps).context("parse RTSP caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map RTSP buffer")?;
    let data = map.as_slice();

    if stride == row_bytes {
        let len = row_bytes * height as usize;
        let pixels = data
            .get(..len)
            .context("RTSP buffer shorter than frame")?
            .to_vec();
        return Frame::new(pixels, width, height, PixelFormat::Rgb);
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("RTSP buffer row is out of bounds")?,
        );
    }
    Frame::new(pixels, width, height, PixelFormat::Rgb)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn stub_config() -> RtspConfig {
        RtspConfig {
            target_fps: 0,
            width: 64,
            height: 48,
            latency_ms: 0,
        }
    }

    #[test]
    fn rtsp_source_produces_frames() -> Result<()> {
        let mut source = RtspSource::new(stub_config());
        source.open("stub://test")?;

        let frame = source.read()?.expect("frame");
        assert_eq!(frame.width(), 64);
        assert_eq!(frame.height(), 48);
        assert_eq!(frame.format(), PixelFormat::Rgb);

        Ok(())
    }

    #[test]
    fn read_before_open_fails() {
        let mut source = RtspSource::new(stub_config());
        assert!(source.read().is_err());
    }

    #[test]
    fn fail_connects_refuses_first_opens() {
        let mut source = RtspSource::new(stub_config());
        let url = "stub://cam?fail_connects=2";
        assert!(source.open(url).is_err());
        assert!(source.open(url).is_err());
        assert!(source.open(url).is_ok());
        assert!(source.read().unwrap().is_some());
    }

    #[test]
    fn session_frames_ends_stream() -> Result<()> {
        let mut source = RtspSource::new(stub_config());
        source.open("stub://cam?session_frames=2")?;
        assert!(source.read()?.is_some());
        assert!(source.read()?.is_some());
        assert!(source.read()?.is_none());

        // Reopening starts a fresh session.
        source.open("stub://cam?session_frames=2")?;
        assert!(source.read()?.is_some());
        Ok(())
    }

    #[test]
    fn release_closes_the_stream() -> Result<()> {
        let mut source = RtspSource::new(stub_config());
        source.open("stub://cam")?;
        source.release();
        assert!(source.read().is_err());
        // Releasing twice is harmless.
        source.release();
        Ok(())
    }

    #[test]
    fn noise_frames_differ() -> Result<()> {
        let mut source = RtspSource::new(stub_config());
        source.open("stub://cam?pattern=noise")?;
        let a = source.read()?.expect("frame");
        let b = source.read()?.expect("frame");
        assert_ne!(a.pixels(), b.pixels());
        Ok(())
    }

    #[test]
    fn rejects_bad_stub_options() {
        assert!(RtspSource::supports("stub://cam?pattern=plaid").is_err());
        assert!(RtspSource::supports("stub://cam?bogus=1").is_err());
        assert!(RtspSource::supports("stub://cam?fail_connects=x").is_err());
        assert!(RtspSource::supports("stub://cam?fail_connects=1&session_frames=5").is_ok());
        assert!(RtspSource::supports("ftp://cam").is_err());
    }

    #[cfg(not(feature = "rtsp-gstreamer"))]
    #[test]
    fn rtsp_urls_need_gstreamer_feature() {
        assert!(RtspSource::supports("rtsp://10.0.0.5:554/stream").is_err());
    }

    #[test]
    fn camera_pipeline_scales_to_configured_size() {
        let config = RtspConfig {
            width: 640,
            height: 480,
            latency_ms: 100,
            ..RtspConfig::default()
        };
        let pipeline = config.ingest_pipeline("rtsp://10.0.0.5:554/stream");
        assert!(pipeline.starts_with("rtspsrc location=rtsp://10.0.0.5:554/stream latency=100 "));
        assert!(pipeline.contains("videoscale ! video/x-raw,format=RGB,width=640,height=480 ! appsink"));
    }

    #[test]
    fn synthetic_source_paces_to_target_fps() -> Result<()> {
        let mut source = RtspSource::new(RtspConfig {
            target_fps: 50,
            ..stub_config()
        });
        source.open("stub://cam")?;
        let started = std::time::Instant::now();
        for _ in 0..5 {
            source.read()?;
        }
        assert!(started.elapsed() >= Duration::from_millis(100));
        Ok(())
    }
}
