//! Ingest → process → publish wiring and its lifecycle.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::config::RelayConfig;
use crate::frame::{Frame, FrameBuffer};
use crate::ingest::{FrameSource, IngestStats, IngesterConfig, RtspSource, StreamIngester};
use crate::process::{build_processor, FrameProcessor, ProcessingStage, ProcessingStats};
use crate::publish::{build_sink, FramePacer, PublisherStats, StreamPublisher, StreamSink};
use crate::shutdown::Worker;

/// How ingested frames reach the processing stage.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// Processing runs on the ingest thread, inside the frame callback.
    Callback,
    /// Frames are queued and a dedicated relay thread processes them.
    #[default]
    Buffered,
}

impl FromStr for DeliveryMode {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "callback" | "push" => Ok(DeliveryMode::Callback),
            "buffered" | "pull" => Ok(DeliveryMode::Buffered),
            other => Err(anyhow!("unknown delivery mode '{}'", other)),
        }
    }
}

impl std::fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryMode::Callback => f.write_str("callback"),
            DeliveryMode::Buffered => f.write_str("buffered"),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct RelayStats {
    pub ingest: IngestStats,
    pub buffered: usize,
    pub buffer_dropped: u64,
    pub processing: ProcessingStats,
    pub alerts: u64,
    pub publish: PublisherStats,
    /// Emitted frames per second since the previous `stats` call.
    pub output_fps: f64,
    pub uptime: Duration,
}

impl std::fmt::Display for RelayStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "frames in={} processed={} out={} fps={:.1} skipped_ticks={} shed={} \
             proc_failures={} alerts={} viewers={} reconnects={} backoff={:?}",
            self.ingest.frames,
            self.processing.frames,
            self.publish.frames_emitted,
            self.output_fps,
            self.publish.ticks_skipped,
            self.buffer_dropped,
            self.processing.failures,
            self.alerts,
            self.publish.viewers,
            self.ingest.sessions.saturating_sub(1),
            self.ingest.current_backoff,
        )
    }
}

/// Runs each frame through the stage and hands the result to the publisher.
struct Forwarder {
    stage: Mutex<ProcessingStage>,
    pacer: Arc<FramePacer>,
    min_objects_for_alert: usize,
    alerts: AtomicU64,
}

impl Forwarder {
    fn forward(&self, frame: Frame) {
        let (processed, processor) = {
            let mut stage = self.stage.lock().unwrap_or_else(PoisonError::into_inner);
            (stage.run(frame), stage.processor_name())
        };
        if self.min_objects_for_alert > 0 && processed.count >= self.min_objects_for_alert {
            self.alerts.fetch_add(1, Ordering::Relaxed);
            log::warn!(
                "alert: {} object(s) detected by '{}' (threshold {})",
                processed.count,
                processor,
                self.min_objects_for_alert
            );
        }
        self.pacer.push_frame(processed.frame);
    }

    fn processing_stats(&self) -> ProcessingStats {
        self.stage
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .stats()
    }
}

struct FpsWindow {
    at: Instant,
    emitted: u64,
}

/// The relay: one ingester, an optional processor, one publisher.
pub struct Relay {
    config: RelayConfig,
    source: Option<Box<dyn FrameSource>>,
    publisher: StreamPublisher,
    forwarder: Arc<Forwarder>,
    ingester: Option<StreamIngester>,
    buffer: Option<Arc<FrameBuffer>>,
    forward_worker: Option<Worker>,
    started_at: Option<Instant>,
    fps_window: Mutex<FpsWindow>,
}

impl Relay {
    pub fn new(
        config: RelayConfig,
        source: Box<dyn FrameSource>,
        sink: Box<dyn StreamSink>,
        processor: Option<Box<dyn FrameProcessor>>,
    ) -> Result<Self> {
        let publisher = StreamPublisher::new(config.output.clone(), sink)?;
        let forwarder = Arc::new(Forwarder {
            stage: Mutex::new(ProcessingStage::new(processor)),
            pacer: publisher.pacer().clone(),
            min_objects_for_alert: config.min_objects_for_alert,
            alerts: AtomicU64::new(0),
        });
        Ok(Self {
            config,
            source: Some(source),
            publisher,
            forwarder,
            ingester: None,
            buffer: None,
            forward_worker: None,
            started_at: None,
            fps_window: Mutex::new(FpsWindow {
                at: Instant::now(),
                emitted: 0,
            }),
        })
    }

    /// Relay with the source, sink and processor the config names.
    pub fn from_config(config: RelayConfig) -> Result<Self> {
        RtspSource::supports(&config.input.url)?;
        let source = Box::new(RtspSource::new(config.source_config()));
        let sink = build_sink(&config.output)?;
        let processor = build_processor(&config.processor)?;
        Self::new(config, source, sink, processor)
    }

    /// Start publisher, then the relay thread (buffered mode), then ingest.
    /// Returns the outbound listener address.
    pub fn start(&mut self) -> Result<SocketAddr> {
        if self.source.is_none() {
            return Err(anyhow!("relay already started"));
        }
        let ingester_config = IngesterConfig {
            max_consecutive_failures: self.config.input.max_consecutive_failures,
            join_timeout: self.config.join_timeout(),
            ..IngesterConfig::new(self.config.input.url.clone(), self.config.input.retry_policy()?)
        };

        let addr = self.publisher.start()?;
        let source = self
            .source
            .take()
            .ok_or_else(|| anyhow!("relay already started"))?;

        let mut ingester = match self.config.delivery {
            DeliveryMode::Buffered => {
                let buffer = Arc::new(FrameBuffer::new(self.config.buffer_capacity));
                let forwarder = self.forwarder.clone();
                let queue = buffer.clone();
                let worker = Worker::spawn("relay-forward", move |_notice| {
                    while let Some(frame) = queue.get() {
                        forwarder.forward(frame);
                    }
                    log::debug!("relay: forward thread drained");
                });
                let worker = match worker {
                    Ok(worker) => worker,
                    Err(err) => {
                        self.shutdown_publisher();
                        return Err(err);
                    }
                };
                self.forward_worker = Some(worker);
                self.buffer = Some(buffer.clone());
                StreamIngester::pull(ingester_config, source, buffer)
            }
            DeliveryMode::Callback => {
                let forwarder = self.forwarder.clone();
                StreamIngester::push(ingester_config, source, move |frame| {
                    forwarder.forward(frame)
                })
            }
        };

        if let Err(err) = ingester.start() {
            self.ingester = Some(ingester);
            return Err(self.abort_start(err));
        }
        self.ingester = Some(ingester);
        self.started_at = Some(Instant::now());
        log::info!(
            "relay: {} → {} ({} delivery, processor '{}')",
            crate::error::redact_url(&self.config.input.url),
            self.config.output.endpoint(),
            self.config.delivery,
            self.config.processor.kind
        );
        Ok(addr)
    }

    /// Stop ingest, then the relay thread, then the publisher. Every stage is
    /// stopped even if an earlier one fails; the first error is returned.
    pub fn stop(&mut self) -> Result<()> {
        let mut first_err: Option<anyhow::Error> = None;

        if let Some(ingester) = self.ingester.as_mut() {
            if let Err(err) = ingester.stop() {
                first_err.get_or_insert(err);
            }
        }
        if let Some(buffer) = &self.buffer {
            buffer.stop();
        }
        if let Some(worker) = self.forward_worker.take() {
            if let Err(err) = worker.join_within(self.config.join_timeout()) {
                first_err.get_or_insert(err);
            }
        }
        if let Err(err) = self.publisher.stop() {
            first_err.get_or_insert(err);
        }
        if self.started_at.take().is_some() {
            log::info!("relay: stopped");
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Tear down whatever a failed `start` brought up. The start error wins;
    /// a cleanup failure is only logged.
    fn abort_start(&mut self, err: anyhow::Error) -> anyhow::Error {
        if let Err(stop_err) = self.stop() {
            log::warn!("relay: cleanup after failed start: {:#}", stop_err);
        }
        err
    }

    fn shutdown_publisher(&mut self) {
        if let Err(err) = self.publisher.stop() {
            log::warn!("relay: publisher shutdown: {:#}", err);
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.publisher.local_addr()
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.started_at.is_some()
    }

    /// True once the ingester has hit its failure limit.
    pub fn ingest_gave_up(&self) -> bool {
        self.ingester
            .as_ref()
            .is_some_and(|ingester| ingester.stats().gave_up)
    }

    pub fn stats(&self) -> RelayStats {
        let publish = self.publisher.stats();
        let output_fps = {
            let mut window = self
                .fps_window
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let now = Instant::now();
            let elapsed = now.duration_since(window.at).as_secs_f64();
            let emitted = publish.frames_emitted.saturating_sub(window.emitted);
            window.at = now;
            window.emitted = publish.frames_emitted;
            if elapsed > 0.0 {
                emitted as f64 / elapsed
            } else {
                0.0
            }
        };
        RelayStats {
            ingest: self
                .ingester
                .as_ref()
                .map(|ingester| ingester.stats())
                .unwrap_or_default(),
            buffered: self.buffer.as_ref().map_or(0, |b| b.len()),
            buffer_dropped: self.buffer.as_ref().map_or(0, |b| b.dropped()),
            processing: self.forwarder.processing_stats(),
            alerts: self.forwarder.alerts.load(Ordering::Relaxed),
            publish,
            output_fps,
            uptime: self.started_at.map_or(Duration::ZERO, |t| t.elapsed()),
        }
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        if self.started_at.is_some() {
            if let Err(err) = self.stop() {
                log::warn!("relay: shutdown: {:#}", err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PixelFormat;
    use crate::process::ProcessedFrame;
    use crate::publish::{FrameStreamClient, TcpFrameSink};

    struct Counting {
        frames: u64,
    }

    impl FrameProcessor for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn process(&mut self, frame: &Frame) -> Result<ProcessedFrame> {
            self.frames += 1;
            if self.frames % 2 == 0 {
                return Err(anyhow!("every other frame fails"));
            }
            Ok(ProcessedFrame {
                frame: frame.clone(),
                count: 3,
            })
        }
    }

    fn test_config(delivery: DeliveryMode) -> RelayConfig {
        let mut config = RelayConfig::default();
        config.input.url = "stub://cam?pattern=solid".to_string();
        config.input.retry_interval = 0.01;
        config.input.max_retry_interval = 0.05;
        config.output.listen_address = "127.0.0.1".to_string();
        config.output.port = 0;
        config.output.fps = 50;
        config.output.width = 8;
        config.output.height = 6;
        config.delivery = delivery;
        config
    }

    fn build(config: RelayConfig, processor: Option<Box<dyn FrameProcessor>>) -> Relay {
        let source = Box::new(RtspSource::new(config.source_config()));
        let sink = Box::new(TcpFrameSink::new(config.output.clone()));
        Relay::new(config, source, sink, processor).unwrap()
    }

    fn watch(relay: &Relay, frames: usize) -> Vec<crate::publish::TimedFrame> {
        let addr = relay.local_addr().unwrap();
        let mut viewer =
            FrameStreamClient::connect(addr, "/live", Duration::from_secs(5)).unwrap();
        (0..frames).map(|_| viewer.next_frame().unwrap()).collect()
    }

    #[test]
    fn buffered_relay_streams_source_frames() {
        let mut relay = build(test_config(DeliveryMode::Buffered), None);
        relay.start().unwrap();

        let frames = watch(&relay, 4);
        assert!(frames.iter().all(|t| t.frame.width() == 8 && t.frame.height() == 6));
        assert!(frames.iter().all(|t| t.frame.format() == PixelFormat::Rgb));
        for pair in frames.windows(2) {
            assert_eq!(pair[1].timing.pts - pair[0].timing.pts, 20_000_000);
        }

        relay.stop().unwrap();
        let stats = relay.stats();
        assert!(stats.ingest.frames >= 1);
        assert!(stats.publish.frames_emitted >= 4);
        assert!(!relay.is_running());
    }

    #[test]
    fn callback_relay_isolates_failing_processor_and_raises_alerts() {
        let mut config = test_config(DeliveryMode::Callback);
        config.min_objects_for_alert = 2;
        let mut relay = build(config, Some(Box::new(Counting { frames: 0 })));
        relay.start().unwrap();

        watch(&relay, 3);
        let deadline = Instant::now() + Duration::from_secs(5);
        while relay.stats().processing.frames < 4 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        relay.stop().unwrap();

        let stats = relay.stats();
        assert!(stats.processing.frames >= 4);
        assert!(stats.processing.failures >= 2);
        assert!(stats.alerts >= 2);
        // Failed frames were still forwarded.
        assert_eq!(stats.publish.frames_pushed, stats.processing.frames);
    }

    #[test]
    fn relay_keeps_serving_while_upstream_is_down() {
        let mut config = test_config(DeliveryMode::Buffered);
        config.input.url = "stub://cam?fail_connects=1000".to_string();
        let mut relay = build(config, None);
        let addr = relay.start().unwrap();

        // The listener accepts viewers even though nothing has arrived yet.
        let viewer = FrameStreamClient::connect(addr, "/live", Duration::from_secs(2));
        assert!(viewer.is_ok());
        std::thread::sleep(Duration::from_millis(100));
        let stats = relay.stats();
        assert!(stats.ingest.connect_failures >= 1);
        assert_eq!(stats.publish.frames_emitted, 0);
        assert!(stats.publish.ticks_skipped >= 1);

        relay.stop().unwrap();
    }

    #[test]
    fn start_fails_when_port_taken() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut config = test_config(DeliveryMode::Buffered);
        config.output.port = taken.local_addr().unwrap().port();
        let mut relay = build(config, None);
        let err = relay.start().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<crate::error::RelayError>(),
            Some(crate::error::RelayError::Startup(_))
        ));
    }

    #[test]
    fn aborted_start_releases_listener_and_keeps_start_error() {
        let mut relay = build(test_config(DeliveryMode::Buffered), None);
        let addr = relay.start().unwrap();

        let err = relay.abort_start(anyhow!("ingest thread did not spawn"));
        assert_eq!(err.to_string(), "ingest thread did not spawn");
        assert!(!relay.is_running());
        assert!(std::net::TcpListener::bind(addr).is_ok());
    }

    #[test]
    fn delivery_mode_parses() {
        assert_eq!("callback".parse::<DeliveryMode>().unwrap(), DeliveryMode::Callback);
        assert_eq!("Buffered".parse::<DeliveryMode>().unwrap(), DeliveryMode::Buffered);
        assert!("carrier-pigeon".parse::<DeliveryMode>().is_err());
    }
}
