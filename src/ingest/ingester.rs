//! Self-healing ingest loop.

use anyhow::{anyhow, Result};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use super::retry::{ConnectionMachine, NextStep, RetryPolicy};
use super::FrameSource;
use crate::error::{redact_url, RelayError};
use crate::frame::{Frame, FrameBuffer};
use crate::shutdown::{StopSignal, Worker};

const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct IngesterConfig {
    /// Upstream URL handed to `FrameSource::open`.
    pub url: String,
    pub retry: RetryPolicy,
    /// Upper bound on how long `stop()` waits for the worker.
    pub join_timeout: Duration,
    /// Give up after this many connect failures in a row. `None` retries forever.
    pub max_consecutive_failures: Option<u32>,
}

impl IngesterConfig {
    pub fn new(url: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            url: url.into(),
            retry,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
            max_consecutive_failures: None,
        }
    }
}

/// How decoded frames leave the ingest thread.
pub enum FrameDelivery {
    /// Frames go into a bounded buffer; consumers call `get_frame`.
    Pull(Arc<FrameBuffer>),
    /// The callback runs on the ingest thread once per frame. It must not
    /// block, or ingestion stalls behind it.
    Push(Box<dyn FnMut(Frame) + Send>),
}

/// Snapshot of ingest counters.
#[derive(Clone, Debug, Default)]
pub struct IngestStats {
    pub connect_attempts: u64,
    pub connect_failures: u64,
    pub sessions: u64,
    pub frames: u64,
    /// Frames shed by a full pull buffer.
    pub frames_shed: u64,
    pub current_backoff: Duration,
    pub last_error: Option<String>,
    /// The worker gave up after its failure limit.
    pub gave_up: bool,
}

/// Connects to an upstream source and keeps frames flowing, reconnecting with
/// exponential backoff whenever the connection fails or the stream ends.
pub struct StreamIngester {
    config: IngesterConfig,
    source: Option<Box<dyn FrameSource>>,
    delivery: Option<FrameDelivery>,
    buffer: Option<Arc<FrameBuffer>>,
    stop: StopSignal,
    stats: Arc<Mutex<IngestStats>>,
    worker: Option<Worker>,
}

impl StreamIngester {
    /// Ingester delivering into `buffer` (pull mode).
    pub fn pull<S>(config: IngesterConfig, source: S, buffer: Arc<FrameBuffer>) -> Self
    where
        S: FrameSource + 'static,
    {
        let mut ingester = Self::with_delivery(
            config,
            Box::new(source),
            FrameDelivery::Pull(buffer.clone()),
        );
        ingester.buffer = Some(buffer);
        ingester
    }

    /// Ingester invoking `callback` for every frame (push mode).
    pub fn push<S, F>(config: IngesterConfig, source: S, callback: F) -> Self
    where
        S: FrameSource + 'static,
        F: FnMut(Frame) + Send + 'static,
    {
        Self::with_delivery(
            config,
            Box::new(source),
            FrameDelivery::Push(Box::new(callback)),
        )
    }

    pub fn with_delivery(
        config: IngesterConfig,
        source: Box<dyn FrameSource>,
        delivery: FrameDelivery,
    ) -> Self {
        Self {
            config,
            source: Some(source),
            delivery: Some(delivery),
            buffer: None,
            stop: StopSignal::new(),
            stats: Arc::new(Mutex::new(IngestStats::default())),
            worker: None,
        }
    }

    /// Spawn the connect-and-pull worker. An ingester runs at most once.
    pub fn start(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Err(anyhow!("ingester already running"));
        }
        let (Some(mut source), Some(delivery)) = (self.source.take(), self.delivery.take()) else {
            return Err(anyhow!("ingester cannot be restarted after stop"));
        };

        let url = self.config.url.clone();
        let machine = ConnectionMachine::new(self.config.retry)
            .with_failure_limit(self.config.max_consecutive_failures);
        let stop = self.stop.clone();
        let stats = self.stats.clone();

        log::info!("ingest: starting for {}", redact_url(&url));
        let worker = Worker::spawn("relay-ingest", move |_notice| {
            let mut loop_state = IngestLoop {
                url,
                machine,
                delivery,
                stop,
                stats,
            };
            loop_state.run(source.as_mut());
            source.release();
        })?;
        self.worker = Some(worker);
        Ok(())
    }

    /// Stop the worker and wait for it to release the upstream connection.
    ///
    /// In pull mode the buffer is stopped too, so consumers blocked in
    /// `get_frame` see end-of-stream.
    pub fn stop(&mut self) -> Result<()> {
        self.stop.stop();
        if let Some(buffer) = &self.buffer {
            buffer.stop();
        }
        match self.worker.take() {
            Some(worker) => {
                let result = worker.join_within(self.config.join_timeout);
                if result.is_ok() {
                    log::info!("ingest: stopped");
                }
                result
            }
            None => Ok(()),
        }
    }

    /// Next frame in pull mode. Blocks; `None` at end-of-stream or in push mode.
    pub fn get_frame(&self) -> Option<Frame> {
        self.buffer.as_ref().and_then(|buffer| buffer.get())
    }

    pub fn buffer(&self) -> Option<&Arc<FrameBuffer>> {
        self.buffer.as_ref()
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    pub fn stats(&self) -> IngestStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Drop for StreamIngester {
    fn drop(&mut self) {
        if self.worker.is_some() {
            if let Err(err) = self.stop() {
                log::warn!("ingest: {}", err);
            }
        }
    }
}

/// State owned by the worker thread.
struct IngestLoop {
    url: String,
    machine: ConnectionMachine,
    delivery: FrameDelivery,
    stop: StopSignal,
    stats: Arc<Mutex<IngestStats>>,
}

impl IngestLoop {
    fn run(&mut self, source: &mut dyn FrameSource) {
        loop {
            if self.stop.is_stopped() {
                break;
            }
            let attempt = self.machine.begin_connect();
            self.update_stats(|s| s.connect_attempts += 1);

            let next = match source.open(&self.url) {
                Ok(()) => {
                    self.machine.connected();
                    log::info!(
                        "ingest: streaming from {} (attempt {})",
                        redact_url(&self.url),
                        attempt
                    );
                    self.update_stats(|s| {
                        s.sessions += 1;
                        s.current_backoff = Duration::ZERO;
                    });
                    let ended = self.stream(source);
                    source.release();
                    match ended {
                        None => break,
                        Some(reason) => {
                            let err = RelayError::Read {
                                url: redact_url(&self.url),
                                reason,
                            };
                            log::warn!("ingest: {}", err);
                            self.update_stats(|s| s.last_error = Some(err.to_string()));
                            self.machine.session_ended()
                        }
                    }
                }
                Err(e) => {
                    source.release();
                    let err = RelayError::Connect {
                        url: redact_url(&self.url),
                        attempt,
                        reason: format!("{:#}", e),
                    };
                    log::error!("ingest: {}", err);
                    self.update_stats(|s| {
                        s.connect_failures += 1;
                        s.last_error = Some(err.to_string());
                    });
                    self.machine.connect_failed()
                }
            };

            match next {
                NextStep::Retry(delay) => {
                    log::info!(
                        "ingest: retrying {} in {:.2}s (next backoff {:.2}s)",
                        redact_url(&self.url),
                        delay.as_secs_f64(),
                        self.machine.current_delay().as_secs_f64()
                    );
                    self.update_stats(|s| s.current_backoff = delay);
                    if self.stop.sleep(delay) {
                        break;
                    }
                }
                NextStep::GiveUp => {
                    log::error!(
                        "ingest: giving up on {} after {} attempts",
                        redact_url(&self.url),
                        self.machine.attempts()
                    );
                    self.update_stats(|s| s.gave_up = true);
                    return;
                }
            }
        }
        self.machine.shutdown();
    }

    /// Pull frames until the session ends. Returns `None` if stopped, or the
    /// reason the stream ended.
    fn stream(&mut self, source: &mut dyn FrameSource) -> Option<String> {
        loop {
            if self.stop.is_stopped() {
                return None;
            }
            match source.read() {
                Ok(Some(frame)) => self.deliver(frame),
                Ok(None) => return Some("stream ended".to_string()),
                Err(e) => return Some(format!("{:#}", e)),
            }
        }
    }

    fn deliver(&mut self, frame: Frame) {
        let shed = match &mut self.delivery {
            FrameDelivery::Pull(buffer) => buffer.put(frame) as u64,
            FrameDelivery::Push(callback) => {
                callback(frame);
                0
            }
        };
        self.update_stats(|s| {
            s.frames += 1;
            s.frames_shed += shed;
        });
    }

    fn update_stats(&self, f: impl FnOnce(&mut IngestStats)) {
        f(&mut self.stats.lock().unwrap_or_else(PoisonError::into_inner));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PixelFormat;
    use std::collections::VecDeque;
    use std::sync::mpsc;
    use std::time::Instant;

    /// Scripted upstream: each `open` pops the next outcome; an `Ok(n)` session
    /// yields `n` frames and then ends.
    struct ScriptedSource {
        script: VecDeque<std::result::Result<usize, &'static str>>,
        remaining: usize,
        open: bool,
        opens: Arc<Mutex<Vec<Instant>>>,
        releases: Arc<Mutex<u32>>,
    }

    impl ScriptedSource {
        fn new(script: Vec<std::result::Result<usize, &'static str>>) -> Self {
            Self {
                script: script.into(),
                remaining: 0,
                open: false,
                opens: Arc::new(Mutex::new(Vec::new())),
                releases: Arc::new(Mutex::new(0)),
            }
        }
    }

    impl FrameSource for ScriptedSource {
        fn open(&mut self, _url: &str) -> Result<()> {
            self.opens.lock().unwrap().push(Instant::now());
            match self.script.pop_front().unwrap_or(Err("script exhausted")) {
                Ok(frames) => {
                    self.remaining = frames;
                    self.open = true;
                    Ok(())
                }
                Err(reason) => Err(anyhow!(reason)),
            }
        }

        fn read(&mut self) -> Result<Option<Frame>> {
            if !self.open {
                return Err(anyhow!("not open"));
            }
            if self.remaining == 0 {
                return Ok(None);
            }
            self.remaining -= 1;
            Frame::solid(2, 2, PixelFormat::Gray, self.remaining as u8).map(Some)
        }

        fn release(&mut self) {
            self.open = false;
            *self.releases.lock().unwrap() += 1;
        }
    }

    fn fast_config(initial_ms: u64, max_ms: u64) -> IngesterConfig {
        config_with_multiplier(initial_ms, max_ms, 1.5)
    }

    fn config_with_multiplier(initial_ms: u64, max_ms: u64, multiplier: f64) -> IngesterConfig {
        IngesterConfig::new(
            "stub://scripted",
            RetryPolicy::new(
                Duration::from_millis(initial_ms),
                Duration::from_millis(max_ms),
                multiplier,
            )
            .unwrap(),
        )
    }

    fn wait_for(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn pull_mode_delivers_frames_to_buffer() {
        let buffer = Arc::new(FrameBuffer::new(16));
        let source = ScriptedSource::new(vec![Ok(3)]);
        let mut ingester = StreamIngester::pull(fast_config(1000, 1000), source, buffer);
        ingester.start().unwrap();

        for _ in 0..3 {
            assert!(ingester.get_frame().is_some());
        }
        wait_for(|| ingester.stats().sessions == 1 && ingester.stats().frames == 3);
        ingester.stop().unwrap();
        assert!(ingester.get_frame().is_none());
    }

    #[test]
    fn push_mode_invokes_callback_per_frame() {
        let (tx, rx) = mpsc::channel();
        let source = ScriptedSource::new(vec![Ok(4)]);
        let mut ingester = StreamIngester::push(fast_config(1000, 1000), source, move |frame| {
            let _ = tx.send(frame);
        });
        ingester.start().unwrap();
        for _ in 0..4 {
            rx.recv_timeout(Duration::from_secs(5)).expect("frame");
        }
        ingester.stop().unwrap();
        assert!(ingester.get_frame().is_none());
        assert_eq!(ingester.stats().frames, 4);
    }

    #[test]
    fn reconnects_with_backoff_then_resets_after_session() {
        // Three refused connects, a short session, then a refused connect.
        let source = ScriptedSource::new(vec![
            Err("refused"),
            Err("refused"),
            Err("refused"),
            Ok(1),
            Err("refused"),
        ]);
        let opens = source.opens.clone();
        let mut ingester =
            StreamIngester::push(config_with_multiplier(50, 5_000, 3.0), source, |_frame| {});
        ingester.start().unwrap();
        wait_for(|| opens.lock().unwrap().len() >= 5);
        ingester.stop().unwrap();

        let opens = opens.lock().unwrap();
        let gaps: Vec<Duration> = opens.windows(2).map(|w| w[1] - w[0]).collect();
        // 50ms, 150ms, 450ms, then back to 50ms after the session.
        let expected = [50u64, 150, 450, 50];
        for (gap, expected_ms) in gaps.iter().zip(expected) {
            assert!(
                *gap >= Duration::from_millis(expected_ms),
                "gap {:?} shorter than {}ms",
                gap,
                expected_ms
            );
        }
        // Without the reset this gap would be 1350ms.
        assert!(gaps[3] < Duration::from_millis(1000));

        let stats = ingester.stats();
        assert_eq!(stats.connect_failures, 4);
        assert_eq!(stats.sessions, 1);
        assert_eq!(stats.frames, 1);
    }

    #[test]
    fn stop_interrupts_long_backoff() {
        let source = ScriptedSource::new(vec![Err("refused")]);
        let releases = source.releases.clone();
        let mut ingester =
            StreamIngester::push(fast_config(30_000, 60_000), source, |_frame| {});
        ingester.start().unwrap();
        wait_for(|| ingester.stats().connect_failures == 1);

        let started = Instant::now();
        ingester.stop().unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!ingester.is_running());
        assert!(*releases.lock().unwrap() >= 1);
    }

    #[test]
    fn gives_up_after_failure_limit() {
        let source = ScriptedSource::new(vec![Err("refused"), Err("refused")]);
        let mut config = fast_config(5, 10);
        config.max_consecutive_failures = Some(2);
        let mut ingester = StreamIngester::push(config, source, |_frame| {});
        ingester.start().unwrap();
        wait_for(|| ingester.stats().gave_up);
        ingester.stop().unwrap();
        assert_eq!(ingester.stats().connect_attempts, 2);
    }

    #[test]
    fn cannot_restart_after_stop() {
        let source = ScriptedSource::new(vec![]);
        let mut ingester = StreamIngester::push(fast_config(5, 10), source, |_frame| {});
        ingester.start().unwrap();
        assert!(ingester.start().is_err());
        ingester.stop().unwrap();
        assert!(ingester.start().is_err());
    }

    #[test]
    fn full_pull_buffer_sheds_oldest() {
        let buffer = Arc::new(FrameBuffer::new(2));
        let source = ScriptedSource::new(vec![Ok(5)]);
        let mut ingester =
            StreamIngester::pull(fast_config(1000, 1000), source, buffer.clone());
        ingester.start().unwrap();
        wait_for(|| ingester.stats().frames == 5);
        assert_eq!(buffer.len(), 2);
        assert_eq!(ingester.stats().frames_shed, 3);
        // ScriptedSource counts down, so the last two frames carry 1 then 0.
        assert_eq!(ingester.get_frame().unwrap().pixels()[0], 1);
        assert_eq!(ingester.get_frame().unwrap().pixels()[0], 0);
        ingester.stop().unwrap();
    }
}
