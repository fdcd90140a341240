use std::sync::Arc;
use std::time::{Duration, Instant};

use rtsp_relay::ingest::IngesterConfig;
use rtsp_relay::{FrameBuffer, RetryPolicy, RtspConfig, RtspSource, StreamIngester};

fn small_source() -> RtspSource {
    RtspSource::new(RtspConfig {
        target_fps: 100,
        width: 8,
        height: 4,
        latency_ms: 0,
    })
}

fn config(url: &str) -> IngesterConfig {
    let retry = RetryPolicy::new(Duration::from_millis(10), Duration::from_millis(40), 2.0)
        .expect("retry policy");
    IngesterConfig::new(url, retry)
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

#[test]
fn refused_connects_are_retried_until_frames_flow() {
    let buffer = Arc::new(FrameBuffer::new(4));
    let mut ingester = StreamIngester::pull(
        config("stub://door?fail_connects=3"),
        small_source(),
        buffer.clone(),
    );
    ingester.start().expect("start");

    let frame = buffer
        .get_timeout(Duration::from_secs(5))
        .expect("frame after reconnects");
    assert_eq!((frame.width(), frame.height()), (8, 4));

    let stats = ingester.stats();
    assert_eq!(stats.connect_failures, 3);
    assert!(stats.connect_attempts >= 4);
    assert_eq!(stats.sessions, 1);
    assert!(stats
        .last_error
        .as_deref()
        .is_some_and(|e| e.contains("refused")));

    ingester.stop().expect("stop");
    assert!(!ingester.is_running());
}

#[test]
fn ended_sessions_reconnect_without_counting_failures() {
    let buffer = Arc::new(FrameBuffer::new(64));
    let mut ingester = StreamIngester::pull(
        config("stub://yard?session_frames=2"),
        small_source(),
        buffer.clone(),
    );
    ingester.start().expect("start");

    assert!(wait_until(Duration::from_secs(5), || ingester.stats().sessions >= 3));
    let stats = ingester.stats();
    assert_eq!(stats.connect_failures, 0);
    assert!(stats.frames >= 4);

    ingester.stop().expect("stop");
}

#[test]
fn failure_limit_stops_ingest_and_reports_it() {
    let buffer = Arc::new(FrameBuffer::new(4));
    let mut cfg = config("stub://void?fail_connects=1000");
    cfg.max_consecutive_failures = Some(3);
    let mut ingester = StreamIngester::pull(cfg, small_source(), buffer.clone());
    ingester.start().expect("start");

    assert!(wait_until(Duration::from_secs(5), || ingester.stats().gave_up));
    let stats = ingester.stats();
    assert_eq!(stats.connect_failures, 3);
    assert_eq!(stats.frames, 0);
    assert!(buffer.is_empty());

    ingester.stop().expect("stop");
}
