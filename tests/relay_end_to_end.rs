use std::time::{Duration, Instant};

use rtsp_relay::process::{MotionProcessor, ProcessedFrame};
use rtsp_relay::publish::{FrameStreamClient, TcpFrameSink};
use rtsp_relay::{
    DeliveryMode, Frame, FrameProcessor, PixelFormat, Relay, RelayConfig, RtspSource,
};

fn loopback_config(url: &str, delivery: DeliveryMode) -> RelayConfig {
    let mut config = RelayConfig::default();
    config.input.url = url.to_string();
    config.input.retry_interval = 0.02;
    config.input.max_retry_interval = 0.1;
    config.output.listen_address = "127.0.0.1".to_string();
    config.output.port = 0;
    config.output.fps = 25;
    config.output.width = 16;
    config.output.height = 8;
    config.delivery = delivery;
    config
}

fn relay_with(config: RelayConfig, processor: Option<Box<dyn FrameProcessor>>) -> Relay {
    let source = Box::new(RtspSource::new(config.source_config()));
    let sink = Box::new(TcpFrameSink::new(config.output.clone()));
    Relay::new(config, source, sink, processor).expect("relay")
}

#[test]
fn relay_survives_upstream_reconnects_with_uniform_output_clock() {
    // Every session ends after 5 frames and the first two connects fail.
    let config = loopback_config(
        "stub://gate?fail_connects=2&session_frames=5",
        DeliveryMode::Buffered,
    );
    let mut relay = relay_with(config, Some(Box::new(MotionProcessor::new())));
    let addr = relay.start().expect("start");

    let mut viewer = FrameStreamClient::connect(addr, "/live", Duration::from_secs(5)).unwrap();
    let mut last = viewer.next_frame().unwrap();
    for _ in 0..20 {
        let next = viewer.next_frame().unwrap();
        assert_eq!(next.timing.pts - last.timing.pts, 40_000_000);
        assert_eq!(next.timing.duration, 40_000_000);
        last = next;
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    while relay.stats().ingest.sessions < 2 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }
    let stats = relay.stats();
    assert!(stats.ingest.connect_failures >= 2);
    assert!(stats.ingest.sessions >= 2);

    relay.stop().expect("stop");
}

#[test]
fn stop_releases_port_for_a_new_relay() {
    let mut first = relay_with(
        loopback_config("stub://a", DeliveryMode::Callback),
        None,
    );
    let addr = first.start().expect("start first");
    first.stop().expect("stop first");

    let mut config = loopback_config("stub://b", DeliveryMode::Callback);
    config.output.port = addr.port();
    let mut second = relay_with(config, None);
    let rebound = second.start().expect("rebind same port");
    assert_eq!(rebound.port(), addr.port());
    second.stop().expect("stop second");
}

struct Exploding;

impl FrameProcessor for Exploding {
    fn name(&self) -> &'static str {
        "exploding"
    }

    fn process(&mut self, _frame: &Frame) -> anyhow::Result<ProcessedFrame> {
        panic!("model crashed");
    }
}

#[test]
fn crashing_processor_never_blacks_out_video() {
    let config = loopback_config("stub://dock?pattern=solid", DeliveryMode::Callback);
    let mut relay = relay_with(config, Some(Box::new(Exploding)));
    let addr = relay.start().expect("start");

    let mut viewer = FrameStreamClient::connect(addr, "/live", Duration::from_secs(5)).unwrap();
    for _ in 0..3 {
        let timed = viewer.next_frame().unwrap();
        assert_eq!(timed.frame.format(), PixelFormat::Rgb);
        assert_eq!((timed.frame.width(), timed.frame.height()), (16, 8));
    }
    relay.stop().expect("stop");

    let stats = relay.stats();
    assert!(stats.processing.failures >= 1);
    assert_eq!(stats.processing.failures, stats.processing.frames);
    assert_eq!(stats.alerts, 0);
}
