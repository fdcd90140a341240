//! relay_inspect - check what this build can ingest and publish.
//!
//! Prints the compiled backends, then optionally:
//! - opens an upstream URL and reads a few frames (`--url`)
//! - connects to a running relayd raw-frame stream as a viewer (`--watch`)

use anyhow::{anyhow, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rtsp_relay::ingest::FrameSource;
use rtsp_relay::publish::FrameStreamClient;
use rtsp_relay::{redact_url, RtspConfig, RtspSource};

#[derive(Parser, Debug)]
#[command(author, version, about = "Inspect relay backends and streams")]
struct Args {
    /// Upstream URL to open and read from.
    #[arg(long)]
    url: Option<String>,

    /// Address of a relayd tcp sink to watch, e.g. 127.0.0.1:8554.
    #[arg(long)]
    watch: Option<SocketAddr>,

    /// Mount path used with --watch.
    #[arg(long, default_value = "/live")]
    path: String,

    /// Number of frames to read.
    #[arg(long, default_value_t = 10)]
    frames: u32,

    /// Per-operation timeout in seconds.
    #[arg(long, default_value_t = 10)]
    timeout: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    println!("relay_inspect {}", env!("CARGO_PKG_VERSION"));
    print_backends();

    if let Some(url) = &args.url {
        inspect_source(url, args.frames, Duration::from_secs(args.timeout))?;
    }
    if let Some(addr) = args.watch {
        watch_stream(addr, &args.path, args.frames, Duration::from_secs(args.timeout))?;
    }
    Ok(())
}

fn print_backends() {
    let flag = |on: bool| if on { "yes" } else { "no" };
    println!("ingest:");
    println!("  synthetic (stub://)  yes");
    println!(
        "  rtsp (gstreamer)     {}",
        flag(cfg!(feature = "rtsp-gstreamer"))
    );
    println!("publish:");
    println!("  tcp raw frames       yes");
    println!(
        "  rtsp server          {}",
        flag(cfg!(feature = "rtsp-server-gstreamer"))
    );
    println!("processing:");
    println!("  motion               yes");
    println!(
        "  tract (onnx)         {}",
        flag(cfg!(feature = "backend-tract"))
    );
    print_gstreamer_version();
}

#[cfg(feature = "rtsp-gstreamer")]
fn print_gstreamer_version() {
    match gstreamer::init() {
        Ok(()) => println!("gstreamer: {}", gstreamer::version_string()),
        Err(err) => println!("gstreamer: failed to initialize: {}", err),
    }
}

#[cfg(not(feature = "rtsp-gstreamer"))]
fn print_gstreamer_version() {}

fn inspect_source(url: &str, frames: u32, timeout: Duration) -> Result<()> {
    println!("\nopening {}", redact_url(url));
    RtspSource::supports(url)?;
    let mut source = RtspSource::new(RtspConfig::default());
    source.open(url)?;
    println!("  connected");

    let started = Instant::now();
    let mut read = 0u32;
    while read < frames {
        if started.elapsed() > timeout {
            source.release();
            return Err(anyhow!("timed out after {} of {} frames", read, frames));
        }
        match source.read() {
            Ok(Some(frame)) => {
                read += 1;
                println!(
                    "  frame {:>3}: {}x{} {} ({} bytes)",
                    read,
                    frame.width(),
                    frame.height(),
                    frame.format(),
                    frame.byte_len()
                );
            }
            Ok(None) => {
                println!("  stream ended after {} frames", read);
                break;
            }
            Err(err) => {
                source.release();
                return Err(err);
            }
        }
    }
    let elapsed = started.elapsed().as_secs_f64();
    if read > 0 && elapsed > 0.0 {
        println!("  {:.1} fps measured", read as f64 / elapsed);
    }
    source.release();
    Ok(())
}

fn watch_stream(addr: SocketAddr, path: &str, frames: u32, timeout: Duration) -> Result<()> {
    println!("\nwatching {}{}", addr, path);
    let mut client = FrameStreamClient::connect(addr, path, timeout)?;
    let mut last_pts: Option<u64> = None;
    for i in 1..=frames {
        let timed = client.next_frame()?;
        let step = last_pts.map(|prev| timed.timing.pts.saturating_sub(prev));
        println!(
            "  frame {:>3}: pts={}ns step={} {}x{} {}",
            i,
            timed.timing.pts,
            step.map_or("-".to_string(), |s| format!("{}ns", s)),
            timed.frame.width(),
            timed.frame.height(),
            timed.frame.format()
        );
        last_pts = Some(timed.timing.pts);
    }
    Ok(())
}
