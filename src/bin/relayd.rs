//! relayd - RTSP frame relay daemon
//!
//! This daemon:
//! 1. Binds the outbound stream listener (fatal if the port is taken)
//! 2. Connects to the upstream stream, reconnecting with backoff forever
//! 3. Runs the configured processor on every frame
//! 4. Re-publishes frames at a fixed rate until Ctrl-C

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::Duration;

use rtsp_relay::{redact_url, Relay, RelayConfig};

#[derive(Parser, Debug)]
#[command(author, version, about = "Relay a live RTSP stream to local viewers")]
struct Args {
    /// JSON config file. Environment variables override its values.
    #[arg(long, env = "RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Upstream URL (overrides RTSP_URL). `stub://name` runs a synthetic source.
    #[arg(long)]
    url: Option<String>,

    /// Outbound port (overrides RTSP_OUTPUT_PORT).
    #[arg(long)]
    port: Option<u16>,

    /// Seconds between stats lines.
    #[arg(long, env = "RELAY_STATS_INTERVAL", default_value_t = 5)]
    stats_interval: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut config = RelayConfig::load_from(args.config.as_deref())?;
    if let Some(url) = args.url {
        config.input.url = url;
    }
    if let Some(port) = args.port {
        config.output.port = port;
    }
    config.validate()?;

    log::info!(
        "relayd {} starting: {} -> {}",
        env!("CARGO_PKG_VERSION"),
        redact_url(&config.input.url),
        config.output.endpoint()
    );

    let mut relay = Relay::from_config(config)?;
    let addr = relay.start().context("relay failed to start")?;
    log::info!("relayd serving on {}", addr);

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    log::info!("relayd waiting for shutdown signal (Ctrl-C)...");
    let interval = Duration::from_secs(args.stats_interval.max(1));
    let mut gave_up = false;
    loop {
        match rx.recv_timeout(interval) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                log::info!("stats: {}", relay.stats());
                if relay.ingest_gave_up() {
                    gave_up = true;
                    break;
                }
            }
        }
    }

    log::info!("shutting down relay...");
    relay.stop()?;
    if gave_up {
        return Err(anyhow!("upstream connect failure limit reached"));
    }
    Ok(())
}
