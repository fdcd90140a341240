use anyhow::Result;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::RelayError;
use crate::ingest::{RetryPolicy, RtspConfig};
use crate::process::{ProcessorConfig, ProcessorKind};
use crate::publish::{PublisherConfig, SinkKind};
use crate::relay::DeliveryMode;

const DEFAULT_RTSP_URL: &str = "rtsp://0.0.0.0:8553/stream";
const DEFAULT_RETRY_INTERVAL_SECS: f64 = 5.0;
const DEFAULT_MAX_RETRY_INTERVAL_SECS: f64 = 100.0;
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 1.5;
const DEFAULT_OUTPUT_ADDR: &str = "0.0.0.0";
const DEFAULT_OUTPUT_PORT: u16 = 8554;
const DEFAULT_OUTPUT_PATH: &str = "/live";
const DEFAULT_OUTPUT_FPS: u32 = 30;
const DEFAULT_OUTPUT_WIDTH: u32 = 640;
const DEFAULT_OUTPUT_HEIGHT: u32 = 480;
const DEFAULT_MODEL_PATH: &str = "model.onnx";
const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.4;
const DEFAULT_MIN_OBJECTS_FOR_ALERT: usize = 1;
const DEFAULT_BUFFER_CAPACITY: usize = 8;

/// Environment variable naming the optional JSON config file.
pub const CONFIG_ENV: &str = "RELAY_CONFIG";

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RelayConfigFile {
    input: Option<InputConfigFile>,
    output: Option<OutputConfigFile>,
    processing: Option<ProcessingConfigFile>,
    relay: Option<RelaySectionFile>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct InputConfigFile {
    url: Option<String>,
    retry_interval: Option<f64>,
    max_retry_interval: Option<f64>,
    retry_backoff_multiplier: Option<f64>,
    max_consecutive_failures: Option<u32>,
    latency_ms: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct OutputConfigFile {
    addr: Option<String>,
    port: Option<u16>,
    path: Option<String>,
    sink: Option<SinkKind>,
    fps: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ProcessingConfigFile {
    processor: Option<ProcessorKind>,
    model_path: Option<PathBuf>,
    confidence_threshold: Option<f32>,
    min_objects_for_alert: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RelaySectionFile {
    delivery: Option<DeliveryMode>,
    buffer_capacity: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub input: InputSettings,
    pub output: PublisherConfig,
    pub processor: ProcessorConfig,
    pub min_objects_for_alert: usize,
    pub delivery: DeliveryMode,
    pub buffer_capacity: usize,
}

#[derive(Debug, Clone)]
pub struct InputSettings {
    pub url: String,
    /// Seconds, validated into `RetryPolicy` by `retry_policy`.
    pub retry_interval: f64,
    pub max_retry_interval: f64,
    pub retry_backoff_multiplier: f64,
    /// Give up after this many consecutive failed connects. Unset retries forever.
    pub max_consecutive_failures: Option<u32>,
    pub latency_ms: u32,
}

impl InputSettings {
    pub fn retry_policy(&self) -> Result<RetryPolicy> {
        RetryPolicy::from_secs(
            self.retry_interval,
            self.max_retry_interval,
            self.retry_backoff_multiplier,
        )
        .map_err(|e| RelayError::Config(format!("{:#}", e)).into())
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self::from_file(RelayConfigFile::default())
    }
}

impl RelayConfig {
    /// File named by `RELAY_CONFIG` (if set), then environment overrides,
    /// then validation.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var(CONFIG_ENV).ok().filter(|p| !p.trim().is_empty());
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => RelayConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: RelayConfigFile) -> Self {
        let input = file.input.unwrap_or_default();
        let output = file.output.unwrap_or_default();
        let processing = file.processing.unwrap_or_default();
        let relay = file.relay.unwrap_or_default();

        let width = output.width.unwrap_or(DEFAULT_OUTPUT_WIDTH);
        let height = output.height.unwrap_or(DEFAULT_OUTPUT_HEIGHT);
        Self {
            input: InputSettings {
                url: input.url.unwrap_or_else(|| DEFAULT_RTSP_URL.to_string()),
                retry_interval: input.retry_interval.unwrap_or(DEFAULT_RETRY_INTERVAL_SECS),
                max_retry_interval: input
                    .max_retry_interval
                    .unwrap_or(DEFAULT_MAX_RETRY_INTERVAL_SECS),
                retry_backoff_multiplier: input
                    .retry_backoff_multiplier
                    .unwrap_or(DEFAULT_BACKOFF_MULTIPLIER),
                max_consecutive_failures: input.max_consecutive_failures,
                latency_ms: input.latency_ms.unwrap_or(0),
            },
            output: PublisherConfig {
                listen_address: output.addr.unwrap_or_else(|| DEFAULT_OUTPUT_ADDR.to_string()),
                port: output.port.unwrap_or(DEFAULT_OUTPUT_PORT),
                mount_path: output.path.unwrap_or_else(|| DEFAULT_OUTPUT_PATH.to_string()),
                fps: output.fps.unwrap_or(DEFAULT_OUTPUT_FPS),
                width,
                height,
                sink: output.sink.unwrap_or_default(),
                ..PublisherConfig::default()
            },
            processor: ProcessorConfig {
                kind: processing.processor.unwrap_or_default(),
                model_path: processing
                    .model_path
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_MODEL_PATH)),
                confidence_threshold: processing
                    .confidence_threshold
                    .unwrap_or(DEFAULT_CONFIDENCE_THRESHOLD),
                input_width: width,
                input_height: height,
            },
            min_objects_for_alert: processing
                .min_objects_for_alert
                .unwrap_or(DEFAULT_MIN_OBJECTS_FOR_ALERT),
            delivery: relay.delivery.unwrap_or_default(),
            buffer_capacity: relay.buffer_capacity.unwrap_or(DEFAULT_BUFFER_CAPACITY),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(url) = env_string("RTSP_URL") {
            self.input.url = url;
        }
        if let Some(v) = env_parse::<f64>("RETRY_INTERVAL")? {
            self.input.retry_interval = v;
        }
        if let Some(v) = env_parse::<f64>("MAX_RETRY_INTERVAL")? {
            self.input.max_retry_interval = v;
        }
        if let Some(v) = env_parse::<f64>("RETRY_BACKOFF_MULTIPLIER")? {
            self.input.retry_backoff_multiplier = v;
        }
        if let Some(addr) = env_string("RTSP_OUTPUT_ADDR") {
            self.output.listen_address = addr;
        }
        if let Some(port) = env_parse::<u16>("RTSP_OUTPUT_PORT")? {
            self.output.port = port;
        }
        if let Some(path) = env_string("RTSP_OUTPUT_PATH") {
            self.output.mount_path = path;
        }
        if let Some(sink) = env_parse::<SinkKind>("RTSP_OUTPUT_SINK")? {
            self.output.sink = sink;
        }
        if let Some(fps) = env_parse::<u32>("OUTPUT_FPS")? {
            self.output.fps = fps;
        }
        if let Some(width) = env_parse::<u32>("OUTPUT_WIDTH")? {
            self.output.width = width;
            self.processor.input_width = width;
        }
        if let Some(height) = env_parse::<u32>("OUTPUT_HEIGHT")? {
            self.output.height = height;
            self.processor.input_height = height;
        }
        if let Some(kind) = env_parse::<ProcessorKind>("PROCESSOR")? {
            self.processor.kind = kind;
        }
        if let Some(path) = env_string("MODEL_PATH") {
            self.processor.model_path = PathBuf::from(path);
        }
        if let Some(v) = env_parse::<f32>("CONFIDENCE_THRESHOLD")? {
            self.processor.confidence_threshold = v;
        }
        if let Some(v) = env_parse::<usize>("MIN_OBJECTS_FOR_ALERT")? {
            self.min_objects_for_alert = v;
        }
        if let Some(mode) = env_parse::<DeliveryMode>("RELAY_DELIVERY")? {
            self.delivery = mode;
        }
        if let Some(v) = env_parse::<usize>("FRAME_BUFFER_CAPACITY")? {
            self.buffer_capacity = v;
        }
        Ok(())
    }

    pub fn validate(&mut self) -> Result<()> {
        if self.input.url.trim().is_empty() {
            return Err(RelayError::Config("input url is empty".to_string()).into());
        }
        self.input.retry_policy()?;
        self.output
            .validate()
            .map_err(|e| RelayError::Config(format!("{:#}", e)))?;
        self.output.mount_path = self.output.normalized_mount();
        if !(0.0..=1.0).contains(&self.processor.confidence_threshold) {
            return Err(RelayError::Config(format!(
                "CONFIDENCE_THRESHOLD must be within 0..=1 (got {})",
                self.processor.confidence_threshold
            ))
            .into());
        }
        if self.buffer_capacity == 0 {
            return Err(
                RelayError::Config("FRAME_BUFFER_CAPACITY must be at least 1".to_string()).into(),
            );
        }
        Ok(())
    }

    /// Decode settings for the upstream source, matched to the output size.
    pub fn source_config(&self) -> RtspConfig {
        RtspConfig {
            target_fps: self.output.fps,
            width: self.output.width,
            height: self.output.height,
            latency_ms: self.input.latency_ms,
        }
    }

    pub fn join_timeout(&self) -> Duration {
        self.output.join_timeout
    }
}

fn read_config_file(path: &Path) -> Result<RelayConfigFile> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        RelayError::Config(format!(
            "failed to read config file {}: {}",
            path.display(),
            e
        ))
    })?;
    let cfg = serde_json::from_str(&raw).map_err(|e| {
        RelayError::Config(format!("invalid config file {}: {}", path.display(), e))
    })?;
    Ok(cfg)
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env_string(key) {
        None => Ok(None),
        Some(raw) => raw.parse::<T>().map(Some).map_err(|e| {
            RelayError::Config(format!("{} has invalid value '{}': {}", key, raw, e)).into()
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = RelayConfig::default();
        assert_eq!(cfg.input.url, "rtsp://0.0.0.0:8553/stream");
        assert_eq!(cfg.input.retry_interval, 5.0);
        assert_eq!(cfg.input.max_retry_interval, 100.0);
        assert_eq!(cfg.input.retry_backoff_multiplier, 1.5);
        assert_eq!(cfg.output.listen_address, "0.0.0.0");
        assert_eq!(cfg.output.port, 8554);
        assert_eq!(cfg.output.mount_path, "/live");
        assert_eq!(cfg.output.sink, SinkKind::Tcp);
        assert_eq!(cfg.output.fps, 30);
        assert_eq!((cfg.output.width, cfg.output.height), (640, 480));
        assert_eq!(cfg.processor.kind, ProcessorKind::None);
        assert_eq!(cfg.processor.model_path, PathBuf::from("model.onnx"));
        assert_eq!(cfg.processor.confidence_threshold, 0.4);
        assert_eq!(cfg.min_objects_for_alert, 1);
        assert_eq!(cfg.delivery, DeliveryMode::Buffered);
        assert_eq!(cfg.buffer_capacity, 8);
    }

    #[test]
    fn validate_rejects_bad_retry_policy() {
        let mut cfg = RelayConfig::default();
        cfg.input.retry_backoff_multiplier = 0.5;
        let err = cfg.validate().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RelayError>(),
            Some(RelayError::Config(_))
        ));
    }

    #[test]
    fn validate_normalizes_mount_path() {
        let mut cfg = RelayConfig::default();
        cfg.output.mount_path = "cam".to_string();
        cfg.validate().unwrap();
        assert_eq!(cfg.output.mount_path, "/cam");
    }

    #[test]
    fn validate_rejects_threshold_out_of_range() {
        let mut cfg = RelayConfig::default();
        cfg.processor.confidence_threshold = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn source_follows_output_geometry() {
        let mut cfg = RelayConfig::default();
        cfg.output.width = 320;
        cfg.output.fps = 12;
        let src = cfg.source_config();
        assert_eq!(src.width, 320);
        assert_eq!(src.target_fps, 12);
    }
}
