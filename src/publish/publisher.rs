use anyhow::{anyhow, Result};
use std::net::SocketAddr;
use std::sync::Arc;

use super::pacer::{FramePacer, PublisherStats};
use super::{build_sink, PublisherConfig, StreamSink};
use crate::error::RelayError;
use crate::frame::Frame;
use crate::shutdown::{StopSignal, Worker};

/// Owns the outbound sink and the thread that services it.
pub struct StreamPublisher {
    config: PublisherConfig,
    pacer: Arc<FramePacer>,
    sink: Option<Box<dyn StreamSink>>,
    stop: StopSignal,
    worker: Option<Worker>,
    local_addr: Option<SocketAddr>,
}

impl StreamPublisher {
    pub fn new(config: PublisherConfig, sink: Box<dyn StreamSink>) -> Result<Self> {
        config.validate()?;
        let pacer = Arc::new(FramePacer::new(config.fps)?);
        Ok(Self {
            config,
            pacer,
            sink: Some(sink),
            stop: StopSignal::new(),
            worker: None,
            local_addr: None,
        })
    }

    /// Publisher with the sink selected by `config.sink`.
    pub fn from_config(config: PublisherConfig) -> Result<Self> {
        let sink = build_sink(&config)?;
        Self::new(config, sink)
    }

    /// Bind the listener and start serving. A bind failure is fatal.
    pub fn start(&mut self) -> Result<SocketAddr> {
        if self.worker.is_some() {
            return Err(anyhow!("publisher already running"));
        }
        let mut sink = self
            .sink
            .take()
            .ok_or_else(|| anyhow!("publisher cannot be restarted after stop"))?;
        let name = sink.name();
        let addr = match sink.bind(self.pacer.clone()) {
            Ok(addr) => addr,
            Err(err) => {
                self.sink = Some(sink);
                return Err(RelayError::Startup(format!(
                    "{} sink could not listen on {}: {:#}",
                    name,
                    self.config.endpoint(),
                    err
                ))
                .into());
            }
        };

        let stop = self.stop.clone();
        let worker = Worker::spawn("relay-publish", move |_notice| {
            if let Err(err) = sink.service(&stop) {
                log::error!(
                    "{}",
                    RelayError::Publish {
                        sink: name.to_string(),
                        reason: format!("service loop failed: {:#}", err),
                    }
                );
            }
            sink.release();
        })?;
        self.worker = Some(worker);
        self.local_addr = Some(addr);
        log::info!("publishing {} sink on {}", name, addr);
        Ok(addr)
    }

    /// Candidate for the next tick. Never waits on the sink.
    pub fn push_frame(&self, frame: Frame) {
        self.pacer.push_frame(frame);
    }

    /// Stop serving and wait until the listener has been released.
    pub fn stop(&mut self) -> Result<()> {
        self.stop.stop();
        match self.worker.take() {
            Some(worker) => worker.join_within(self.config.join_timeout),
            None => Ok(()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn pacer(&self) -> &Arc<FramePacer> {
        &self.pacer
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.config
    }

    pub fn stats(&self) -> PublisherStats {
        self.pacer.stats()
    }
}

impl Drop for StreamPublisher {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            log::warn!("publisher shutdown: {:#}", err);
        }
    }
}
