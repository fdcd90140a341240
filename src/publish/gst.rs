//! RTSP server sink backed by gst-rtsp-server.
//!
//! Each media built by the shared factory feeds its `source` appsrc from the
//! pacer inside `need-data`, so GStreamer decides the cadence and the pacer
//! decides the timestamps.

use anyhow::{anyhow, Context, Result};
use gstreamer as gst;
use gstreamer::glib;
use gstreamer::prelude::*;
use gstreamer_rtsp_server as rtsp_server;
use gstreamer_rtsp_server::prelude::*;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use super::pacer::FramePacer;
use super::{PublisherConfig, StreamSink};
use crate::error::RelayError;
use crate::frame::Frame;
use crate::shutdown::StopSignal;

const STOP_POLL: Duration = Duration::from_millis(50);

struct Bound {
    server: rtsp_server::RTSPServer,
    context: glib::MainContext,
    source_id: glib::SourceId,
}

pub struct GstRtspSink {
    config: PublisherConfig,
    bound: Option<Bound>,
}

impl GstRtspSink {
    pub fn new(config: PublisherConfig) -> Self {
        Self {
            config,
            bound: None,
        }
    }

    fn build_factory(&self, pacer: Arc<FramePacer>) -> rtsp_server::RTSPMediaFactory {
        let factory = rtsp_server::RTSPMediaFactory::new();
        factory.set_launch(&self.config.pipeline_description());
        factory.set_shared(true);

        let (width, height, format) = (self.config.width, self.config.height, self.config.format);
        factory.connect_media_configure(move |_factory, media| {
            let element = media.element();
            let Some(bin) = element.downcast_ref::<gst::Bin>() else {
                log::error!("rtsp media element is not a bin");
                return;
            };
            let Some(appsrc) = bin
                .by_name_recurse_up("source")
                .and_then(|e| e.downcast::<gstreamer_app::AppSrc>().ok())
            else {
                log::error!("rtsp media has no appsrc named 'source'");
                return;
            };
            let pacer = pacer.clone();
            appsrc.set_callbacks(
                gstreamer_app::AppSrcCallbacks::builder()
                    .need_data(move |appsrc, _| {
                        let Some(timed) = pacer.on_need_data() else {
                            return;
                        };
                        let frame = &timed.frame;
                        if frame.width() != width
                            || frame.height() != height
                            || frame.format() != format
                        {
                            pacer.record_push_failure();
                            log::warn!(
                                "{}",
                                RelayError::Publish {
                                    sink: "gstreamer".to_string(),
                                    reason: format!(
                                        "frame {}x{} {} does not match output caps {}x{} {}",
                                        frame.width(),
                                        frame.height(),
                                        frame.format(),
                                        width,
                                        height,
                                        format
                                    ),
                                }
                            );
                            return;
                        }
                        let mut buffer = gst::Buffer::from_slice(FrameBytes(timed.frame.clone()));
                        if let Some(buffer_ref) = buffer.get_mut() {
                            buffer_ref.set_pts(gst::ClockTime::from_nseconds(timed.timing.pts));
                            buffer_ref.set_dts(gst::ClockTime::from_nseconds(timed.timing.dts));
                            buffer_ref
                                .set_duration(gst::ClockTime::from_nseconds(timed.timing.duration));
                            buffer_ref.set_offset(timed.timing.offset);
                        }
                        if let Err(err) = appsrc.push_buffer(buffer) {
                            pacer.record_push_failure();
                            log::error!(
                                "{}",
                                RelayError::Publish {
                                    sink: "gstreamer".to_string(),
                                    reason: format!("push buffer: {:?}", err),
                                }
                            );
                        }
                    })
                    .build(),
            );
        });
        factory
    }
}

/// Lets a gst buffer borrow the frame's shared pixels without a copy.
struct FrameBytes(Frame);

impl AsRef<[u8]> for FrameBytes {
    fn as_ref(&self) -> &[u8] {
        self.0.pixels()
    }
}

impl StreamSink for GstRtspSink {
    fn name(&self) -> &'static str {
        "gstreamer"
    }

    fn bind(&mut self, pacer: Arc<FramePacer>) -> Result<SocketAddr> {
        gst::init().context("initialize gstreamer")?;

        let server = rtsp_server::RTSPServer::new();
        server.set_address(&self.config.listen_address);
        server.set_service(&self.config.port.to_string());
        let mounts = server
            .mount_points()
            .ok_or_else(|| anyhow!("rtsp server has no mount points"))?;
        mounts.add_factory(&self.config.normalized_mount(), self.build_factory(pacer));

        let context = glib::MainContext::new();
        let source_id = server.attach(Some(&context)).with_context(|| {
            format!(
                "bind rtsp server on {}:{}",
                self.config.listen_address, self.config.port
            )
        })?;
        let port = u16::try_from(server.bound_port())
            .map_err(|_| anyhow!("rtsp server reported no bound port"))?;
        let ip: IpAddr = self
            .config
            .listen_address
            .parse()
            .unwrap_or(IpAddr::from([0, 0, 0, 0]));

        log::info!(
            "rtsp server ready at rtsp://{}:{}{}",
            self.config.listen_address,
            port,
            self.config.normalized_mount()
        );
        self.bound = Some(Bound {
            server,
            context,
            source_id,
        });
        Ok(SocketAddr::new(ip, port))
    }

    fn service(&mut self, stop: &StopSignal) -> Result<()> {
        let bound = self
            .bound
            .as_ref()
            .ok_or_else(|| anyhow!("rtsp server is not bound"))?;
        let main_loop = glib::MainLoop::new(Some(&bound.context), false);
        let quit = main_loop.clone();
        let stop = stop.clone();
        let watch = glib::timeout_source_new(STOP_POLL, None, glib::Priority::DEFAULT, move || {
            if stop.is_stopped() {
                quit.quit();
                glib::ControlFlow::Break
            } else {
                glib::ControlFlow::Continue
            }
        });
        watch.attach(Some(&bound.context));
        main_loop.run();
        Ok(())
    }

    fn release(&mut self) {
        let Some(bound) = self.bound.take() else {
            return;
        };
        let _ = bound
            .server
            .client_filter(Some(&mut |_, _| rtsp_server::RTSPFilterResult::Remove));
        bound.source_id.remove();
        while bound.context.iteration(false) {}
        log::info!("rtsp server released");
    }
}
