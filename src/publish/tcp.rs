//! Raw-frame stream over HTTP.
//!
//! A viewer sends `GET <mount>`; the server answers `200` and then writes one
//! record per emitted frame until either side goes away:
//!
//! ```text
//! "RLYF" | pts u64 | duration u64 | width u32 | height u32 | format u8 | pad [u8; 3]
//! payload_len u32 | pixels
//! ```
//!
//! All integers are little-endian.

use anyhow::{anyhow, Context, Result};
use std::io::{BufReader, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::clock::FrameTiming;
use super::pacer::{FramePacer, TimedFrame};
use super::{PublisherConfig, StreamSink};
use crate::error::RelayError;
use crate::frame::{Frame, PixelFormat};
use crate::shutdown::StopSignal;

pub const RECORD_MAGIC: [u8; 4] = *b"RLYF";
pub const RECORD_HEADER_LEN: usize = 32;
pub const CONTENT_TYPE: &str = "application/x-raw-frame-stream";

const MAX_REQUEST_BYTES: usize = 8192;
const MAX_PENDING: usize = 64;
const ACCEPT_POLL: Duration = Duration::from_millis(50);
const PENDING_POLL: Duration = Duration::from_millis(5);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);
const VIEWER_WRITE_TIMEOUT: Duration = Duration::from_millis(500);

struct Viewer {
    stream: TcpStream,
    peer: SocketAddr,
}

/// Accepted connection whose request has not fully arrived yet.
struct PendingViewer {
    stream: TcpStream,
    peer: SocketAddr,
    request: Vec<u8>,
    deadline: Instant,
}

enum Handshake {
    Waiting,
    Ready(HttpRequest),
    Closed,
}

impl PendingViewer {
    /// Read whatever the client has sent so far without blocking.
    fn poll(&mut self) -> Result<Handshake> {
        let mut buf = [0u8; 1024];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => return Ok(Handshake::Closed),
                Ok(n) => {
                    self.request.extend_from_slice(&buf[..n]);
                    if self.request.len() > MAX_REQUEST_BYTES {
                        return Err(anyhow!("request too large"));
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err).context("read viewer request"),
            }
        }
        if self.request.windows(4).any(|w| w == b"\r\n\r\n") {
            parse_request(&self.request).map(Handshake::Ready)
        } else {
            Ok(Handshake::Waiting)
        }
    }
}

pub struct TcpFrameSink {
    config: PublisherConfig,
    listener: Option<TcpListener>,
    pacer: Option<Arc<FramePacer>>,
    pending: Vec<PendingViewer>,
    viewers: Vec<Viewer>,
}

impl TcpFrameSink {
    pub fn new(config: PublisherConfig) -> Self {
        Self {
            config,
            listener: None,
            pacer: None,
            pending: Vec::new(),
            viewers: Vec::new(),
        }
    }

    /// Accept new connections and advance handshakes. Never waits on a client.
    fn accept_pending(&mut self, listener: &TcpListener) -> Result<()> {
        for _ in 0..MAX_PENDING {
            match listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(err) = stream.set_nonblocking(true) {
                        log::warn!("viewer {} rejected: {}", peer, err);
                        continue;
                    }
                    if self.pending.len() >= MAX_PENDING {
                        let oldest = self.pending.remove(0);
                        log::warn!("too many pending viewers; dropping {}", oldest.peer);
                    }
                    self.pending.push(PendingViewer {
                        stream,
                        peer,
                        request: Vec::new(),
                        deadline: Instant::now() + HANDSHAKE_TIMEOUT,
                    });
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err)
                    if matches!(
                        err.kind(),
                        std::io::ErrorKind::Interrupted | std::io::ErrorKind::ConnectionAborted
                    ) =>
                {
                    continue
                }
                Err(err) => return Err(err).context("accept viewer connection"),
            }
        }
        self.poll_handshakes();
        Ok(())
    }

    fn poll_handshakes(&mut self) {
        let now = Instant::now();
        for mut pending in std::mem::take(&mut self.pending) {
            match pending.poll() {
                Ok(Handshake::Waiting) if now >= pending.deadline => {
                    log::debug!(
                        "viewer {} sent no request within {:?}",
                        pending.peer,
                        HANDSHAKE_TIMEOUT
                    );
                }
                Ok(Handshake::Waiting) => self.pending.push(pending),
                Ok(Handshake::Closed) => {}
                Ok(Handshake::Ready(request)) => {
                    let peer = pending.peer;
                    match self.handshake(pending.stream, request) {
                        Ok(Some(stream)) => {
                            log::info!("viewer {} connected", peer);
                            self.viewers.push(Viewer { stream, peer });
                        }
                        Ok(None) => {}
                        Err(err) => log::warn!("viewer {} rejected: {:#}", peer, err),
                    }
                }
                Err(err) => log::warn!("viewer {} rejected: {:#}", pending.peer, err),
            }
        }
    }

    fn handshake(&self, mut stream: TcpStream, request: HttpRequest) -> Result<Option<TcpStream>> {
        stream.set_nonblocking(false)?;
        stream.set_write_timeout(Some(VIEWER_WRITE_TIMEOUT))?;
        if request.method != "GET" {
            write_response(&mut stream, 405, "method not allowed\n")?;
            return Ok(None);
        }
        if request.path != self.config.normalized_mount() {
            write_response(&mut stream, 404, "not found\n")?;
            return Ok(None);
        }
        stream.set_nodelay(true)?;
        let header = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
            CONTENT_TYPE
        );
        stream.write_all(header.as_bytes())?;
        Ok(Some(stream))
    }

    fn emit(&mut self, pacer: &FramePacer) {
        let Some(timed) = pacer.on_need_data() else {
            return;
        };
        let header = encode_header(&timed);
        let pixels = timed.frame.pixels();
        self.viewers.retain_mut(|viewer| {
            let sent = viewer
                .stream
                .write_all(&header)
                .and_then(|_| viewer.stream.write_all(pixels));
            match sent {
                Ok(()) => true,
                Err(err) => {
                    pacer.record_push_failure();
                    let err = RelayError::Publish {
                        sink: "tcp".to_string(),
                        reason: format!("viewer {}: {}", viewer.peer, err),
                    };
                    log::warn!("{}; dropping viewer", err);
                    false
                }
            }
        });
    }
}

impl StreamSink for TcpFrameSink {
    fn name(&self) -> &'static str {
        "tcp"
    }

    fn bind(&mut self, pacer: Arc<FramePacer>) -> Result<SocketAddr> {
        let listener = TcpListener::bind((self.config.listen_address.as_str(), self.config.port))
            .with_context(|| {
                format!(
                    "bind {}:{}",
                    self.config.listen_address, self.config.port
                )
            })?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;
        self.listener = Some(listener);
        self.pacer = Some(pacer);
        Ok(addr)
    }

    fn service(&mut self, stop: &StopSignal) -> Result<()> {
        let listener = self
            .listener
            .take()
            .ok_or_else(|| anyhow!("tcp sink is not bound"))?;
        let pacer = self
            .pacer
            .clone()
            .ok_or_else(|| anyhow!("tcp sink is not bound"))?;
        let interval = Duration::from_nanos(pacer.frame_duration());
        let mut next_tick = Instant::now() + interval;

        let result = loop {
            if let Err(err) = self.accept_pending(&listener) {
                break Err(err);
            }
            let now = Instant::now();
            if now >= next_tick {
                // No viewers means nobody pulls; the clock only moves on emission.
                if !self.viewers.is_empty() {
                    self.emit(&pacer);
                }
                next_tick += interval;
                if next_tick < now {
                    next_tick = now + interval;
                }
            }
            pacer.set_viewers(self.viewers.len());
            let poll = if self.pending.is_empty() {
                ACCEPT_POLL
            } else {
                PENDING_POLL
            };
            let wait = next_tick.saturating_duration_since(Instant::now()).min(poll);
            if stop.sleep(wait) {
                break Ok(());
            }
        };
        self.listener = Some(listener);
        result
    }

    fn release(&mut self) {
        self.pending.clear();
        for viewer in self.viewers.drain(..) {
            let _ = viewer.stream.shutdown(Shutdown::Both);
        }
        self.listener = None;
        if let Some(pacer) = &self.pacer {
            pacer.set_viewers(0);
        }
    }
}

/// Record header plus the payload length that follows it.
pub fn encode_header(timed: &TimedFrame) -> [u8; RECORD_HEADER_LEN + 4] {
    let mut out = [0u8; RECORD_HEADER_LEN + 4];
    out[0..4].copy_from_slice(&RECORD_MAGIC);
    out[4..12].copy_from_slice(&timed.timing.pts.to_le_bytes());
    out[12..20].copy_from_slice(&timed.timing.duration.to_le_bytes());
    out[20..24].copy_from_slice(&timed.frame.width().to_le_bytes());
    out[24..28].copy_from_slice(&timed.frame.height().to_le_bytes());
    out[28] = timed.frame.format().wire_code();
    let len = timed.frame.byte_len() as u32;
    out[32..36].copy_from_slice(&len.to_le_bytes());
    out
}

pub fn read_record<R: Read>(reader: &mut R) -> Result<TimedFrame> {
    let mut header = [0u8; RECORD_HEADER_LEN + 4];
    reader.read_exact(&mut header).context("read frame header")?;
    if header[0..4] != RECORD_MAGIC {
        return Err(anyhow!("bad frame magic {:?}", &header[0..4]));
    }
    let pts = u64::from_le_bytes(le_array(&header[4..12])?);
    let duration = u64::from_le_bytes(le_array(&header[12..20])?);
    let width = u32::from_le_bytes(le_array(&header[20..24])?);
    let height = u32::from_le_bytes(le_array(&header[24..28])?);
    let format = PixelFormat::from_wire_code(header[28])
        .ok_or_else(|| anyhow!("unknown pixel format code {}", header[28]))?;
    let len = u32::from_le_bytes(le_array(&header[32..36])?) as usize;
    let expected = (width as usize)
        .checked_mul(height as usize)
        .and_then(|n| n.checked_mul(format.bytes_per_pixel()))
        .ok_or_else(|| anyhow!("frame {}x{} is too large", width, height))?;
    if len != expected {
        return Err(anyhow!(
            "payload of {} bytes does not match {}x{} {} ({} bytes)",
            len,
            width,
            height,
            format,
            expected
        ));
    }
    let mut pixels = vec![0u8; len];
    reader.read_exact(&mut pixels).context("read frame payload")?;
    let frame = Frame::new(pixels, width, height, format)?;
    Ok(TimedFrame {
        frame,
        timing: FrameTiming {
            pts,
            dts: pts,
            duration,
            offset: pts,
        },
    })
}

fn le_array<const N: usize>(bytes: &[u8]) -> Result<[u8; N]> {
    bytes
        .try_into()
        .map_err(|_| anyhow!("expected {} bytes, got {}", N, bytes.len()))
}

/// Viewer side of the raw-frame stream.
pub struct FrameStreamClient {
    reader: BufReader<TcpStream>,
}

impl FrameStreamClient {
    pub fn connect(addr: SocketAddr, mount_path: &str, timeout: Duration) -> Result<Self> {
        let mut stream = TcpStream::connect_timeout(&addr, timeout)
            .with_context(|| format!("connect to {}", addr))?;
        stream.set_read_timeout(Some(timeout))?;
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nAccept: {}\r\n\r\n",
            mount_path, addr, CONTENT_TYPE
        );
        stream.write_all(request.as_bytes())?;
        let mut reader = BufReader::new(stream);
        let status = read_response_head(&mut reader)?;
        if status != 200 {
            return Err(anyhow!("stream request for {} returned {}", mount_path, status));
        }
        Ok(Self { reader })
    }

    pub fn next_frame(&mut self) -> Result<TimedFrame> {
        read_record(&mut self.reader)
    }
}

/// Read the status line and headers; returns the status code.
pub fn read_response_head<R: Read>(reader: &mut R) -> Result<u16> {
    let mut data = Vec::new();
    let mut byte = [0u8; 1];
    while !data.ends_with(b"\r\n\r\n") {
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("response head too large"));
        }
        if reader.read(&mut byte)? == 0 {
            return Err(anyhow!("connection closed before response head"));
        }
        data.push(byte[0]);
    }
    let text = String::from_utf8_lossy(&data);
    let status_line = text.lines().next().ok_or_else(|| anyhow!("empty response"))?;
    status_line
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| anyhow!("missing status code"))?
        .parse::<u16>()
        .map_err(|e| anyhow!("bad status code in '{}': {}", status_line, e))
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
}

fn parse_request(data: &[u8]) -> Result<HttpRequest> {
    let text = String::from_utf8_lossy(data);
    let request_line = text.split("\r\n").next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
    })
}

fn write_response(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: text/plain\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body.as_bytes())?;
    Ok(())
}
