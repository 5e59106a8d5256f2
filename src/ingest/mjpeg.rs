//! MJPEG-over-HTTP frame source.
//!
//! Handles `multipart/x-mixed-replace` streams (IP cameras, ESP32 boards) and
//! plain single-JPEG endpoints, which are re-fetched on every read.

use anyhow::{anyhow, Context, Result};
use std::io::{self, ErrorKind, Read};
use std::time::{Duration, Instant};

use super::normalize::decode_jpeg;
use super::SourceConfig;
use crate::frame::Frame;

const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

pub struct MjpegSource {
    config: SourceConfig,
    agent: ureq::Agent,
    stream: Option<HttpStream>,
    frame_count: u64,
}

enum HttpStream {
    Mjpeg(MjpegStream),
    SingleJpeg,
}

impl MjpegSource {
    pub fn new(config: SourceConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(CONNECT_TIMEOUT)
            .timeout_read(config.read_timeout)
            .build();
        Self {
            config,
            agent,
            stream: None,
            frame_count: 0,
        }
    }

    pub fn open(&mut self) -> Result<()> {
        let response = self
            .agent
            .get(&self.config.source)
            .call()
            .with_context(|| format!("connect to mjpeg stream {}", self.config.source))?;
        let content_type = response.header("Content-Type").unwrap_or("");
        let stream = if content_type.to_ascii_lowercase().contains("multipart") {
            HttpStream::Mjpeg(MjpegStream::new(
                response.into_reader(),
                self.config.read_timeout,
            ))
        } else {
            HttpStream::SingleJpeg
        };
        self.stream = Some(stream);
        log::info!("MjpegSource: connected to {}", self.config.source);
        Ok(())
    }

    pub fn read(&mut self) -> Result<Option<Frame>> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| anyhow!("mjpeg source {} not connected", self.config.source))?;
        let fetched = match stream {
            HttpStream::Mjpeg(stream) => stream.read_next_jpeg(),
            HttpStream::SingleJpeg => fetch_single_jpeg(&self.agent, &self.config.source),
        };
        let jpeg = match fetched {
            Ok(jpeg) => jpeg,
            Err(err) if is_timeout(&err) => return Ok(None),
            Err(err) => return Err(err),
        };

        let pixels = match decode_jpeg(&jpeg, self.config.width, self.config.height) {
            Ok(pixels) => pixels,
            Err(err) => {
                log::debug!("MjpegSource: dropping undecodable frame: {:#}", err);
                return Ok(None);
            }
        };
        self.frame_count += 1;
        Frame::from_rgb(
            pixels,
            self.config.width,
            self.config.height,
            self.frame_count,
        )
        .map(Some)
    }

    pub fn close(&mut self) {
        self.stream = None;
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    pub fn describe(&self) -> String {
        self.config.source.clone()
    }
}

fn is_timeout(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<std::io::Error>()
            .is_some_and(|io| matches!(io.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock))
    })
}

/// Splits a multipart byte stream into JPEGs by SOI/EOI markers.
///
/// Each call gives up with a `TimedOut` error once `frame_deadline` has passed
/// or `MAX_JPEG_BYTES * 2` bytes arrived without a complete JPEG. Partial data
/// stays buffered for the next call.
struct MjpegStream {
    reader: Box<dyn Read + Send + Sync>,
    buffer: Vec<u8>,
    frame_deadline: Duration,
}

impl MjpegStream {
    fn new(reader: Box<dyn Read + Send + Sync>, frame_deadline: Duration) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(64 * 1024),
            frame_deadline,
        }
    }

    fn read_next_jpeg(&mut self) -> Result<Vec<u8>> {
        let mut chunk = vec![0u8; 8192];
        let deadline = Instant::now() + self.frame_deadline;
        let mut received = 0usize;
        loop {
            if let Some((start, end)) = find_jpeg_bounds(&self.buffer) {
                let frame = self.buffer[start..end].to_vec();
                self.buffer.drain(..end);
                return Ok(frame);
            }

            let read = self.reader.read(&mut chunk).context("read mjpeg chunk")?;
            if read == 0 {
                return Err(anyhow!("mjpeg stream ended"));
            }
            self.buffer.extend_from_slice(&chunk[..read]);
            received += read;

            if self.buffer.len() > MAX_JPEG_BYTES * 2 {
                let drain_len = self.buffer.len() - 2;
                self.buffer.drain(..drain_len);
            }
            if received > MAX_JPEG_BYTES * 2 || Instant::now() >= deadline {
                return Err(anyhow::Error::new(io::Error::new(
                    ErrorKind::TimedOut,
                    format!("no complete jpeg after {} bytes", received),
                )));
            }
        }
    }
}

fn fetch_single_jpeg(agent: &ureq::Agent, url: &str) -> Result<Vec<u8>> {
    let response = agent
        .get(url)
        .call()
        .with_context(|| format!("fetch jpeg from {}", url))?;
    let mut bytes = Vec::new();
    response
        .into_reader()
        .take(MAX_JPEG_BYTES as u64)
        .read_to_end(&mut bytes)
        .context("read jpeg body")?;
    if bytes.is_empty() {
        return Err(anyhow!("empty jpeg body from {}", url));
    }
    Ok(bytes)
}

fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = buffer.windows(2).position(|w| w == [0xFF, 0xD8])?;
    let end = buffer[start + 2..]
        .windows(2)
        .position(|w| w == [0xFF, 0xD9])?;
    Some((start, start + 2 + end + 2))
}
