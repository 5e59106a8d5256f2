//! Frame ingestion sources.
//!
//! Every camera worker owns exactly one [`FrameSource`]. Sources come in three
//! flavours, selected from the configured source string:
//! - `stub://name?pattern=...`: synthetic frames for tests and bench runs
//! - `http(s)://...`: MJPEG over HTTP (IP cameras, ESP32 boards)
//! - `0`, `/dev/video0`: local V4L2 devices (feature: ingest-v4l2)
//!
//! Sources never decide when to retry. Open failures and stalls are reported
//! to the worker, which paces reconnects with [`ReconnectState`].

mod mjpeg;
mod normalize;
mod reconnect;
mod synthetic;
#[cfg(feature = "ingest-v4l2")]
mod v4l2;

use anyhow::{anyhow, Result};
use std::time::Duration;

use crate::config::CameraConfig;
use crate::frame::Frame;

pub use mjpeg::MjpegSource;
pub use reconnect::{ReconnectPolicy, ReconnectState};
pub use synthetic::{SyntheticPattern, SyntheticSource};
#[cfg(feature = "ingest-v4l2")]
pub use v4l2::V4l2Source;

/// One physical (or synthetic) camera.
pub trait FrameSource: Send {
    /// Acquire the device. Failure is non-fatal; the caller retries later.
    fn open(&mut self) -> Result<()>;

    /// Next frame, or `Ok(None)` if the device stalled or the frame was
    /// undecodable. Never blocks longer than the source's read timeout.
    fn read(&mut self) -> Result<Option<Frame>>;

    /// Release the device. Safe to call when already closed.
    fn close(&mut self);

    fn is_open(&self) -> bool;

    /// Human-readable source identifier for logs.
    fn describe(&self) -> String;
}

/// Parameters every source backend needs.
#[derive(Clone, Debug)]
pub struct SourceConfig {
    pub source: String,
    pub width: u32,
    pub height: u32,
    pub target_fps: u32,
    pub read_timeout: Duration,
}

impl SourceConfig {
    pub fn for_camera(camera: &CameraConfig) -> Self {
        Self {
            source: camera.source.clone(),
            width: camera.width,
            height: camera.height,
            target_fps: camera.target_fps,
            read_timeout: read_timeout(camera.target_fps),
        }
    }
}

/// Source chosen from the configured source string.
pub struct CameraSource {
    backend: CameraBackend,
}

enum CameraBackend {
    Synthetic(SyntheticSource),
    Mjpeg(MjpegSource),
    #[cfg(feature = "ingest-v4l2")]
    Device(V4l2Source),
    /// Source string that this build cannot serve. Every open fails, so the
    /// camera shows up as permanently offline instead of stopping the daemon.
    Unavailable { source: String, reason: String },
}

impl CameraSource {
    pub fn new(config: SourceConfig) -> Self {
        let backend = if config.source.starts_with("stub://") {
            match SyntheticSource::new(config.clone()) {
                Ok(source) => CameraBackend::Synthetic(source),
                Err(err) => unavailable(&config, err.to_string()),
            }
        } else if config.source.starts_with("http://") || config.source.starts_with("https://") {
            CameraBackend::Mjpeg(MjpegSource::new(config))
        } else {
            device_backend(config)
        };
        Self { backend }
    }
}

#[cfg(feature = "ingest-v4l2")]
fn device_backend(config: SourceConfig) -> CameraBackend {
    CameraBackend::Device(V4l2Source::new(config))
}

#[cfg(not(feature = "ingest-v4l2"))]
fn device_backend(config: SourceConfig) -> CameraBackend {
    unavailable(
        &config,
        "local capture devices require the ingest-v4l2 feature".to_string(),
    )
}

fn unavailable(config: &SourceConfig, reason: String) -> CameraBackend {
    CameraBackend::Unavailable {
        source: config.source.clone(),
        reason,
    }
}

impl FrameSource for CameraSource {
    fn open(&mut self) -> Result<()> {
        match &mut self.backend {
            CameraBackend::Synthetic(source) => source.open(),
            CameraBackend::Mjpeg(source) => source.open(),
            #[cfg(feature = "ingest-v4l2")]
            CameraBackend::Device(source) => source.open(),
            CameraBackend::Unavailable { source, reason } => {
                Err(anyhow!("cannot open {}: {}", source, reason))
            }
        }
    }

    fn read(&mut self) -> Result<Option<Frame>> {
        match &mut self.backend {
            CameraBackend::Synthetic(source) => source.read(),
            CameraBackend::Mjpeg(source) => source.read(),
            #[cfg(feature = "ingest-v4l2")]
            CameraBackend::Device(source) => source.read(),
            CameraBackend::Unavailable { source, .. } => {
                Err(anyhow!("{} is not available", source))
            }
        }
    }

    fn close(&mut self) {
        match &mut self.backend {
            CameraBackend::Synthetic(source) => source.close(),
            CameraBackend::Mjpeg(source) => source.close(),
            #[cfg(feature = "ingest-v4l2")]
            CameraBackend::Device(source) => source.close(),
            CameraBackend::Unavailable { .. } => {}
        }
    }

    fn is_open(&self) -> bool {
        match &self.backend {
            CameraBackend::Synthetic(source) => source.is_open(),
            CameraBackend::Mjpeg(source) => source.is_open(),
            #[cfg(feature = "ingest-v4l2")]
            CameraBackend::Device(source) => source.is_open(),
            CameraBackend::Unavailable { .. } => false,
        }
    }

    fn describe(&self) -> String {
        match &self.backend {
            CameraBackend::Synthetic(source) => source.describe(),
            CameraBackend::Mjpeg(source) => source.describe(),
            #[cfg(feature = "ingest-v4l2")]
            CameraBackend::Device(source) => source.describe(),
            CameraBackend::Unavailable { source, .. } => format!("{} (unavailable)", source),
        }
    }
}

/// Upper bound on one blocking read: six frame periods, never below 2s.
fn read_timeout(target_fps: u32) -> Duration {
    let base_ms = if target_fps == 0 {
        2_000
    } else {
        (1000 / target_fps).saturating_mul(6)
    };
    Duration::from_millis(base_ms.max(2_000) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(source: &str) -> SourceConfig {
        SourceConfig {
            source: source.to_string(),
            width: 32,
            height: 24,
            target_fps: 15,
            read_timeout: Duration::from_millis(100),
        }
    }

    #[test]
    fn stub_urls_select_synthetic_backend() -> Result<()> {
        let mut source = CameraSource::new(config("stub://front"));
        assert!(!source.is_open());
        source.open()?;
        let frame = source.read()?.expect("synthetic frame");
        assert_eq!((frame.width, frame.height), (32, 24));
        source.close();
        assert!(!source.is_open());
        Ok(())
    }

    #[test]
    fn bad_stub_pattern_is_reported_on_open() {
        let mut source = CameraSource::new(config("stub://front?pattern=plaid"));
        assert!(source.open().is_err());
        assert!(source.describe().contains("unavailable"));
    }

    #[cfg(not(feature = "ingest-v4l2"))]
    #[test]
    fn device_index_without_v4l2_never_opens() {
        let mut source = CameraSource::new(config("0"));
        assert!(source.open().is_err());
        assert!(source.read().is_err());
        assert!(!source.is_open());
    }

    #[test]
    fn read_timeout_has_floor() {
        assert_eq!(read_timeout(15), Duration::from_millis(2_000));
        assert_eq!(read_timeout(1), Duration::from_millis(6_000));
    }
}
