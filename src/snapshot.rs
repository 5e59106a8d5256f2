//! Snapshot persistence for Capture cameras.
//!
//! While the vehicle moves, each Capture camera stores roughly one JPEG per
//! interval. Cameras are phase-shifted by `index * interval / count` so their
//! writes do not land on disk at the same moment.

use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use crate::{unix_millis, CameraId};

pub trait SnapshotSink: Send + Sync {
    fn store(&self, camera: CameraId, captured_at: SystemTime, jpeg: &[u8]) -> Result<()>;
}

/// Writes `CAM{id}_{unix_millis}.jpg` files into one directory.
#[derive(Debug)]
pub struct DirectorySnapshotSink {
    dir: PathBuf,
}

impl DirectorySnapshotSink {
    /// Create the directory if needed.
    pub fn create(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("create snapshot directory {}", dir.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn path_for(&self, camera: CameraId, captured_at: SystemTime) -> PathBuf {
        self.dir
            .join(format!("{}_{}.jpg", camera, unix_millis(captured_at)))
    }
}

impl SnapshotSink for DirectorySnapshotSink {
    fn store(&self, camera: CameraId, captured_at: SystemTime, jpeg: &[u8]) -> Result<()> {
        let path = self.path_for(camera, captured_at);
        write_atomic(&path, jpeg).with_context(|| format!("write snapshot {}", path.display()))
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let tmp_path = path.with_extension("jpg.tmp");
    {
        let mut file = File::create(&tmp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    fs::rename(tmp_path, path)?;
    Ok(())
}

/// Per-camera snapshot schedule. Armed only while the vehicle moves.
#[derive(Debug)]
pub struct SnapshotThrottle {
    interval: Duration,
    offset: Duration,
    next_due: Option<Instant>,
}

impl SnapshotThrottle {
    /// `index` is this camera's position among `count` capture cameras.
    pub fn new(interval: Duration, index: usize, count: usize) -> Self {
        let count = count.max(1) as u32;
        let index = (index as u32).min(count - 1);
        Self {
            interval,
            offset: interval * index / count,
            next_due: None,
        }
    }

    pub fn offset(&self) -> Duration {
        self.offset
    }

    /// Whether a snapshot is due now. Stopping resets the schedule, so the
    /// next movement starts again at this camera's offset.
    pub fn due(&mut self, moving: bool, now: Instant) -> bool {
        if !moving {
            self.next_due = None;
            return false;
        }
        let next_due = *self.next_due.get_or_insert(now + self.offset);
        if now < next_due {
            return false;
        }
        let mut following = next_due + self.interval;
        if following <= now {
            following = now + self.interval;
        }
        self.next_due = Some(following);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_spread_cameras_across_interval() {
        let interval = Duration::from_millis(1_000);
        assert_eq!(SnapshotThrottle::new(interval, 0, 2).offset(), Duration::ZERO);
        assert_eq!(
            SnapshotThrottle::new(interval, 1, 2).offset(),
            Duration::from_millis(500)
        );
        assert_eq!(SnapshotThrottle::new(interval, 0, 0).offset(), Duration::ZERO);
    }

    #[test]
    fn fires_once_per_interval_while_moving() {
        let mut throttle = SnapshotThrottle::new(Duration::from_millis(1_000), 1, 2);
        let t0 = Instant::now();
        assert!(!throttle.due(true, t0));
        assert!(!throttle.due(true, t0 + Duration::from_millis(499)));
        assert!(throttle.due(true, t0 + Duration::from_millis(500)));
        assert!(!throttle.due(true, t0 + Duration::from_millis(900)));
        assert!(throttle.due(true, t0 + Duration::from_millis(1_500)));
    }

    #[test]
    fn standby_disarms_and_resets() {
        let mut throttle = SnapshotThrottle::new(Duration::from_millis(1_000), 0, 2);
        let t0 = Instant::now();
        assert!(throttle.due(true, t0));
        assert!(!throttle.due(false, t0 + Duration::from_millis(5_000)));
        assert!(throttle.due(true, t0 + Duration::from_millis(5_001)));
    }

    #[test]
    fn directory_sink_writes_named_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let sink = DirectorySnapshotSink::create(&dir.path().join("snaps"))?;
        let at = std::time::UNIX_EPOCH + Duration::from_millis(1_700_000_000_123);
        sink.store(CameraId(4), at, b"jpeg")?;

        let path = dir.path().join("snaps").join("CAM4_1700000000123.jpg");
        assert_eq!(fs::read(&path)?, b"jpeg");
        assert!(!path.with_extension("jpg.tmp").exists());
        Ok(())
    }
}
