//! Owned camera frames.
//!
//! - `Frame`: RGB8 pixel buffer plus capture metadata. Not `Clone`; a frame
//!   belongs to the worker that captured it until its encoded form is published.
//! - JPEG encoding for the stream and snapshot sinks.
//! - Alarm outline overlay for confirmed-danger frames.

use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use std::time::SystemTime;

/// Outline colour for frames from a camera whose danger state is confirmed.
pub const ALARM_COLOR: [u8; 3] = [255, 0, 0];

/// Outline thickness in pixels at 320x240; scaled with frame width.
const ALARM_THICKNESS_BASE: u32 = 10;

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// A single captured RGB8 image.
///
/// There is intentionally no `Clone` impl: scoring borrows the frame, encoding
/// produces new bytes, and the frame itself is dropped at the end of the
/// worker iteration.
#[derive(Debug)]
pub struct Frame {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Wall-clock capture time.
    pub captured_at: SystemTime,
    /// Per-source sequence number, starting at 1.
    pub sequence: u64,
}

impl Frame {
    /// Wrap an RGB8 buffer. The length must be exactly `width * height * 3`.
    pub fn from_rgb(data: Vec<u8>, width: u32, height: u32, sequence: u64) -> Result<Self> {
        let expected = rgb_len(width, height)?;
        if data.len() != expected {
            return Err(anyhow!(
                "rgb frame length mismatch: expected {}, got {}",
                expected,
                data.len()
            ));
        }
        Ok(Self {
            data,
            width,
            height,
            captured_at: SystemTime::now(),
            sequence,
        })
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    /// Compress to JPEG at `quality` (1..=100).
    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.data.len() / 8);
        {
            let mut encoder = JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100));
            encoder
                .encode(&self.data, self.width, self.height, ExtendedColorType::Rgb8)
                .context("encode jpeg")?;
        }
        Ok(out)
    }

    /// Paint a solid border around the frame.
    pub fn outline(&mut self, color: [u8; 3], thickness: u32) {
        let w = self.width as usize;
        let h = self.height as usize;
        let t = (thickness as usize).min(w / 2).min(h / 2);
        if t == 0 {
            return;
        }
        for y in 0..h {
            let edge_row = y < t || y >= h - t;
            for x in 0..w {
                if edge_row || x < t || x >= w - t {
                    let offset = (y * w + x) * 3;
                    self.data[offset..offset + 3].copy_from_slice(&color);
                }
            }
        }
    }

    /// Outline in [`ALARM_COLOR`], scaled to the frame size.
    pub fn mark_alarm(&mut self) {
        let thickness = (ALARM_THICKNESS_BASE * self.width / 320).max(2);
        self.outline(ALARM_COLOR, thickness);
    }
}

pub(crate) fn rgb_len(width: u32, height: u32) -> Result<usize> {
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|v| v.checked_mul(3))
        .ok_or_else(|| anyhow!("frame dimensions overflow"))
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(width: u32, height: u32, value: u8) -> Frame {
        let data = vec![value; (width * height * 3) as usize];
        Frame::from_rgb(data, width, height, 1).unwrap()
    }

    #[test]
    fn from_rgb_rejects_wrong_length() {
        assert!(Frame::from_rgb(vec![0u8; 10], 2, 2, 1).is_err());
        assert!(Frame::from_rgb(vec![0u8; 12], 2, 2, 1).is_ok());
    }

    #[test]
    fn outline_paints_border_only() {
        let mut frame = solid(10, 10, 0);
        frame.outline([255, 0, 0], 2);

        let px = |x: usize, y: usize| {
            let o = (y * 10 + x) * 3;
            [frame.pixels()[o], frame.pixels()[o + 1], frame.pixels()[o + 2]]
        };
        assert_eq!(px(0, 0), [255, 0, 0]);
        assert_eq!(px(9, 5), [255, 0, 0]);
        assert_eq!(px(5, 8), [255, 0, 0]);
        assert_eq!(px(5, 5), [0, 0, 0]);
        assert_eq!(px(2, 2), [0, 0, 0]);
    }

    #[test]
    fn encode_jpeg_produces_jpeg_markers() -> Result<()> {
        let frame = solid(16, 16, 128);
        let jpeg = frame.encode_jpeg(30)?;
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        assert_eq!(&jpeg[jpeg.len() - 2..], &[0xFF, 0xD9]);
        Ok(())
    }
}
