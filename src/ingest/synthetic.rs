//! Synthetic frame source for `stub://` URLs.
//!
//! `stub://name?pattern=<textured|dark|flat|orange>&stall_after=<n>`
//!
//! - `textured` (default): moving checkerboard, never dangerous
//! - `dark`: near-black, trips the luminance floor
//! - `flat`: uniform mid-grey, trips the contrast floor
//! - `orange`: textured high-visibility orange, trips a matching colour band
//!
//! `stall_after` makes every read after the n-th return no frame, which
//! exercises the miss/reopen path without hardware.

use anyhow::{anyhow, Context, Result};
use url::Url;

use super::SourceConfig;
use crate::frame::{rgb_len, Frame};

const CHECKER_CELL: u32 = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyntheticPattern {
    Textured,
    Dark,
    Flat,
    Orange,
}

impl SyntheticPattern {
    fn parse(value: &str) -> Result<Self> {
        match value {
            "textured" => Ok(Self::Textured),
            "dark" => Ok(Self::Dark),
            "flat" => Ok(Self::Flat),
            "orange" => Ok(Self::Orange),
            other => Err(anyhow!("unknown synthetic pattern '{}'", other)),
        }
    }
}

pub struct SyntheticSource {
    config: SourceConfig,
    pattern: SyntheticPattern,
    stall_after: Option<u64>,
    open: bool,
    frame_count: u64,
}

impl SyntheticSource {
    pub fn new(config: SourceConfig) -> Result<Self> {
        let url = Url::parse(&config.source).context("parse stub url")?;
        let mut pattern = SyntheticPattern::Textured;
        let mut stall_after = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "pattern" => pattern = SyntheticPattern::parse(&value)?,
                "stall_after" => {
                    stall_after = Some(
                        value
                            .parse()
                            .map_err(|_| anyhow!("stall_after must be an integer"))?,
                    )
                }
                other => return Err(anyhow!("unknown stub parameter '{}'", other)),
            }
        }
        rgb_len(config.width, config.height)?;
        Ok(Self {
            config,
            pattern,
            stall_after,
            open: false,
            frame_count: 0,
        })
    }

    pub fn pattern(&self) -> SyntheticPattern {
        self.pattern
    }

    pub fn open(&mut self) -> Result<()> {
        self.open = true;
        log::info!("SyntheticSource: opened {} ({:?})", self.config.source, self.pattern);
        Ok(())
    }

    pub fn read(&mut self) -> Result<Option<Frame>> {
        if !self.open {
            return Err(anyhow!("synthetic source {} is closed", self.config.source));
        }
        if let Some(limit) = self.stall_after {
            if self.frame_count >= limit {
                return Ok(None);
            }
        }
        self.frame_count += 1;
        let pixels = self.render()?;
        Frame::from_rgb(pixels, self.config.width, self.config.height, self.frame_count).map(Some)
    }

    pub fn close(&mut self) {
        self.open = false;
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn describe(&self) -> String {
        self.config.source.clone()
    }

    fn render(&self) -> Result<Vec<u8>> {
        let width = self.config.width;
        let height = self.config.height;
        let mut pixels = Vec::with_capacity(rgb_len(width, height)?);
        // Shift the checkerboard each frame so consecutive frames differ.
        let shift = (self.frame_count % CHECKER_CELL as u64) as u32;
        for y in 0..height {
            for x in 0..width {
                let on = ((x + shift) / CHECKER_CELL + y / CHECKER_CELL) % 2 == 0;
                let rgb = match (self.pattern, on) {
                    (SyntheticPattern::Textured, true) => [220, 220, 220],
                    (SyntheticPattern::Textured, false) => [40, 40, 40],
                    (SyntheticPattern::Dark, _) => [3, 3, 3],
                    (SyntheticPattern::Flat, _) => [128, 128, 128],
                    (SyntheticPattern::Orange, true) => [255, 140, 0],
                    (SyntheticPattern::Orange, false) => [230, 120, 0],
                };
                pixels.extend_from_slice(&rgb);
            }
        }
        Ok(pixels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config(source: &str) -> SourceConfig {
        SourceConfig {
            source: source.to_string(),
            width: 16,
            height: 16,
            target_fps: 10,
            read_timeout: Duration::from_millis(100),
        }
    }

    #[test]
    fn read_before_open_fails() -> Result<()> {
        let mut source = SyntheticSource::new(config("stub://cam"))?;
        assert!(source.read().is_err());
        Ok(())
    }

    #[test]
    fn sequences_increase_and_frames_move() -> Result<()> {
        let mut source = SyntheticSource::new(config("stub://cam"))?;
        source.open()?;
        let first = source.read()?.expect("frame");
        let second = source.read()?.expect("frame");
        assert_eq!(first.sequence, 1);
        assert_eq!(second.sequence, 2);
        assert_ne!(first.pixels(), second.pixels());
        Ok(())
    }

    #[test]
    fn stall_after_yields_no_frame() -> Result<()> {
        let mut source = SyntheticSource::new(config("stub://cam?pattern=dark&stall_after=1"))?;
        assert_eq!(source.pattern(), SyntheticPattern::Dark);
        source.open()?;
        assert!(source.read()?.is_some());
        assert!(source.read()?.is_none());
        assert!(source.read()?.is_none());
        Ok(())
    }

    #[test]
    fn unknown_parameters_are_rejected() {
        assert!(SyntheticSource::new(config("stub://cam?fps=3")).is_err());
        assert!(SyntheticSource::new(config("stub://cam?stall_after=x")).is_err());
    }
}
