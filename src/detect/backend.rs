use anyhow::Result;

use super::Detection;

/// Object detector over RGB8 frames.
pub trait ObjectDetector: Send {
    fn name(&self) -> &'static str;

    /// Run detection on one frame. The pixel slice is only borrowed for the
    /// duration of the call.
    fn detect(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<Vec<Detection>>;

    /// Optional warm-up hook, run once before the first frame.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
