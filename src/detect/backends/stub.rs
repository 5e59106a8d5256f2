use anyhow::{anyhow, Result};
use std::collections::VecDeque;

use crate::detect::{Detection, ObjectDetector};

/// Detector that replays a fixed script, one entry per frame.
///
/// Once the script runs out every call returns the fallback set. A `None`
/// entry makes that call fail, for exercising the scorer's error path.
pub struct ScriptedDetector {
    script: VecDeque<Option<Vec<Detection>>>,
    fallback: Vec<Detection>,
    calls: u64,
}

impl ScriptedDetector {
    pub fn new(script: Vec<Option<Vec<Detection>>>) -> Self {
        Self {
            script: script.into(),
            fallback: Vec::new(),
            calls: 0,
        }
    }

    /// Return the same detections on every frame.
    pub fn repeating(detections: Vec<Detection>) -> Self {
        Self {
            script: VecDeque::new(),
            fallback: detections,
            calls: 0,
        }
    }

    pub fn calls(&self) -> u64 {
        self.calls
    }
}

impl ObjectDetector for ScriptedDetector {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn detect(&mut self, _pixels: &[u8], _width: u32, _height: u32) -> Result<Vec<Detection>> {
        self.calls += 1;
        match self.script.pop_front() {
            Some(Some(detections)) => Ok(detections),
            Some(None) => Err(anyhow!("scripted detector failure on call {}", self.calls)),
            None => Ok(self.fallback.clone()),
        }
    }
}
