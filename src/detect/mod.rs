//! Pluggable object detection.
//!
//! The danger scorer only needs "given a frame, return labelled boxes". Any
//! model runtime that can answer that implements [`ObjectDetector`]; the
//! scorer's model check can be swapped or disabled without touching the gate
//! or latch logic.

mod backend;
mod backends;
mod result;

use anyhow::Result;

use crate::config::ModelSettings;

pub use backend::ObjectDetector;
pub use backends::ScriptedDetector;
#[cfg(feature = "backend-tract")]
pub use backends::TractDetector;
pub use result::Detection;

/// Load the configured model for one camera.
#[cfg(feature = "backend-tract")]
pub fn load_detector(settings: &ModelSettings) -> Result<Box<dyn ObjectDetector>> {
    let mut detector = TractDetector::new(
        &settings.path,
        settings.input_width,
        settings.input_height,
        settings.labels.clone(),
    )?;
    detector.warm_up()?;
    Ok(Box::new(detector))
}

#[cfg(not(feature = "backend-tract"))]
pub fn load_detector(settings: &ModelSettings) -> Result<Box<dyn ObjectDetector>> {
    Err(anyhow::anyhow!(
        "cannot load {}: built without the backend-tract feature",
        settings.path.display()
    ))
}
