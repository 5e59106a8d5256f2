//! Per-frame obstruction scoring for Detect cameras.
//!
//! Checks run cheapest first and stop at the first one that fires:
//!
//! 1. coverage: mean luminance below the floor, or grey-level standard
//!    deviation below the contrast floor (lens blocked or taped over)
//! 2. sharpness: Laplacian variance below the floor (object right on the lens)
//! 3. colour area: share of pixels inside an HSV band above a limit
//! 4. model: a qualifying detection covering enough of the frame
//!
//! A verdict always carries the reason and the metric that decided it.

pub mod metrics;

use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::fmt;
use std::time::SystemTime;

use crate::detect::{Detection, ObjectDetector};
use crate::frame::Frame;
use crate::CameraId;

// ----------------------------------------------------------------------------
// Thresholds
// ----------------------------------------------------------------------------

/// HSV band. Hue in degrees; `hue_min > hue_max` wraps through 0 (reds).
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ColorBand {
    pub hue_min: f64,
    pub hue_max: f64,
    #[serde(default)]
    pub sat_min: f64,
    #[serde(default = "unit")]
    pub sat_max: f64,
    #[serde(default)]
    pub val_min: f64,
    #[serde(default = "unit")]
    pub val_max: f64,
    /// Share of the frame, strictly between 0 and 1, that the band must
    /// exceed.
    pub min_coverage: f64,
}

fn unit() -> f64 {
    1.0
}

impl ColorBand {
    pub fn contains(&self, hue: f64, sat: f64, val: f64) -> bool {
        let hue_ok = if self.hue_min <= self.hue_max {
            (self.hue_min..=self.hue_max).contains(&hue)
        } else {
            hue >= self.hue_min || hue <= self.hue_max
        };
        hue_ok
            && (self.sat_min..=self.sat_max).contains(&sat)
            && (self.val_min..=self.val_max).contains(&val)
    }

    pub fn validate(&self) -> Result<()> {
        let hue_range = 0.0..=360.0;
        let unit_range = 0.0..=1.0;
        if !hue_range.contains(&self.hue_min) || !hue_range.contains(&self.hue_max) {
            return Err(anyhow!("hue bounds must be within 0..=360"));
        }
        for value in [self.sat_min, self.sat_max, self.val_min, self.val_max] {
            if !unit_range.contains(&value) {
                return Err(anyhow!("saturation and value bounds must be within 0..=1"));
            }
        }
        if self.sat_min > self.sat_max || self.val_min > self.val_max {
            return Err(anyhow!("band minimums must not exceed maximums"));
        }
        if !(self.min_coverage > 0.0 && self.min_coverage < 1.0) {
            return Err(anyhow!("min_coverage must be within (0, 1)"));
        }
        Ok(())
    }
}

/// Model-based check: any box of a listed class at or above `min_confidence`
/// covering more than `min_coverage` of the frame.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ModelCheck {
    /// Empty means every class qualifies.
    #[serde(default)]
    pub classes: Vec<String>,
    pub min_confidence: f32,
    pub min_coverage: f32,
}

impl ModelCheck {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(anyhow!("min_confidence must be within 0..=1"));
        }
        if !(self.min_coverage > 0.0 && self.min_coverage < 1.0) {
            return Err(anyhow!("min_coverage must be within (0, 1)"));
        }
        Ok(())
    }

    fn qualifies(&self, detection: &Detection) -> bool {
        detection.confidence >= self.min_confidence
            && (self.classes.is_empty()
                || self
                    .classes
                    .iter()
                    .any(|class| class.eq_ignore_ascii_case(&detection.label)))
    }
}

/// Per-camera detector configuration. `None` disables a check.
#[derive(Clone, Debug, PartialEq)]
pub struct DetectorThresholds {
    pub luminance_floor: f64,
    pub contrast_floor: Option<f64>,
    pub sharpness_floor: Option<f64>,
    pub color_band: Option<ColorBand>,
    pub model: Option<ModelCheck>,
}

impl Default for DetectorThresholds {
    fn default() -> Self {
        Self {
            luminance_floor: 10.0,
            contrast_floor: Some(5.0),
            sharpness_floor: None,
            color_band: None,
            model: None,
        }
    }
}

// ----------------------------------------------------------------------------
// Verdict
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DangerReason {
    Clear,
    Covered,
    BlurryNear,
    ColorObstacle,
    ModelDetection,
}

impl fmt::Display for DangerReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DangerReason::Clear => "clear",
            DangerReason::Covered => "covered",
            DangerReason::BlurryNear => "blurry_near",
            DangerReason::ColorObstacle => "color_obstacle",
            DangerReason::ModelDetection => "model_detection",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DangerVerdict {
    pub camera_id: CameraId,
    pub timestamp: SystemTime,
    pub is_danger: bool,
    pub reason: DangerReason,
    /// Metric of the deciding check: mean luminance or contrast for
    /// `Covered`, Laplacian variance, band coverage, or box coverage.
    /// Mean luminance when clear.
    pub score: f64,
}

// ----------------------------------------------------------------------------
// Scorer
// ----------------------------------------------------------------------------

pub struct DangerScorer {
    camera_id: CameraId,
    thresholds: DetectorThresholds,
    detector: Option<Box<dyn ObjectDetector>>,
}

impl DangerScorer {
    pub fn new(camera_id: CameraId, thresholds: DetectorThresholds) -> Self {
        Self {
            camera_id,
            thresholds,
            detector: None,
        }
    }

    /// Attach the detector used by the model check.
    pub fn with_detector(mut self, detector: Box<dyn ObjectDetector>) -> Self {
        self.detector = Some(detector);
        self
    }

    pub fn score(&mut self, frame: &Frame) -> DangerVerdict {
        let (reason, score) = self.evaluate(frame);
        DangerVerdict {
            camera_id: self.camera_id,
            timestamp: frame.captured_at,
            is_danger: reason != DangerReason::Clear,
            reason,
            score,
        }
    }

    fn evaluate(&mut self, frame: &Frame) -> (DangerReason, f64) {
        let luma = metrics::luma_plane(frame.pixels());
        let stats = metrics::luma_stats(&luma);

        if stats.mean < self.thresholds.luminance_floor {
            return (DangerReason::Covered, stats.mean);
        }
        if let Some(floor) = self.thresholds.contrast_floor {
            if stats.std_dev < floor {
                return (DangerReason::Covered, stats.std_dev);
            }
        }

        if let Some(floor) = self.thresholds.sharpness_floor {
            let sharpness = metrics::laplacian_variance(&luma, frame.width, frame.height);
            if sharpness < floor {
                return (DangerReason::BlurryNear, sharpness);
            }
        }

        if let Some(band) = &self.thresholds.color_band {
            let coverage = metrics::band_coverage(frame.pixels(), band);
            if coverage > band.min_coverage {
                return (DangerReason::ColorObstacle, coverage);
            }
        }

        if let (Some(check), Some(detector)) = (&self.thresholds.model, self.detector.as_mut()) {
            match detector.detect(frame.pixels(), frame.width, frame.height) {
                Ok(detections) => {
                    let coverage = detections
                        .iter()
                        .filter(|d| check.qualifies(d))
                        .map(|d| d.coverage())
                        .fold(0.0f32, f32::max);
                    if coverage > check.min_coverage {
                        return (DangerReason::ModelDetection, coverage as f64);
                    }
                }
                Err(err) => {
                    log::warn!(
                        "{}: {} detector failed, treating frame as no detection: {:#}",
                        self.camera_id,
                        detector.name(),
                        err
                    );
                }
            }
        }

        (DangerReason::Clear, stats.mean)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::ScriptedDetector;

    fn frame_from(width: u32, height: u32, pixel: impl Fn(u32, u32) -> [u8; 3]) -> Frame {
        let mut data = Vec::with_capacity((width * height * 3) as usize);
        for y in 0..height {
            for x in 0..width {
                data.extend_from_slice(&pixel(x, y));
            }
        }
        Frame::from_rgb(data, width, height, 1).unwrap()
    }

    fn textured() -> Frame {
        frame_from(32, 32, |x, y| {
            if (x / 4 + y / 4) % 2 == 0 {
                [200, 200, 200]
            } else {
                [60, 60, 60]
            }
        })
    }

    fn orange() -> ColorBand {
        ColorBand {
            hue_min: 15.0,
            hue_max: 45.0,
            sat_min: 0.6,
            sat_max: 1.0,
            val_min: 0.5,
            val_max: 1.0,
            min_coverage: 0.5,
        }
    }

    fn scorer(thresholds: DetectorThresholds) -> DangerScorer {
        DangerScorer::new(CameraId(3), thresholds)
    }

    #[test]
    fn textured_view_is_clear() {
        let verdict = scorer(DetectorThresholds::default()).score(&textured());
        assert!(!verdict.is_danger);
        assert_eq!(verdict.reason, DangerReason::Clear);
        assert_eq!(verdict.camera_id, CameraId(3));
    }

    #[test]
    fn dark_frame_is_covered_regardless_of_other_checks() {
        let mut thresholds = DetectorThresholds::default();
        thresholds.sharpness_floor = Some(1e9);
        thresholds.color_band = Some(orange());
        thresholds.model = Some(ModelCheck {
            classes: vec![],
            min_confidence: 0.1,
            min_coverage: 0.1,
        });
        let mut scorer = scorer(thresholds).with_detector(Box::new(ScriptedDetector::repeating(
            vec![Detection::new("person", 0.9, 0.0, 0.0, 1.0, 1.0)],
        )));
        let verdict = scorer.score(&frame_from(16, 16, |_, _| [4, 4, 4]));
        assert!(verdict.is_danger);
        assert_eq!(verdict.reason, DangerReason::Covered);
        assert!(verdict.score < 10.0);
    }

    #[test]
    fn flat_bright_frame_trips_contrast_floor() {
        let verdict = scorer(DetectorThresholds::default()).score(&frame_from(16, 16, |_, _| [128, 128, 128]));
        assert_eq!(verdict.reason, DangerReason::Covered);

        let mut no_contrast = DetectorThresholds::default();
        no_contrast.contrast_floor = None;
        let verdict = scorer(no_contrast).score(&frame_from(16, 16, |_, _| [128, 128, 128]));
        assert!(!verdict.is_danger);
    }

    #[test]
    fn smooth_gradient_is_blurry_when_sharpness_enabled() {
        let gradient = || frame_from(32, 32, |x, _| { let v = (x * 6) as u8 + 20; [v, v, v] });
        let mut thresholds = DetectorThresholds::default();
        thresholds.sharpness_floor = Some(50.0);
        let verdict = scorer(thresholds.clone()).score(&gradient());
        assert_eq!(verdict.reason, DangerReason::BlurryNear);

        let verdict = scorer(thresholds).score(&textured());
        assert!(!verdict.is_danger);
    }

    #[test]
    fn orange_fill_is_color_obstacle() {
        let mut thresholds = DetectorThresholds::default();
        thresholds.color_band = Some(orange());
        let frame = frame_from(16, 16, |x, _| if x % 2 == 0 { [255, 140, 0] } else { [230, 120, 0] });
        let verdict = scorer(thresholds.clone()).score(&frame);
        assert_eq!(verdict.reason, DangerReason::ColorObstacle);
        assert!(verdict.score >= 0.99);

        assert!(!scorer(thresholds).score(&textured()).is_danger);
    }

    #[test]
    fn wrapping_band_matches_reds() {
        let band = ColorBand {
            hue_min: 340.0,
            hue_max: 20.0,
            ..orange()
        };
        assert!(band.contains(350.0, 0.9, 0.9));
        assert!(band.contains(5.0, 0.9, 0.9));
        assert!(!band.contains(60.0, 0.9, 0.9));
    }

    #[test]
    fn model_check_requires_class_confidence_and_coverage() {
        let mut thresholds = DetectorThresholds::default();
        thresholds.model = Some(ModelCheck {
            classes: vec!["person".to_string()],
            min_confidence: 0.5,
            min_coverage: 0.3,
        });
        let script = vec![
            Some(vec![Detection::new("person", 0.9, 0.0, 0.0, 0.8, 0.8)]),
            Some(vec![Detection::new("person", 0.4, 0.0, 0.0, 0.8, 0.8)]),
            Some(vec![Detection::new("dog", 0.9, 0.0, 0.0, 0.8, 0.8)]),
            Some(vec![Detection::new("Person", 0.9, 0.0, 0.0, 0.2, 0.2)]),
            None,
        ];
        let mut scorer = scorer(thresholds).with_detector(Box::new(ScriptedDetector::new(script)));
        let frame = textured();

        let verdict = scorer.score(&frame);
        assert_eq!(verdict.reason, DangerReason::ModelDetection);
        assert!((verdict.score - 0.64).abs() < 1e-3);
        assert!(!scorer.score(&frame).is_danger);
        assert!(!scorer.score(&frame).is_danger);
        assert!(!scorer.score(&frame).is_danger);
        // Detector errors count as no detection.
        assert!(!scorer.score(&frame).is_danger);
    }

    #[test]
    fn band_validation_rejects_out_of_range() {
        assert!(orange().validate().is_ok());
        assert!(ColorBand { hue_max: 400.0, ..orange() }.validate().is_err());
        assert!(ColorBand { sat_min: 0.9, sat_max: 0.2, ..orange() }.validate().is_err());
        assert!(ColorBand { min_coverage: 0.0, ..orange() }.validate().is_err());
        assert!(ColorBand { min_coverage: 1.0, ..orange() }.validate().is_err());
    }

    #[test]
    fn coverage_must_exceed_its_threshold() {
        let mut thresholds = DetectorThresholds::default();
        thresholds.color_band = Some(orange());
        let half = frame_from(16, 16, |x, _| if x < 8 { [255, 140, 0] } else { [60, 60, 60] });
        assert!(!scorer(thresholds.clone()).score(&half).is_danger);
        let more = frame_from(16, 16, |x, _| if x < 9 { [255, 140, 0] } else { [60, 60, 60] });
        assert_eq!(scorer(thresholds).score(&more).reason, DangerReason::ColorObstacle);

        let mut thresholds = DetectorThresholds::default();
        thresholds.model = Some(ModelCheck {
            classes: vec![],
            min_confidence: 0.5,
            min_coverage: 0.25,
        });
        let script = vec![
            Some(vec![Detection::new("cone", 0.9, 0.0, 0.0, 0.5, 0.5)]),
            Some(vec![Detection::new("cone", 0.9, 0.0, 0.0, 0.5, 0.75)]),
        ];
        let mut scorer = scorer(thresholds).with_detector(Box::new(ScriptedDetector::new(script)));
        assert!(!scorer.score(&textured()).is_danger);
        assert_eq!(scorer.score(&textured()).reason, DangerReason::ModelDetection);
    }
}
