/// One bounding box, in normalised 0..1 frame coordinates.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub label: String,
    pub confidence: f32,
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl Detection {
    pub fn new(label: &str, confidence: f32, x: f32, y: f32, w: f32, h: f32) -> Self {
        Self {
            label: label.to_string(),
            confidence,
            x,
            y,
            w,
            h,
        }
    }

    /// Fraction of the frame covered by the box, after clipping to the frame.
    pub fn coverage(&self) -> f32 {
        let x0 = self.x.clamp(0.0, 1.0);
        let y0 = self.y.clamp(0.0, 1.0);
        let x1 = (self.x + self.w).clamp(0.0, 1.0);
        let y1 = (self.y + self.h).clamp(0.0, 1.0);
        (x1 - x0).max(0.0) * (y1 - y0).max(0.0)
    }
}
