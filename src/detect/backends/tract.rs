#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use tract_onnx::prelude::*;

use crate::detect::{Detection, ObjectDetector};

/// Values per output row: x1, y1, x2, y2, score, class.
const ROW_LEN: usize = 6;

/// ONNX object detector run through tract.
///
/// Expects a single `[1, 3, H, W]` f32 input in 0..1 and an output whose last
/// dimension is `x1, y1, x2, y2, score, class` in input pixel coordinates
/// (the usual shape of exported YOLO models with NMS baked in).
pub struct TractDetector {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    width: u32,
    height: u32,
    labels: Vec<String>,
}

impl TractDetector {
    pub fn new<P: AsRef<Path>>(
        model_path: P,
        width: u32,
        height: u32,
        labels: Vec<String>,
    ) -> Result<Self> {
        let model_path = model_path.as_ref();
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, 3, height as usize, width as usize),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        log::info!(
            "TractDetector: loaded {} ({}x{}, {} labels)",
            model_path.display(),
            width,
            height,
            labels.len()
        );
        Ok(Self {
            model,
            width,
            height,
            labels,
        })
    }

    fn build_input(&self, pixels: &[u8], width: u32, height: u32) -> Result<Tensor> {
        let image = image::RgbImage::from_raw(width, height, pixels.to_vec())
            .ok_or_else(|| anyhow!("expected {}x{} RGB frame, got {} bytes", width, height, pixels.len()))?;
        let image = if (width, height) == (self.width, self.height) {
            image
        } else {
            image::imageops::resize(
                &image,
                self.width,
                self.height,
                image::imageops::FilterType::Triangle,
            )
        };
        let raw = image.into_raw();
        let model_width = self.width as usize;
        let input = tract_ndarray::Array4::from_shape_fn(
            (1, 3, self.height as usize, model_width),
            |(_, channel, y, x)| raw[(y * model_width + x) * 3 + channel] as f32 / 255.0,
        );
        Ok(input.into_tensor())
    }

    fn parse_rows(&self, outputs: TVec<TValue>) -> Result<Vec<Detection>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        if output.shape().last() != Some(&ROW_LEN) {
            return Err(anyhow!(
                "unexpected model output shape {:?}; last dimension must be {}",
                output.shape(),
                ROW_LEN
            ));
        }
        let values = output
            .as_slice::<f32>()
            .context("model output tensor was not f32")?;
        let (w, h) = (self.width as f32, self.height as f32);
        Ok(values
            .chunks_exact(ROW_LEN)
            .filter(|row| row[4] > 0.0)
            .map(|row| {
                let class = row[5].max(0.0) as usize;
                let label = self
                    .labels
                    .get(class)
                    .cloned()
                    .unwrap_or_else(|| class.to_string());
                Detection {
                    label,
                    confidence: row[4],
                    x: row[0] / w,
                    y: row[1] / h,
                    w: (row[2] - row[0]) / w,
                    h: (row[3] - row[1]) / h,
                }
            })
            .collect())
    }
}

impl ObjectDetector for TractDetector {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<Vec<Detection>> {
        let input = self.build_input(pixels, width, height)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        self.parse_rows(outputs)
    }

    fn warm_up(&mut self) -> Result<()> {
        let blank = vec![0u8; (self.width as usize) * (self.height as usize) * 3];
        self.detect(&blank, self.width, self.height).map(|_| ())
    }
}
