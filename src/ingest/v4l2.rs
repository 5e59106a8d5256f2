//! V4L2 frame source for local USB cameras.
//!
//! Accepts either a bare device index (`"2"` means `/dev/video2`) or a device
//! path. YUYV is requested first since nearly every UVC camera offers it at
//! low resolutions; RGB3 is used when the driver reports it instead.

use anyhow::{anyhow, Context, Result};
use ouroboros::self_referencing;

use super::normalize::{normalize_to_rgb, PixelFormat};
use super::SourceConfig;
use crate::frame::Frame;

pub struct V4l2Source {
    config: SourceConfig,
    device_path: String,
    state: Option<DeviceState>,
    format: PixelFormat,
    active_width: u32,
    active_height: u32,
    frame_count: u64,
}

#[self_referencing]
struct DeviceState {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

impl V4l2Source {
    pub fn new(config: SourceConfig) -> Self {
        let device_path = device_path(&config.source);
        Self {
            active_width: config.width,
            active_height: config.height,
            config,
            device_path,
            state: None,
            format: PixelFormat::Yuyv,
            frame_count: 0,
        }
    }

    pub fn open(&mut self) -> Result<()> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let mut device = v4l::Device::with_path(&self.device_path)
            .with_context(|| format!("open v4l2 device {}", self.device_path))?;
        let mut format = device.format().context("read v4l2 format")?;
        format.width = self.config.width;
        format.height = self.config.height;
        format.fourcc = v4l::FourCC::new(b"YUYV");

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!(
                    "V4l2Source: failed to set format on {}: {}",
                    self.device_path,
                    err
                );
                device
                    .format()
                    .context("read v4l2 format after set failure")?
            }
        };
        self.format = match &format.fourcc.repr {
            b"YUYV" => PixelFormat::Yuyv,
            b"RGB3" => PixelFormat::Rgb24,
            other => {
                return Err(anyhow!(
                    "{} offers unsupported pixel format {}",
                    self.device_path,
                    String::from_utf8_lossy(other)
                ))
            }
        };

        let params = v4l::video::capture::Parameters::with_fps(self.config.target_fps.max(1));
        if let Err(err) = device.set_params(&params) {
            log::warn!(
                "V4l2Source: failed to set fps on {}: {}",
                self.device_path,
                err
            );
        }

        self.active_width = format.width;
        self.active_height = format.height;

        let state = DeviceStateBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4)
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build()?;
        self.state = Some(state);

        log::info!(
            "V4l2Source: opened {} ({}x{} {:?})",
            self.device_path,
            self.active_width,
            self.active_height,
            self.format
        );
        Ok(())
    }

    pub fn read(&mut self) -> Result<Option<Frame>> {
        use v4l::io::traits::CaptureStream;

        let state = self
            .state
            .as_mut()
            .ok_or_else(|| anyhow!("v4l2 device {} not open", self.device_path))?;
        let raw = state
            .with_mut(|fields| fields.stream.next().map(|(buf, _meta)| buf.to_vec()))
            .context("capture v4l2 frame")?;

        let pixels = match normalize_to_rgb(&raw, self.active_width, self.active_height, self.format)
        {
            Ok(pixels) => pixels,
            Err(err) => {
                log::debug!("V4l2Source: dropping malformed frame: {:#}", err);
                return Ok(None);
            }
        };
        let pixels = if (self.active_width, self.active_height) == (self.config.width, self.config.height) {
            pixels
        } else {
            resize(pixels, self.active_width, self.active_height, &self.config)?
        };
        self.frame_count += 1;
        Frame::from_rgb(pixels, self.config.width, self.config.height, self.frame_count).map(Some)
    }

    pub fn close(&mut self) {
        if self.state.take().is_some() {
            log::info!("V4l2Source: closed {}", self.device_path);
        }
    }

    pub fn is_open(&self) -> bool {
        self.state.is_some()
    }

    pub fn describe(&self) -> String {
        self.device_path.clone()
    }
}

fn device_path(source: &str) -> String {
    if source.chars().all(|c| c.is_ascii_digit()) {
        format!("/dev/video{}", source)
    } else {
        source.to_string()
    }
}

fn resize(pixels: Vec<u8>, width: u32, height: u32, config: &SourceConfig) -> Result<Vec<u8>> {
    let image = image::RgbImage::from_raw(width, height, pixels)
        .ok_or_else(|| anyhow!("v4l2 frame does not match {}x{}", width, height))?;
    Ok(image::imageops::resize(
        &image,
        config.width,
        config.height,
        image::imageops::FilterType::Triangle,
    )
    .into_raw())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_index_maps_to_video_node() {
        assert_eq!(device_path("2"), "/dev/video2");
        assert_eq!(device_path("/dev/v4l/by-id/cam"), "/dev/v4l/by-id/cam");
    }
}
