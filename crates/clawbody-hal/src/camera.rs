//! Generic `Camera` trait and supporting types for image-capture hardware.

use std::io::Cursor;

use clawbody_types::BodyError;
use image::codecs::jpeg::JpegEncoder;
use image::{ColorType, RgbImage};

/// An RGB24 image frame returned by a camera driver.
#[derive(Debug, Clone)]
pub struct CameraFrame {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Row-major RGB24 pixel data, `width * height * 3` bytes.
    pub data: Vec<u8>,
}

impl CameraFrame {
    /// Build a frame, checking that `data` matches the dimensions.
    ///
    /// # Errors
    ///
    /// Returns [`BodyError::Parsing`] when the buffer length is wrong.
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Result<Self, BodyError> {
        let expected = width as usize * height as usize * 3;
        if data.len() != expected {
            return Err(BodyError::Parsing(format!(
                "frame {width}x{height} needs {expected} bytes, got {}",
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    /// RGB value at `(x, y)`.  Out-of-range coordinates yield black.
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        if x >= self.width || y >= self.height {
            return [0, 0, 0];
        }
        let i = (y as usize * self.width as usize + x as usize) * 3;
        [self.data[i], self.data[i + 1], self.data[i + 2]]
    }

    /// Decode a JPEG (or any format the `image` crate was built with).
    ///
    /// # Errors
    ///
    /// Returns [`BodyError::Parsing`] when the bytes cannot be decoded.
    pub fn from_encoded(bytes: &[u8]) -> Result<Self, BodyError> {
        let rgb: RgbImage = image::load_from_memory(bytes)
            .map_err(|e| BodyError::Parsing(format!("camera image: {e}")))?
            .to_rgb8();
        let (width, height) = rgb.dimensions();
        Ok(Self {
            width,
            height,
            data: rgb.into_raw(),
        })
    }

    /// Encode as JPEG with the given quality (1–100).
    ///
    /// # Errors
    ///
    /// Returns [`BodyError::Parsing`] if encoding fails.
    pub fn to_jpeg(&self, quality: u8) -> Result<Vec<u8>, BodyError> {
        let mut out = Cursor::new(Vec::new());
        JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100))
            .encode(&self.data, self.width, self.height, ColorType::Rgb8)
            .map_err(|e| BodyError::Parsing(format!("jpeg encode: {e}")))?;
        Ok(out.into_inner())
    }
}

/// A camera or image-capture device.
///
/// Capture is blocking; the perception loop calls it from a dedicated worker
/// thread, never from the async scheduler.
pub trait Camera: Send {
    /// Stable identifier for this camera, e.g. `"head_rgb"`.
    fn id(&self) -> &str;

    /// Capture and return the next available frame.
    ///
    /// # Errors
    ///
    /// Returns [`BodyError::ResourceUnavailable`] if the device is
    /// disconnected, or [`BodyError::TransientIo`] for a single failed grab.
    fn capture(&mut self) -> Result<CameraFrame, BodyError>;
}
