//! Target detectors.
//!
//! A [`TargetDetector`] looks at one [`CameraFrame`] and reports the most
//! prominent target, if any.  Detection is blocking and runs on the
//! perception worker thread next to the camera.

use std::time::Duration;

use clawbody_hal::CameraFrame;
use clawbody_types::{BodyError, Detection, TargetPoint};
use serde::Deserialize;

pub trait TargetDetector: Send {
    /// # Errors
    ///
    /// Returns a [`BodyError`] when the detector itself fails; "nothing in
    /// view" is `Ok(None)`.
    fn detect(&mut self, frame: &CameraFrame) -> Result<Option<Detection>, BodyError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Bright-spot detector
// ─────────────────────────────────────────────────────────────────────────────

/// Finds the centroid of the bright pixels in a frame.
///
/// Pairs with [`SimCamera`][clawbody_hal::SimCamera], which renders its
/// "face" as a bright disk on a dark background.
#[derive(Debug, Clone)]
pub struct BrightSpotDetector {
    /// Luma at or above which a pixel counts as part of the target.
    pub threshold: u8,
    /// Fewer bright pixels than this is treated as noise.
    pub min_pixels: usize,
    /// Sample every `stride`-th pixel in each direction.
    pub stride: u32,
}

impl Default for BrightSpotDetector {
    fn default() -> Self {
        Self {
            threshold: 220,
            min_pixels: 4,
            stride: 2,
        }
    }
}

impl TargetDetector for BrightSpotDetector {
    fn detect(&mut self, frame: &CameraFrame) -> Result<Option<Detection>, BodyError> {
        let stride = self.stride.max(1);
        let (mut sum_x, mut sum_y, mut count) = (0f64, 0f64, 0usize);
        for y in (0..frame.height).step_by(stride as usize) {
            for x in (0..frame.width).step_by(stride as usize) {
                let [r, g, b] = frame.pixel(x, y);
                let luma = (u32::from(r) * 299 + u32::from(g) * 587 + u32::from(b) * 114) / 1000;
                if luma >= u32::from(self.threshold) {
                    sum_x += f64::from(x) + 0.5;
                    sum_y += f64::from(y) + 0.5;
                    count += 1;
                }
            }
        }
        if count < self.min_pixels.max(1) {
            return Ok(None);
        }
        let cx = sum_x / count as f64;
        let cy = sum_y / count as f64;
        Ok(Some(Detection {
            point: TargetPoint {
                x: (cx / f64::from(frame.width) * 2.0 - 1.0) as f32,
                y: (cy / f64::from(frame.height) * 2.0 - 1.0) as f32,
            },
            confidence: (count as f32 / (self.min_pixels.max(1) * 4) as f32).min(1.0),
        }))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Remote detector
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct DetectResponse {
    #[serde(default)]
    targets: Vec<RemoteTarget>,
}

#[derive(Deserialize)]
struct RemoteTarget {
    x: f32,
    y: f32,
    confidence: f32,
}

/// Posts each frame as JPEG to a face-detection service and reads back
/// `{"targets":[{"x":..,"y":..,"confidence":..}]}` with coordinates already
/// normalised to `[-1, 1]`.
pub struct RemoteDetector {
    url: String,
    jpeg_quality: u8,
    client: reqwest::blocking::Client,
}

impl RemoteDetector {
    /// # Errors
    ///
    /// Returns [`BodyError::Config`] if the HTTP client cannot be built.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, BodyError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BodyError::Config(format!("detector http client: {e}")))?;
        Ok(Self {
            url: url.into(),
            jpeg_quality: 70,
            client,
        })
    }
}

/// The most confident target, clamped into the frame.
fn best_target(targets: Vec<RemoteTarget>) -> Option<Detection> {
    targets
        .into_iter()
        .filter(|t| t.x.is_finite() && t.y.is_finite() && t.confidence.is_finite())
        .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
        .map(|t| Detection {
            point: TargetPoint {
                x: t.x.clamp(-1.0, 1.0),
                y: t.y.clamp(-1.0, 1.0),
            },
            confidence: t.confidence.clamp(0.0, 1.0),
        })
}

impl TargetDetector for RemoteDetector {
    fn detect(&mut self, frame: &CameraFrame) -> Result<Option<Detection>, BodyError> {
        let jpeg = frame.to_jpeg(self.jpeg_quality)?;
        let response: DetectResponse = self
            .client
            .post(&self.url)
            .header("Content-Type", "image/jpeg")
            .body(jpeg)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| BodyError::ExternalService {
                service: "detector".to_string(),
                details: e.to_string(),
            })?
            .json()
            .map_err(|e| BodyError::Parsing(format!("detector response: {e}")))?;
        Ok(best_target(response.targets))
    }
}
