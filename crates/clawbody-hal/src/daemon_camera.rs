//! Snapshot camera served by the robot daemon (`GET /api/camera/snapshot`).

use std::time::Duration;

use clawbody_types::BodyError;
use tracing::debug;

use crate::camera::{Camera, CameraFrame};

/// A [`Camera`] that fetches one encoded still per capture.
pub struct DaemonCamera {
    id: String,
    url: String,
    client: reqwest::blocking::Client,
}

impl DaemonCamera {
    /// `selector` names the device on the daemon (e.g. `"head"`); it is
    /// passed as the `camera` query parameter.
    ///
    /// # Errors
    ///
    /// Returns [`BodyError::Config`] if the HTTP client cannot be built.
    pub fn new(base_url: &str, selector: &str, timeout: Duration) -> Result<Self, BodyError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BodyError::Config(format!("camera http client: {e}")))?;
        Ok(Self {
            id: format!("daemon:{selector}"),
            url: format!(
                "{}/api/camera/snapshot?camera={selector}",
                base_url.trim_end_matches('/')
            ),
            client,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Camera for DaemonCamera {
    fn id(&self) -> &str {
        &self.id
    }

    fn capture(&mut self) -> Result<CameraFrame, BodyError> {
        let response = self.client.get(&self.url).send().map_err(|e| {
            if e.is_connect() {
                BodyError::ResourceUnavailable(format!("{}: {e}", self.id))
            } else {
                BodyError::TransientIo {
                    component: self.id.clone(),
                    details: e.to_string(),
                }
            }
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(BodyError::ResourceUnavailable(format!(
                "{} returned {status}",
                self.id
            )));
        }
        let bytes = response.bytes().map_err(|e| BodyError::TransientIo {
            component: self.id.clone(),
            details: e.to_string(),
        })?;
        debug!(camera = %self.id, bytes = bytes.len(), "snapshot received");
        CameraFrame::from_encoded(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_includes_selector() {
        let cam = DaemonCamera::new("http://robot.local:8000/", "head", Duration::from_secs(1))
            .unwrap();
        assert_eq!(
            cam.url(),
            "http://robot.local:8000/api/camera/snapshot?camera=head"
        );
        assert_eq!(cam.id(), "daemon:head");
    }

    #[test]
    fn unreachable_daemon_reports_unavailable() {
        let mut cam =
            DaemonCamera::new("http://127.0.0.1:9", "head", Duration::from_millis(500)).unwrap();
        assert!(cam.capture().is_err());
    }
}
