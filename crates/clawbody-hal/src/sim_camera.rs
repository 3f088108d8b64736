//! Synthetic camera for simulation mode.
//!
//! Renders a dark frame with one bright disk standing in for a face.  The
//! disk wanders along a slow Lissajous path unless pinned through
//! [`SimCameraControl`], which can also hide it or unplug the camera.

use std::sync::{Arc, Mutex};

use clawbody_types::{BodyError, TargetPoint};

use crate::camera::{Camera, CameraFrame};

const BACKGROUND: u8 = 30;
const TARGET: u8 = 255;

#[derive(Debug)]
struct Scene {
    connected: bool,
    visible: bool,
    pinned: Option<TargetPoint>,
}

/// Remote control for a running [`SimCamera`].
#[derive(Clone, Debug)]
pub struct SimCameraControl {
    scene: Arc<Mutex<Scene>>,
}

impl SimCameraControl {
    pub fn disconnect(&self) {
        self.with(|s| s.connected = false);
    }

    pub fn reconnect(&self) {
        self.with(|s| s.connected = true);
    }

    /// Hide or show the target.
    pub fn set_visible(&self, visible: bool) {
        self.with(|s| s.visible = visible);
    }

    /// Pin the target to `point`, or resume wandering with `None`.
    pub fn pin(&self, point: Option<TargetPoint>) {
        self.with(|s| s.pinned = point);
    }

    fn with(&self, f: impl FnOnce(&mut Scene)) {
        let mut scene = self.scene.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut scene);
    }
}

/// A camera that draws its own frames.
pub struct SimCamera {
    width: u32,
    height: u32,
    frame_count: u64,
    scene: Arc<Mutex<Scene>>,
}

impl SimCamera {
    pub fn new(width: u32, height: u32) -> (Self, SimCameraControl) {
        let scene = Arc::new(Mutex::new(Scene {
            connected: true,
            visible: true,
            pinned: None,
        }));
        let control = SimCameraControl {
            scene: Arc::clone(&scene),
        };
        (
            Self {
                width: width.max(1),
                height: height.max(1),
                frame_count: 0,
                scene,
            },
            control,
        )
    }

    fn wander(&self) -> TargetPoint {
        let t = self.frame_count as f32 / 25.0;
        TargetPoint {
            x: 0.5 * (t * 0.7).sin(),
            y: 0.3 * (t * 1.1).sin(),
        }
    }

    fn render(&self, target: Option<TargetPoint>) -> CameraFrame {
        let (w, h) = (self.width, self.height);
        let mut data = vec![BACKGROUND; w as usize * h as usize * 3];
        if let Some(p) = target {
            let cx = (p.x + 1.0) * 0.5 * w as f32;
            let cy = (p.y + 1.0) * 0.5 * h as f32;
            let radius = (h as f32 / 10.0).max(1.0);
            for y in 0..h {
                for x in 0..w {
                    let (dx, dy) = (x as f32 + 0.5 - cx, y as f32 + 0.5 - cy);
                    if dx * dx + dy * dy <= radius * radius {
                        let i = (y as usize * w as usize + x as usize) * 3;
                        data[i..i + 3].fill(TARGET);
                    }
                }
            }
        }
        CameraFrame {
            width: w,
            height: h,
            data,
        }
    }
}

impl Camera for SimCamera {
    fn id(&self) -> &str {
        "sim_rgb"
    }

    fn capture(&mut self) -> Result<CameraFrame, BodyError> {
        let (connected, visible, pinned) = {
            let scene = self.scene.lock().unwrap_or_else(|p| p.into_inner());
            (scene.connected, scene.visible, scene.pinned)
        };
        if !connected {
            return Err(BodyError::ResourceUnavailable("sim camera unplugged".into()));
        }
        self.frame_count += 1;
        let target = visible.then(|| pinned.unwrap_or_else(|| self.wander()));
        Ok(self.render(target))
    }
}
