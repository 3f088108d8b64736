//! `clawbody-hal` – Hardware Abstraction Layer
//!
//! - [`camera`] – the [`Camera`] trait, [`CameraFrame`] and JPEG helpers.
//! - [`sim_camera`] – a synthetic camera rendering a moving bright target.
//! - [`daemon_camera`] – snapshot camera backed by the robot daemon.
//! - [`pid`] – generic PID controller used for head tracking.

pub mod camera;
pub mod daemon_camera;
pub mod pid;
pub mod sim_camera;

pub use camera::{Camera, CameraFrame};
pub use daemon_camera::DaemonCamera;
pub use pid::PidController;
pub use sim_camera::{SimCamera, SimCameraControl};
