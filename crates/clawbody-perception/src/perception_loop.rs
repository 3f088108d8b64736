//! [`PerceptionLoop`] – the fixed-rate camera scheduler.
//!
//! Each tick:
//!
//! 1. **Schedule** – if the capture worker is idle, hand it one request;
//!    otherwise the tick's frame is dropped and counted.  Frames are never
//!    queued, so a slow detector costs frames, not latency.
//! 2. **Observe** – the worker (a blocking thread that owns the camera and
//!    the detector) captures, detects, and sends back an [`Observation`].
//! 3. **Track** – the [`TrackingEstimator`] publishes the new
//!    [`TrackingState`].
//! 4. **Act** – the [`HeadController`] turns the observation into at most one
//!    `Tracking`-priority head-pose command for the dispatcher.
//!
//! Every `scene_every_ticks` ticks, or when [`PerceptionHandle::request_scene`]
//! is called, the worker also JPEG-encodes its frame and the loop sends it to
//! the [`SceneDescriber`].  At most one description is in flight and requests
//! are rate-limited with a [`governor`] quota.
//!
//! Losing the camera degrades to "no target": the head holds and tracking
//! confidence decays.  A `Degraded` alert is published on the transition.

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use clawbody_hal::Camera;
use clawbody_middleware::{EventBus, Topic};
use clawbody_types::{
    ActionCommand, ActionSink, ActionTarget, BodyError, EventPayload, Issuer, Priority,
    SceneDescription, TrackingState,
};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::detector::TargetDetector;
use crate::head_controller::{HeadControlConfig, HeadController, Observation};
use crate::scene::SceneDescriber;
use crate::tracking::{TrackingConfig, TrackingEstimator};

const SOURCE: &str = "clawbody-perception::perception_loop";

/// Highest accepted tick rate.  The tick period must stay at or above 1 ms.
pub const MAX_RATE_HZ: f32 = 1_000.0;

/// Whether `rate_hz` is a usable tick rate.
pub fn valid_rate(rate_hz: f32) -> bool {
    rate_hz.is_finite() && rate_hz > 0.0 && rate_hz <= MAX_RATE_HZ
}

#[derive(Debug, Clone)]
pub struct PerceptionConfig {
    /// Ticks per second, in `(0, MAX_RATE_HZ]`.
    pub rate_hz: f32,
    /// Describe the scene every this many ticks; `0` disables the periodic
    /// description (explicit requests still work).
    pub scene_every_ticks: u64,
    /// Minimum spacing between two scene descriptions.
    pub scene_min_interval: Duration,
    /// Upper bound on one scene description request.
    pub scene_timeout: Duration,
    /// JPEG quality (1-100) of frames sent for description.
    pub jpeg_quality: u8,
    /// Head-tracking control law.
    pub head: HeadControlConfig,
    /// Target confidence and decay.
    pub tracking: TrackingConfig,
}

impl Default for PerceptionConfig {
    fn default() -> Self {
        Self {
            rate_hz: 25.0,
            scene_every_ticks: 250,
            scene_min_interval: Duration::from_secs(5),
            scene_timeout: Duration::from_secs(20),
            jpeg_quality: 70,
            head: HeadControlConfig::default(),
            tracking: TrackingConfig::default(),
        }
    }
}

/// Point-in-time copy of the loop's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PerceptionCounters {
    pub ticks: u64,
    /// Observations returned by the worker.
    pub processed: u64,
    /// Ticks that found the worker busy.
    pub dropped: u64,
    pub scenes: u64,
}

#[derive(Default)]
struct Shared {
    ticks: AtomicU64,
    processed: AtomicU64,
    dropped: AtomicU64,
    scenes: AtomicU64,
    tracking_disabled: AtomicBool,
    scene_request: Notify,
}

/// Cheap, cloneable view of a running [`PerceptionLoop`].
#[derive(Clone)]
pub struct PerceptionHandle {
    shared: Arc<Shared>,
    tracking: watch::Receiver<TrackingState>,
    scene: watch::Receiver<Option<SceneDescription>>,
}

impl PerceptionHandle {
    pub fn tracking(&self) -> TrackingState {
        *self.tracking.borrow()
    }

    pub fn subscribe_tracking(&self) -> watch::Receiver<TrackingState> {
        self.tracking.clone()
    }

    /// Most recent scene description, if any has completed.
    pub fn scene(&self) -> Option<SceneDescription> {
        self.scene.borrow().clone()
    }

    pub fn subscribe_scene(&self) -> watch::Receiver<Option<SceneDescription>> {
        self.scene.clone()
    }

    /// Ask for a scene description on the next frame, subject to the rate
    /// limit.
    pub fn request_scene(&self) {
        self.shared.scene_request.notify_one();
    }

    /// Pause or resume head tracking.  Detection and the tracking state keep
    /// running while paused.
    pub fn set_tracking_enabled(&self, enabled: bool) {
        self.shared.tracking_disabled.store(!enabled, Ordering::Relaxed);
    }

    pub fn counters(&self) -> PerceptionCounters {
        PerceptionCounters {
            ticks: self.shared.ticks.load(Ordering::Relaxed),
            processed: self.shared.processed.load(Ordering::Relaxed),
            dropped: self.shared.dropped.load(Ordering::Relaxed),
            scenes: self.shared.scenes.load(Ordering::Relaxed),
        }
    }
}

struct WorkRequest {
    encode_frame: bool,
}

struct WorkResult {
    observation: Observation,
    jpeg: Option<Vec<u8>>,
    captured_at: DateTime<Utc>,
    camera_error: Option<BodyError>,
}

pub struct PerceptionLoop {
    config: PerceptionConfig,
    camera: Box<dyn Camera>,
    detector: Box<dyn TargetDetector>,
    sink: Arc<dyn ActionSink>,
    describer: Option<Arc<dyn SceneDescriber>>,
    bus: Option<EventBus>,
}

impl PerceptionLoop {
    pub fn new(
        config: PerceptionConfig,
        camera: Box<dyn Camera>,
        detector: Box<dyn TargetDetector>,
        sink: Arc<dyn ActionSink>,
    ) -> Self {
        Self {
            config,
            camera,
            detector,
            sink,
            describer: None,
            bus: None,
        }
    }

    pub fn with_describer(mut self, describer: Arc<dyn SceneDescriber>) -> Self {
        self.describer = Some(describer);
        self
    }

    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Start the worker thread and the tick task.
    ///
    /// The returned task finishes after `cancel` fires and the worker has
    /// released the camera.
    ///
    /// # Errors
    ///
    /// Returns [`BodyError::Config`] for a rate outside `(0, MAX_RATE_HZ]` or
    /// a zero scene interval.
    pub fn spawn(
        self,
        cancel: CancellationToken,
    ) -> Result<(PerceptionHandle, JoinHandle<()>), BodyError> {
        if !valid_rate(self.config.rate_hz) {
            return Err(BodyError::Config(format!(
                "perception rate must be in (0, {MAX_RATE_HZ}] Hz, got {}",
                self.config.rate_hz
            )));
        }
        let period = Duration::from_secs_f32(1.0 / self.config.rate_hz);
        let quota = Quota::with_period(self.config.scene_min_interval).ok_or_else(|| {
            BodyError::Config("scene_min_interval must be non-zero".to_string())
        })?;

        let shared = Arc::new(Shared::default());
        let (estimator, tracking_rx) = TrackingEstimator::new(self.config.tracking);
        let (scene_tx, scene_rx) = watch::channel(None);
        let handle = PerceptionHandle {
            shared: Arc::clone(&shared),
            tracking: tracking_rx,
            scene: scene_rx,
        };

        let (work_tx, work_rx) = mpsc::channel(1);
        let (result_tx, result_rx) = mpsc::unbounded_channel();
        let busy = Arc::new(AtomicBool::new(false));
        let worker = {
            let busy = Arc::clone(&busy);
            let quality = self.config.jpeg_quality;
            let camera = self.camera;
            let detector = self.detector;
            tokio::task::spawn_blocking(move || {
                run_worker(camera, detector, work_rx, result_tx, busy, quality)
            })
        };

        let state = LoopState {
            head: HeadController::new(self.config.head),
            estimator,
            sink: self.sink,
            describer: self.describer,
            bus: self.bus,
            shared,
            scene_tx: Arc::new(scene_tx),
            limiter: RateLimiter::direct(quota),
            scene_every_ticks: self.config.scene_every_ticks,
            scene_timeout: self.config.scene_timeout,
            scene_wanted: false,
            scene_task: None,
            last_result: None,
            camera_ok: true,
        };

        let task = tokio::spawn(state.run(period, cancel, work_tx, result_rx, busy, worker));
        Ok((handle, task))
    }
}

/// Blocking capture/detect loop.  Owns the camera until the request channel
/// closes.
fn run_worker(
    mut camera: Box<dyn Camera>,
    mut detector: Box<dyn TargetDetector>,
    mut requests: mpsc::Receiver<WorkRequest>,
    results: mpsc::UnboundedSender<WorkResult>,
    busy: Arc<AtomicBool>,
    jpeg_quality: u8,
) {
    while let Some(request) = requests.blocking_recv() {
        let captured_at = Utc::now();
        let result = match camera.capture() {
            Ok(frame) => {
                let observation = match detector.detect(&frame) {
                    Ok(Some(detection)) => Observation::Target(detection),
                    Ok(None) => Observation::NoTarget,
                    Err(e) => {
                        warn!(error = %e, "detector failed; treating frame as empty");
                        Observation::NoTarget
                    }
                };
                let jpeg = if request.encode_frame {
                    frame
                        .to_jpeg(jpeg_quality)
                        .map_err(|e| warn!(error = %e, "jpeg encode failed"))
                        .ok()
                } else {
                    None
                };
                WorkResult {
                    observation,
                    jpeg,
                    captured_at,
                    camera_error: None,
                }
            }
            Err(e) => WorkResult {
                observation: Observation::CameraLost,
                jpeg: None,
                captured_at,
                camera_error: Some(e),
            },
        };
        busy.store(false, Ordering::Release);
        if results.send(result).is_err() {
            break;
        }
    }
    debug!(camera = camera.id(), "perception worker released camera");
}

struct LoopState {
    head: HeadController,
    estimator: TrackingEstimator,
    sink: Arc<dyn ActionSink>,
    describer: Option<Arc<dyn SceneDescriber>>,
    bus: Option<EventBus>,
    shared: Arc<Shared>,
    scene_tx: Arc<watch::Sender<Option<SceneDescription>>>,
    limiter: DefaultDirectRateLimiter,
    scene_every_ticks: u64,
    scene_timeout: Duration,
    scene_wanted: bool,
    scene_task: Option<JoinHandle<()>>,
    last_result: Option<Instant>,
    camera_ok: bool,
}

impl LoopState {
    async fn run(
        mut self,
        period: Duration,
        cancel: CancellationToken,
        work_tx: mpsc::Sender<WorkRequest>,
        mut results: mpsc::UnboundedReceiver<WorkResult>,
        busy: Arc<AtomicBool>,
        worker: JoinHandle<()>,
    ) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(period_ms = period.as_millis() as u64, "perception loop started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let tick = self.shared.ticks.fetch_add(1, Ordering::Relaxed) + 1;
                    if self.scene_every_ticks > 0 && tick % self.scene_every_ticks == 0 {
                        self.scene_wanted = true;
                    }
                    if busy.load(Ordering::Acquire) {
                        self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                    let encode_frame = self.scene_ready();
                    busy.store(true, Ordering::Release);
                    if work_tx.try_send(WorkRequest { encode_frame }).is_err() {
                        busy.store(false, Ordering::Release);
                        self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                }
                _ = self.shared.scene_request.notified() => {
                    self.scene_wanted = true;
                }
                result = results.recv() => match result {
                    Some(result) => self.handle_result(result),
                    None => {
                        warn!("perception worker exited unexpectedly");
                        break;
                    }
                },
            }
        }

        drop(work_tx);
        if let Some(task) = self.scene_task.take() {
            task.abort();
        }
        if let Err(e) = worker.await {
            warn!(error = %e, "perception worker panicked");
        }
        info!("perception loop stopped");
    }

    /// Whether the next frame should be encoded for the describer.
    fn scene_ready(&self) -> bool {
        self.scene_wanted
            && self.describer.is_some()
            && !self.scene_in_flight()
            && self.limiter.check().is_ok()
    }

    fn scene_in_flight(&self) -> bool {
        self.scene_task.as_ref().is_some_and(|t| !t.is_finished())
    }

    fn handle_result(&mut self, result: WorkResult) {
        self.shared.processed.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        let dt = self
            .last_result
            .map_or(0.0, |prev| now.duration_since(prev).as_secs_f32());
        self.last_result = Some(now);

        match (&result.camera_error, self.camera_ok) {
            (Some(e), true) => {
                self.camera_ok = false;
                warn!(error = %e, "camera lost; holding head position");
                if let Some(bus) = &self.bus {
                    bus.emit(
                        Topic::SystemAlerts,
                        SOURCE,
                        EventPayload::Degraded {
                            component: "camera".to_string(),
                            reason: e.to_string(),
                        },
                    );
                }
            }
            (None, false) => {
                self.camera_ok = true;
                info!("camera recovered");
            }
            _ => {}
        }

        let detection = match result.observation {
            Observation::Target(d) => Some(d),
            _ => None,
        };
        self.estimator.observe(detection, dt);

        if !self.shared.tracking_disabled.load(Ordering::Relaxed) {
            if let Some(pose) = self.head.step(&result.observation, now, dt) {
                let command =
                    ActionCommand::new(ActionTarget::HeadPose(pose), Priority::Tracking, Issuer::Perception);
                if let Err(e) = self.sink.submit(command) {
                    debug!(error = %e, "head command not accepted");
                }
            }
        }

        if let (Some(jpeg), Some(describer)) = (result.jpeg, &self.describer) {
            self.scene_wanted = false;
            self.scene_task = Some(spawn_describe(
                Arc::clone(describer),
                jpeg,
                result.captured_at,
                self.scene_timeout,
                Arc::clone(&self.scene_tx),
                self.bus.clone(),
                Arc::clone(&self.shared),
            ));
        }
    }
}

fn spawn_describe(
    describer: Arc<dyn SceneDescriber>,
    jpeg: Vec<u8>,
    captured_at: DateTime<Utc>,
    timeout: Duration,
    scene_tx: Arc<watch::Sender<Option<SceneDescription>>>,
    bus: Option<EventBus>,
    shared: Arc<Shared>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        match tokio::time::timeout(timeout, describer.describe(jpeg)).await {
            Ok(Ok(text)) if !text.trim().is_empty() => {
                let description = SceneDescription {
                    text: text.trim().to_string(),
                    captured_at,
                };
                debug!(scene = %description.text, "scene described");
                scene_tx.send_replace(Some(description.clone()));
                shared.scenes.fetch_add(1, Ordering::Relaxed);
                if let Some(bus) = bus {
                    bus.emit(
                        Topic::Perception,
                        SOURCE,
                        EventPayload::SceneDescribed(description),
                    );
                }
            }
            Ok(Ok(_)) => debug!("scene describer returned nothing"),
            Ok(Err(e)) => warn!(error = %e, "scene description failed"),
            Err(_) => warn!(timeout_s = timeout.as_secs(), "scene description timed out"),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use clawbody_hal::{CameraFrame, SimCamera};
    use clawbody_types::{Detection, HeadPose, TargetPoint};

    use crate::detector::BrightSpotDetector;

    #[derive(Default)]
    struct RecordingSink {
        commands: Mutex<Vec<ActionCommand>>,
    }

    impl RecordingSink {
        fn head_poses(&self) -> Vec<HeadPose> {
            self.commands
                .lock()
                .unwrap()
                .iter()
                .filter_map(|c| match &c.target {
                    ActionTarget::HeadPose(p) => Some(*p),
                    _ => None,
                })
                .collect()
        }
    }

    impl ActionSink for RecordingSink {
        fn submit(&self, command: ActionCommand) -> Result<(), BodyError> {
            self.commands.lock().unwrap().push(command);
            Ok(())
        }
    }

    struct SlowDetector(Duration);

    impl TargetDetector for SlowDetector {
        fn detect(&mut self, _frame: &CameraFrame) -> Result<Option<Detection>, BodyError> {
            std::thread::sleep(self.0);
            Ok(None)
        }
    }

    struct DropFlagCamera {
        inner: SimCamera,
        released: Arc<AtomicBool>,
    }

    impl Camera for DropFlagCamera {
        fn id(&self) -> &str {
            "drop_flag"
        }

        fn capture(&mut self) -> Result<CameraFrame, BodyError> {
            self.inner.capture()
        }
    }

    impl Drop for DropFlagCamera {
        fn drop(&mut self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    struct FixedDescriber;

    #[async_trait]
    impl SceneDescriber for FixedDescriber {
        async fn describe(&self, jpeg: Vec<u8>) -> Result<String, BodyError> {
            assert!(!jpeg.is_empty());
            Ok("a person waving at the robot".to_string())
        }
    }

    fn fast_config() -> PerceptionConfig {
        PerceptionConfig {
            rate_hz: 50.0,
            scene_every_ticks: 0,
            scene_min_interval: Duration::from_millis(100),
            ..PerceptionConfig::default()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn slow_detector_drops_frames_instead_of_queueing() {
        let (camera, _control) = SimCamera::new(32, 24);
        let sink = Arc::new(RecordingSink::default());
        let cancel = CancellationToken::new();
        let (handle, task) = PerceptionLoop::new(
            fast_config(),
            Box::new(camera),
            Box::new(SlowDetector(Duration::from_millis(150))),
            sink,
        )
        .spawn(cancel.clone())
        .unwrap();

        tokio::time::sleep(Duration::from_millis(700)).await;
        cancel.cancel();
        task.await.unwrap();

        let c = handle.counters();
        assert!(c.dropped > 0, "{c:?}");
        assert!(c.processed < c.ticks, "{c:?}");
        assert!(c.processed <= 6, "{c:?}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn head_follows_pinned_target() {
        let (camera, control) = SimCamera::new(80, 60);
        control.pin(Some(TargetPoint { x: 0.6, y: 0.0 }));
        let sink = Arc::new(RecordingSink::default());
        let cancel = CancellationToken::new();
        let (handle, task) = PerceptionLoop::new(
            fast_config(),
            Box::new(camera),
            Box::new(BrightSpotDetector::default()),
            Arc::clone(&sink) as Arc<dyn ActionSink>,
        )
        .spawn(cancel.clone())
        .unwrap();

        let mut updates = handle.subscribe_tracking();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(updates.has_changed().unwrap());
        let tracking = *updates.borrow_and_update();
        cancel.cancel();
        task.await.unwrap();

        let target = tracking.target.expect("target tracked");
        assert!(target.x > 0.4);
        let poses = sink.head_poses();
        assert!(!poses.is_empty());
        assert!(poses.iter().all(|p| p.yaw_rad < 0.0));
        assert!(sink
            .commands
            .lock()
            .unwrap()
            .iter()
            .all(|c| c.priority == Priority::Tracking && c.issuer == Issuer::Perception));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn camera_loss_holds_head_and_decays_confidence() {
        let (camera, control) = SimCamera::new(80, 60);
        control.pin(Some(TargetPoint { x: -0.5, y: 0.0 }));
        let sink = Arc::new(RecordingSink::default());
        let bus = EventBus::default();
        let mut alerts = bus.subscribe_to(Topic::SystemAlerts);
        let cancel = CancellationToken::new();
        let (handle, task) = PerceptionLoop::new(
            fast_config(),
            Box::new(camera),
            Box::new(BrightSpotDetector::default()),
            Arc::clone(&sink) as Arc<dyn ActionSink>,
        )
        .with_bus(bus)
        .spawn(cancel.clone())
        .unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(handle.tracking().target.is_some());

        control.disconnect();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let issued = sink.head_poses().len();
        tokio::time::sleep(Duration::from_millis(1200)).await;

        let tracking = handle.tracking();
        assert!(tracking.target.is_none());
        assert_eq!(tracking.confidence, 0.0);
        assert_eq!(sink.head_poses().len(), issued);

        let alert = tokio::time::timeout(Duration::from_secs(1), alerts.next_event())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(alert.payload, EventPayload::Degraded { ref component, .. } if component == "camera"));

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn tracking_can_be_paused() {
        let (camera, control) = SimCamera::new(80, 60);
        control.pin(Some(TargetPoint { x: 0.6, y: 0.3 }));
        let sink = Arc::new(RecordingSink::default());
        let cancel = CancellationToken::new();
        let (handle, task) = PerceptionLoop::new(
            fast_config(),
            Box::new(camera),
            Box::new(BrightSpotDetector::default()),
            Arc::clone(&sink) as Arc<dyn ActionSink>,
        )
        .spawn(cancel.clone())
        .unwrap();
        handle.set_tracking_enabled(false);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(handle.tracking().target.is_some());
        assert!(sink.head_poses().is_empty());

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn requested_scene_is_published() {
        let (camera, _control) = SimCamera::new(64, 48);
        let bus = EventBus::default();
        let mut perception = bus.subscribe_to(Topic::Perception);
        let cancel = CancellationToken::new();
        let (handle, task) = PerceptionLoop::new(
            fast_config(),
            Box::new(camera),
            Box::new(BrightSpotDetector::default()),
            Arc::new(RecordingSink::default()),
        )
        .with_describer(Arc::new(FixedDescriber))
        .with_bus(bus)
        .spawn(cancel.clone())
        .unwrap();

        let mut scenes = handle.subscribe_scene();
        handle.request_scene();
        tokio::time::timeout(Duration::from_secs(2), scenes.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            handle.scene().unwrap().text,
            "a person waving at the robot"
        );

        let event = tokio::time::timeout(Duration::from_secs(1), perception.next_event())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event.payload, EventPayload::SceneDescribed(_)));
        assert_eq!(handle.counters().scenes, 1);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancel_releases_camera() {
        let (inner, _control) = SimCamera::new(16, 16);
        let released = Arc::new(AtomicBool::new(false));
        let camera = DropFlagCamera {
            inner,
            released: Arc::clone(&released),
        };
        let cancel = CancellationToken::new();
        let (_handle, task) = PerceptionLoop::new(
            fast_config(),
            Box::new(camera),
            Box::new(BrightSpotDetector::default()),
            Arc::new(RecordingSink::default()),
        )
        .spawn(cancel.clone())
        .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!released.load(Ordering::SeqCst));
        cancel.cancel();
        task.await.unwrap();
        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn rates_are_bounded() {
        assert!(valid_rate(25.0));
        assert!(valid_rate(MAX_RATE_HZ));
        assert!(!valid_rate(0.0));
        assert!(!valid_rate(f32::NAN));
        assert!(!valid_rate(1e12));
    }

    #[test]
    fn excessive_rate_is_rejected_instead_of_spinning() {
        let (camera, _control) = SimCamera::new(8, 8);
        let config = PerceptionConfig {
            rate_hz: 1e12,
            ..PerceptionConfig::default()
        };
        let result = PerceptionLoop::new(
            config,
            Box::new(camera),
            Box::new(BrightSpotDetector::default()),
            Arc::new(RecordingSink::default()),
        )
        .spawn(CancellationToken::new());
        assert!(matches!(result, Err(BodyError::Config(_))));
    }

    #[test]
    fn invalid_rate_is_rejected() {
        let (camera, _control) = SimCamera::new(8, 8);
        let config = PerceptionConfig {
            rate_hz: 0.0,
            ..PerceptionConfig::default()
        };
        let result = PerceptionLoop::new(
            config,
            Box::new(camera),
            Box::new(BrightSpotDetector::default()),
            Arc::new(RecordingSink::default()),
        )
        .spawn(CancellationToken::new());
        assert!(matches!(result, Err(BodyError::Config(_))));
    }
}
