use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use frame_settle_common::config::{Config, PreviewConfig, SettleConfig};
use frame_settle_common::{Frame, Location};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info};

use crate::broadcast::{ContinuousBroadcaster, FrameListener, PreviewSource, SubscriptionId};
use crate::error::{ConfigurationError, VisionError};
use crate::motion::{CompletionType, MachineState};
use crate::overlay::{DiagnosticOverlay, OverlaySink};
use crate::recorder::{SettleDiagnosticsRecorder, SettleRecording};
use crate::settle::{SettleAnalyzer, SettleResult};
use crate::source::FrameSource;
use crate::transform::ImageTransform;

/// How close a user-targeted location must be to a camera for the camera
/// to count as looking at it, mm.
pub const TARGETED_VIEW_RADIUS_MM: f64 = 50.0;

pub struct CameraBuilder {
    name: String,
    source: Option<Arc<dyn FrameSource>>,
    settle: SettleConfig,
    preview: PreviewConfig,
    transform: ImageTransform,
    units_per_pixel: (f64, f64),
    default_z: f64,
    machine: Option<Arc<dyn MachineState>>,
    overlay_sink: Option<Arc<dyn OverlaySink>>,
}

impl CameraBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: None,
            settle: SettleConfig::default(),
            preview: PreviewConfig::default(),
            transform: ImageTransform::default(),
            units_per_pixel: (0.03, 0.03),
            default_z: 0.0,
            machine: None,
            overlay_sink: None,
        }
    }

    /// Camera, settle and preview sections of a loaded config.
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.camera.name.clone())
            .settle(config.settle.clone())
            .preview(config.preview.clone())
            .transform(ImageTransform::from_config(&config.camera.transform))
            .units_per_pixel(config.camera.units_per_pixel_x, config.camera.units_per_pixel_y)
            .default_z(config.camera.default_z)
    }

    pub fn source(mut self, source: Arc<dyn FrameSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn settle(mut self, settle: SettleConfig) -> Self {
        self.settle = settle;
        self
    }

    pub fn preview(mut self, preview: PreviewConfig) -> Self {
        self.preview = preview;
        self
    }

    pub fn transform(mut self, transform: ImageTransform) -> Self {
        self.transform = transform;
        self
    }

    pub fn units_per_pixel(mut self, x: f64, y: f64) -> Self {
        self.units_per_pixel = (x, y);
        self
    }

    pub fn default_z(mut self, z: f64) -> Self {
        self.default_z = z;
        self
    }

    pub fn machine(mut self, machine: Arc<dyn MachineState>) -> Self {
        self.machine = Some(machine);
        self
    }

    pub fn overlay_sink(mut self, sink: Arc<dyn OverlaySink>) -> Self {
        self.overlay_sink = Some(sink);
        self
    }

    /// A missing frame source is not an error here; it surfaces at the
    /// first capture.
    pub fn build(self) -> Result<Camera, ConfigurationError> {
        let (ux, uy) = self.units_per_pixel;
        if !(ux > 0.0 && uy > 0.0) {
            return Err(ConfigurationError::InvalidParameter(format!(
                "camera {} units per pixel must be > 0, got ({ux}, {uy})",
                self.name
            )));
        }
        let settle = self.settle.normalized();
        let recorder =
            SettleDiagnosticsRecorder::new(&self.name, settle.diagnostics, settle.diagnostics_dir.clone());
        let join_timeout = Duration::from_millis(self.preview.join_timeout_ms);

        let inner = Arc::new_cyclic(|weak: &Weak<CameraInner>| {
            let preview_source: Weak<dyn PreviewSource> = weak.clone();
            let broadcaster = ContinuousBroadcaster::new(&self.name, preview_source, join_timeout);
            broadcaster.set_machine(self.machine.clone());
            broadcaster.set_suspend_in_tasks(self.preview.suspend_in_tasks);
            CameraInner {
                name: self.name,
                source: self.source,
                transform: self.transform,
                session: Mutex::new(false),
                analyzer: RwLock::new(SettleAnalyzer::new(settle)),
                recorder,
                broadcaster,
                preview: self.preview,
                units_per_pixel: self.units_per_pixel,
                default_z: self.default_z,
                machine: self.machine,
                overlay_sink: self.overlay_sink,
                capturing_view: AtomicBool::new(false),
            }
        });
        Ok(Camera { inner })
    }
}

struct CameraInner {
    name: String,
    source: Option<Arc<dyn FrameSource>>,
    transform: ImageTransform,
    /// Whether the device session is open. Held across open, close and
    /// reinitialize so only one session exists per device.
    session: Mutex<bool>,
    analyzer: RwLock<SettleAnalyzer>,
    recorder: SettleDiagnosticsRecorder,
    broadcaster: ContinuousBroadcaster,
    preview: PreviewConfig,
    units_per_pixel: (f64, f64),
    default_z: f64,
    machine: Option<Arc<dyn MachineState>>,
    overlay_sink: Option<Arc<dyn OverlaySink>>,
    capturing_view: AtomicBool,
}

impl CameraInner {
    fn source(&self) -> Result<&Arc<dyn FrameSource>, ConfigurationError> {
        self.source
            .as_ref()
            .ok_or_else(|| ConfigurationError::MissingFrameSource {
                camera: self.name.clone(),
            })
    }

    fn ensure_open(&self) -> Result<(), VisionError> {
        let source = self.source()?;
        let mut open = self.session.lock();
        if !*open {
            source.open()?;
            *open = true;
            info!(camera = %self.name, "capture session opened");
        }
        Ok(())
    }

    /// Capture and transform, without offering to the preview.
    fn capture_transformed(&self) -> Result<Frame, VisionError> {
        let source = self.source()?;
        self.ensure_open()?;
        let frame = source.capture()?;
        Ok(self.transform.apply(frame))
    }

    fn capture(&self) -> Result<Arc<Frame>, VisionError> {
        let frame = Arc::new(self.capture_transformed()?);
        self.broadcaster.offer(frame.clone());
        Ok(frame)
    }
}

impl PreviewSource for CameraInner {
    fn capture_preview(&self) -> Result<Arc<Frame>, VisionError> {
        Ok(Arc::new(self.capture_transformed()?))
    }

    fn has_new_frame(&self) -> bool {
        self.source.as_ref().is_some_and(|s| s.has_new_frame())
    }
}

/// A camera: a frame source with transform, settle detection, settle
/// diagnostics and a preview broadcaster.
///
/// Cheap to clone; clones share the device and the preview thread.
#[derive(Clone)]
pub struct Camera {
    inner: Arc<CameraInner>,
}

impl Camera {
    pub fn builder(name: impl Into<String>) -> CameraBuilder {
        CameraBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Millimeters per pixel at the default Z, `(x, y)`.
    pub fn units_per_pixel(&self) -> (f64, f64) {
        self.inner.units_per_pixel
    }

    pub fn default_z(&self) -> f64 {
        self.inner.default_z
    }

    /// Size of the transformed frames.
    pub fn resolution(&self) -> Result<(u32, u32), ConfigurationError> {
        let (w, h) = self.inner.source()?.resolution();
        Ok(self.inner.transform.output_resolution(w, h))
    }

    pub fn broadcaster(&self) -> &ContinuousBroadcaster {
        &self.inner.broadcaster
    }

    /// Capture one transformed frame. The frame is also offered to the
    /// preview so it does not need to capture again.
    pub fn capture(&self) -> Result<Arc<Frame>, VisionError> {
        self.inner.capture()
    }

    /// Wait for the machine to stand still, then settle and capture.
    pub fn settle_and_capture(&self) -> Result<SettleResult, VisionError> {
        if let Some(machine) = &self.inner.machine {
            machine.wait_for_completion(CompletionType::WaitForStillstand)?;
        }
        let result = self
            .inner
            .analyzer
            .read()
            .settle(|| self.inner.capture_transformed(), Some(&self.inner.recorder))?;
        self.inner.broadcaster.offer(result.frame.clone());
        Ok(result)
    }

    pub fn settle_config(&self) -> SettleConfig {
        self.inner.analyzer.read().config().clone()
    }

    pub fn set_settle_config(&self, config: SettleConfig) {
        self.inner.recorder.set_enabled(config.diagnostics);
        *self.inner.analyzer.write() = SettleAnalyzer::new(config);
    }

    pub fn set_settle_diagnostics(&self, enabled: bool) {
        self.inner.recorder.set_enabled(enabled);
    }

    /// Recording of the last settle cycle, if diagnostics are on.
    pub fn settle_recording(&self) -> Option<Arc<SettleRecording>> {
        self.inner.recorder.latest()
    }

    /// Show the recorded settle frame at `t` as a heat map overlay.
    pub fn play_settle_recording(&self, t: Duration) -> bool {
        match self.inner.recorder.playback(t) {
            Some(overlay) => {
                self.show_overlay(overlay);
                true
            }
            None => false,
        }
    }

    pub fn show_overlay(&self, overlay: DiagnosticOverlay) {
        if let Some(sink) = &self.inner.overlay_sink {
            sink.show_diagnostic_overlay(overlay);
        }
    }

    // -- Device session -------------------------------------------------------

    pub fn open(&self) -> Result<(), VisionError> {
        self.inner.ensure_open()
    }

    pub fn is_open(&self) -> bool {
        *self.inner.session.lock()
    }

    /// Stop the preview and release the device.
    pub fn close(&self) {
        self.inner.broadcaster.stop();
        let mut open = self.inner.session.lock();
        if *open {
            if let Some(source) = &self.inner.source {
                source.close();
            }
            *open = false;
            info!(camera = %self.inner.name, "capture session closed");
        }
    }

    /// Reopen the device, e.g. after its settings changed. The preview is
    /// restarted when it still has subscribers.
    pub fn reinitialize(&self) -> Result<(), VisionError> {
        let source = self.inner.source()?;
        self.inner.broadcaster.stop();
        {
            let mut open = self.inner.session.lock();
            if *open {
                source.close();
                *open = false;
            }
            source.open()?;
            *open = true;
        }
        info!(camera = %self.inner.name, "capture session reinitialized");
        if self.inner.broadcaster.subscriber_count() > 0 {
            self.inner.broadcaster.start();
        }
        Ok(())
    }

    // -- Preview ----------------------------------------------------------------

    /// Subscribe to the preview at `fps`, or the configured rate when
    /// `None`. The first subscriber opens the device and starts the thread.
    pub fn start_continuous_capture(
        &self,
        listener: Arc<dyn FrameListener>,
        fps: Option<f64>,
    ) -> Result<SubscriptionId, VisionError> {
        if self.inner.preview.suspend_in_tasks && self.inner.machine.is_none() {
            return Err(ConfigurationError::MissingMachine {
                camera: self.inner.name.clone(),
            }
            .into());
        }
        self.inner.ensure_open()?;
        let fps = fps.unwrap_or(self.inner.preview.fps).max(0.0);
        Ok(self.inner.broadcaster.subscribe(listener, fps))
    }

    pub fn stop_continuous_capture(&self, id: SubscriptionId) -> bool {
        self.inner.broadcaster.unsubscribe(id)
    }

    // -- Machine events -----------------------------------------------------------

    /// The head moved: refresh the preview unless it is suspended.
    pub fn machine_head_activity(&self) {
        if !self.inner.broadcaster.is_suspended() {
            self.inner.broadcaster.notify();
        }
    }

    pub fn machine_enabled(&self) {
        self.inner.broadcaster.notify();
    }

    /// When the machine turns idle and the view is stale, capture it.
    pub fn machine_busy(&self, busy: bool) {
        if !busy && self.inner.broadcaster.is_view_stale() {
            self.capture_camera_view();
        }
    }

    /// A user action changed what the camera looks at.
    pub fn camera_view_has_changed(&self) {
        self.inner.broadcaster.mark_view_stale(true);
        self.inner.broadcaster.notify();
    }

    /// Refresh a trigger-only preview with one settled frame. Always clears
    /// the stale view flag.
    pub fn capture_camera_view(&self) {
        if self.inner.capturing_view.swap(true, Ordering::AcqRel) {
            return;
        }
        let _guard = ViewCaptureGuard(&*self.inner);
        if self.inner.broadcaster.effective_fps() == 0.0 {
            match self.settle_and_capture() {
                Ok(result) => {
                    let n = self.inner.broadcaster.broadcast(result.frame);
                    debug!(camera = %self.inner.name, subscribers = n, "camera view captured");
                }
                Err(e) => error!(camera = %self.inner.name, "failed to capture camera view: {e}"),
            }
        }
    }
}

/// Ends a camera view capture, also when a listener panics.
struct ViewCaptureGuard<'a>(&'a CameraInner);

impl Drop for ViewCaptureGuard<'_> {
    fn drop(&mut self) {
        self.0.broadcaster.mark_view_stale(false);
        self.0.capturing_view.store(false, Ordering::Release);
    }
}

/// The user jogged a tool or camera to `target`. The nearest camera within
/// [`TARGETED_VIEW_RADIUS_MM`] of it (XY distance) gets its view marked
/// changed. A camera targeting itself passes its own location.
pub fn machine_targeted_user_action(cameras: &[(Camera, Location)], target: Location) -> Option<&Camera> {
    let (camera, distance) = cameras
        .iter()
        .map(|(camera, at)| (camera, at.linear_distance_to(&target)))
        .filter(|(_, distance)| *distance < TARGETED_VIEW_RADIUS_MM)
        .min_by(|a, b| a.1.total_cmp(&b.1))?;
    debug!(camera = %camera.inner.name, distance, "user action targets camera view");
    camera.camera_view_has_changed();
    Some(camera)
}
