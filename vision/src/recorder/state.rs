use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use frame_settle_common::Frame;
use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::overlay::DiagnosticOverlay;

use super::graph::SettleGraph;
use super::heatmap::heat_map;
use super::keys::{graph_file_name, heat_map_file_name};

/// How long a played-back settle frame stays in the camera view.
const PLAYBACK_OVERLAY_DURATION: Duration = Duration::from_millis(1500);

fn as_ms(t: Duration) -> f64 {
    t.as_secs_f64() * 1000.0
}

/// Collects one settle cycle while it runs. Committed to the recorder only
/// when the cycle ends, so a reader never sees a half-built recording.
pub struct RecordingSession {
    started: Instant,
    started_at_ms: i64,
    graph: SettleGraph,
    frames: BTreeMap<Duration, Arc<Frame>>,
}

impl RecordingSession {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
            started_at_ms: chrono::Utc::now().timestamp_millis(),
            graph: SettleGraph::default(),
            frames: BTreeMap::new(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn capture_begin(&mut self) {
        let t = as_ms(self.elapsed());
        self.graph.record_capture_begin(t);
    }

    /// Mark the end of a capture, returns the capture instant.
    pub fn capture_end(&mut self) -> Duration {
        let t_capture = self.elapsed();
        let t = as_ms(self.elapsed());
        self.graph.record_capture_end(as_ms(t_capture), t);
        t_capture
    }

    /// Keep the preprocessed frame captured at `t`.
    pub fn record_frame(&mut self, t: Duration, frame: Frame) {
        self.frames.insert(t, Arc::new(frame));
    }

    pub fn record_difference(&mut self, score: f64) {
        let t = as_ms(self.elapsed());
        self.graph.record_difference(t, score);
    }

    pub fn finish(
        mut self,
        threshold: f64,
        last_score: Option<f64>,
        mask_diameter: u32,
    ) -> SettleRecording {
        let t_end = as_ms(self.elapsed()) + 1.0;
        self.graph.finish(t_end, threshold, last_score);
        SettleRecording {
            started_at_ms: self.started_at_ms,
            graph: self.graph,
            frames: self.frames,
            mask_diameter,
            heat_maps: Mutex::new(HashMap::new()),
        }
    }
}

/// The frames and score trace of the last completed settle cycle.
pub struct SettleRecording {
    started_at_ms: i64,
    graph: SettleGraph,
    frames: BTreeMap<Duration, Arc<Frame>>,
    mask_diameter: u32,
    heat_maps: Mutex<HashMap<Duration, Arc<Frame>>>,
}

impl SettleRecording {
    pub fn graph(&self) -> &SettleGraph {
        &self.graph
    }

    pub fn started_at_ms(&self) -> i64 {
        self.started_at_ms
    }

    pub fn mask_diameter(&self) -> u32 {
        self.mask_diameter
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn frame_times(&self) -> impl Iterator<Item = Duration> + '_ {
        self.frames.keys().copied()
    }

    /// The last frame captured at or before `t`.
    pub fn frame_at(&self, t: Duration) -> Option<(Duration, Arc<Frame>)> {
        self.frames
            .range(..=t)
            .next_back()
            .map(|(k, f)| (*k, f.clone()))
    }

    /// 1-based number of the frame shown at `t`, 0 before the first frame.
    pub fn frame_number(&self, t: Duration) -> usize {
        self.frames.range(..=t).count()
    }

    /// Heat map of the frame shown at `t` against its predecessor, built on
    /// first use and cached. The flag is `true` when it was just built.
    pub fn heat_map_at(&self, t: Duration) -> Option<(Duration, Arc<Frame>, bool)> {
        let (t_frame, frame) = self.frame_at(t)?;
        let mut cache = self.heat_maps.lock();
        if let Some(img) = cache.get(&t_frame) {
            return Some((t_frame, img.clone(), false));
        }
        let previous = self.frames.range(..t_frame).next_back().map(|(_, f)| f.clone());
        let img = Arc::new(heat_map(previous.as_deref(), &frame, self.mask_diameter));
        cache.insert(t_frame, img.clone());
        Some((t_frame, img, true))
    }

    pub fn caption(&self, t: Duration) -> Option<String> {
        let (t_frame, _) = self.frame_at(t)?;
        Some(format!(
            "Camera settling, frame number {}, t=+{:.1}ms",
            self.frame_number(t),
            as_ms(t_frame)
        ))
    }
}

/// Holds the recording of the last settle cycle of one camera.
///
/// A new recording replaces the previous one atomically; disabling
/// diagnostics discards it.
pub struct SettleDiagnosticsRecorder {
    camera: String,
    enabled: AtomicBool,
    diagnostics_dir: Option<PathBuf>,
    current: Mutex<Option<Arc<SettleRecording>>>,
}

impl SettleDiagnosticsRecorder {
    pub fn new(camera: impl Into<String>, enabled: bool, diagnostics_dir: Option<PathBuf>) -> Self {
        Self {
            camera: camera.into(),
            enabled: AtomicBool::new(enabled),
            diagnostics_dir,
            current: Mutex::new(None),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
        if !enabled {
            self.discard();
        }
    }

    /// Start a session for a new settle cycle, `None` when disabled. A
    /// disabled recorder also drops any stale recording here.
    pub fn begin(&self) -> Option<RecordingSession> {
        if self.is_enabled() {
            Some(RecordingSession::start())
        } else {
            self.discard();
            None
        }
    }

    pub fn commit(&self, recording: SettleRecording) {
        debug!(
            camera = %self.camera,
            frames = recording.frame_count(),
            "settle recording committed"
        );
        if let Some(dir) = &self.diagnostics_dir {
            match recording.graph().to_json() {
                Ok(json) => {
                    let name = graph_file_name(&self.camera, recording.started_at_ms());
                    write_diagnostic(dir, &name, json.as_bytes());
                }
                Err(e) => error!(camera = %self.camera, "failed to serialize settle graph: {e}"),
            }
        }
        *self.current.lock() = Some(Arc::new(recording));
    }

    pub fn latest(&self) -> Option<Arc<SettleRecording>> {
        self.current.lock().clone()
    }

    pub fn discard(&self) {
        if self.current.lock().take().is_some() {
            info!(camera = %self.camera, "settle recording discarded");
        }
    }

    /// Overlay for playing back the recorded frame at `t`, as a heat map of
    /// the movement since the previous frame.
    pub fn playback(&self, t: Duration) -> Option<DiagnosticOverlay> {
        let recording = self.latest()?;
        let (t_frame, img, created) = recording.heat_map_at(t)?;
        let number = recording.frame_number(t);
        if created {
            if let Some(dir) = &self.diagnostics_dir {
                let name = heat_map_file_name(&self.camera, recording.started_at_ms(), number);
                match img.encode_png() {
                    Ok(png) => write_diagnostic(dir, &name, &png),
                    Err(e) => error!(camera = %self.camera, "failed to encode heat map: {e}"),
                }
            }
        }
        debug!(camera = %self.camera, frame = number, t_ms = as_ms(t_frame), "settle playback");
        let caption = recording.caption(t)?;
        Some(DiagnosticOverlay::new(img, caption, PLAYBACK_OVERLAY_DURATION))
    }
}

/// Diagnostics are best effort: failures are logged, never returned.
fn write_diagnostic(dir: &Path, name: &str, bytes: &[u8]) {
    let path = dir.join(name);
    let result = std::fs::create_dir_all(dir).and_then(|_| std::fs::write(&path, bytes));
    match result {
        Ok(()) => debug!(path = %path.display(), "wrote settle diagnostic"),
        Err(e) => error!(path = %path.display(), "failed to write settle diagnostic: {e}"),
    }
}
