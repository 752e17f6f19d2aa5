use std::sync::Arc;
use std::time::Instant;

use frame_settle_common::config::{SettleConfig, SettleMethod};
use frame_settle_common::Frame;
use tracing::{debug, trace, warn};

use crate::error::VisionError;
use crate::recorder::SettleDiagnosticsRecorder;

use super::debounce::Debouncer;
use super::metric::DifferenceMetric;
use super::raster::{Prepared, Preprocessor};
use super::SettleResult;

/// Decides when consecutive frames are similar enough to use.
pub struct SettleAnalyzer {
    config: SettleConfig,
    preprocessor: Preprocessor,
}

impl SettleAnalyzer {
    pub fn new(config: SettleConfig) -> Self {
        let config = config.normalized();
        let preprocessor = Preprocessor::from_config(&config);
        Self {
            config,
            preprocessor,
        }
    }

    pub fn config(&self) -> &SettleConfig {
        &self.config
    }

    /// Capture frames until the scene is still, or the timeout passes, and
    /// return the last raw frame.
    ///
    /// Timing out is a normal outcome, reported through
    /// [`SettleResult::timed_out`]. Capture errors abort the cycle.
    pub fn settle<F>(
        &self,
        mut capture: F,
        recorder: Option<&SettleDiagnosticsRecorder>,
    ) -> Result<SettleResult, VisionError>
    where
        F: FnMut() -> Result<Frame, VisionError>,
    {
        let t0 = Instant::now();
        let method = self.config.method();

        if method == SettleMethod::FixedTime {
            std::thread::sleep(self.config.settle_time());
            let frame = capture()?;
            return Ok(SettleResult {
                frame: Arc::new(frame),
                elapsed: t0.elapsed(),
                score: None,
                frames_captured: 1,
                timed_out: false,
            });
        }

        let timeout = self.config.timeout();
        let mut session = recorder.and_then(|r| r.begin());
        let mut debouncer = Debouncer::new(self.config.threshold, self.config.debounce);
        let mut reference: Option<Prepared> = None;
        let mut frames_captured = 0u32;

        loop {
            if let Some(s) = session.as_mut() {
                s.capture_begin();
            }
            let frame = capture()?;
            frames_captured += 1;
            let t_capture = session.as_mut().map(|s| s.capture_end());

            let prepared = self.preprocessor.prepare(&frame);
            if let (Some(s), Some(t)) = (session.as_mut(), t_capture) {
                s.record_frame(t, prepared.raster.to_frame(frame.captured_at_ms(), frame.seq()));
            }

            // The first frame only becomes the reference.
            let Some(previous) = reference.take() else {
                reference = Some(prepared);
                continue;
            };

            let score = if previous.raster.same_geometry(&prepared.raster) {
                method.difference(
                    &previous.raster,
                    &prepared.raster,
                    prepared.mask.as_ref(),
                    self.config.contrast_enhance,
                )
            } else {
                warn!(
                    seq = frame.seq(),
                    "frame geometry changed while settling, treating as full change"
                );
                100.0
            };
            if let Some(s) = session.as_mut() {
                s.record_difference(score);
            }
            let mask_diameter = prepared.mask_diameter();
            reference = Some(prepared);

            let elapsed = t0.elapsed();
            trace!(
                t_ms = elapsed.as_millis() as u64,
                score,
                threshold = self.config.threshold,
                count = debouncer.count(),
                "settle score"
            );

            let settled = debouncer.observe(score);
            if settled || elapsed > timeout {
                if let (Some(r), Some(s)) = (recorder, session.take()) {
                    r.commit(s.finish(self.config.threshold, Some(score), mask_diameter));
                }
                debug!(
                    elapsed_ms = elapsed.as_millis() as u64,
                    frames = frames_captured,
                    score,
                    timed_out = !settled,
                    "settle cycle done"
                );
                return Ok(SettleResult {
                    frame: Arc::new(frame),
                    elapsed,
                    score: Some(score),
                    frames_captured,
                    timed_out: !settled,
                });
            }
        }
    }
}
