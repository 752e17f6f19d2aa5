use serde::Serialize;

/// One difference score, `t_ms` relative to the start of the settle cycle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DiffSample {
    pub t_ms: f64,
    pub score: f64,
}

/// A step of the capture on/off trace, `level` is 1 while the device is
/// capturing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CaptureMark {
    pub t_ms: f64,
    pub level: u8,
}

/// Time series of one settle cycle: the difference scores, the capture
/// activity and the threshold line.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SettleGraph {
    pub difference: Vec<DiffSample>,
    pub capture: Vec<CaptureMark>,
    pub threshold: Vec<DiffSample>,
}

impl SettleGraph {
    pub fn record_capture_begin(&mut self, t_ms: f64) {
        self.capture.push(CaptureMark { t_ms, level: 0 });
        self.capture.push(CaptureMark { t_ms, level: 1 });
    }

    pub fn record_capture_end(&mut self, t_capture_ms: f64, t_ms: f64) {
        self.capture.push(CaptureMark {
            t_ms: t_capture_ms,
            level: 1,
        });
        self.capture.push(CaptureMark { t_ms, level: 0 });
    }

    pub fn record_difference(&mut self, t_ms: f64, score: f64) {
        self.difference.push(DiffSample { t_ms, score });
    }

    /// Close the trace at `t_end_ms`: capture off, threshold line across the
    /// whole cycle and the final score repeated at the end.
    pub fn finish(&mut self, t_end_ms: f64, threshold: f64, last_score: Option<f64>) {
        self.capture.push(CaptureMark {
            t_ms: t_end_ms,
            level: 0,
        });
        self.threshold.push(DiffSample {
            t_ms: 0.0,
            score: threshold,
        });
        self.threshold.push(DiffSample {
            t_ms: t_end_ms,
            score: threshold,
        });
        if let Some(score) = last_score {
            self.record_difference(t_end_ms, score);
        }
    }

    pub fn end_ms(&self) -> f64 {
        self.capture.last().map_or(0.0, |m| m.t_ms)
    }

    pub fn max_score(&self) -> Option<f64> {
        self.difference.iter().map(|s| s.score).reduce(f64::max)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
