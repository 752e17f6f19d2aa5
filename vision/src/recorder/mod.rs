//! Settle diagnostics: the score trace and processed frames of the last
//! settle cycle, with heat map playback.

pub mod graph;
pub mod heatmap;
pub mod keys;
pub mod state;

pub use graph::{CaptureMark, DiffSample, SettleGraph};
pub use state::{RecordingSession, SettleDiagnosticsRecorder, SettleRecording};
