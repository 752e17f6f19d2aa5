use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use frame_settle_common::Frame;
use frame_settle_vision::source::{CaptureError, FrameSource};
use tracing::info;

use crate::SimError;

const EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];

/// Plays back a directory of images in file-name order, looping forever.
pub struct ReplaySource {
    files: Vec<PathBuf>,
    next: AtomicUsize,
    seq: AtomicU64,
    resolution: (u32, u32),
}

impl ReplaySource {
    pub fn open_dir(dir: &Path) -> Result<Self, SimError> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
            .map_err(|e| SimError::Replay(format!("{}: {e}", dir.display())))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
            })
            .collect();
        files.sort();
        let first = files
            .first()
            .ok_or_else(|| SimError::Replay(format!("no images in {}", dir.display())))?;
        let frame = load(first, 0).map_err(|e| SimError::Replay(e.to_string()))?;
        info!(dir = %dir.display(), frames = files.len(), "replay source loaded");
        Ok(Self {
            resolution: (frame.width(), frame.height()),
            files,
            next: AtomicUsize::new(0),
            seq: AtomicU64::new(0),
        })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }
}

fn load(path: &Path, seq: u64) -> Result<Frame, CaptureError> {
    let device = || path.display().to_string();
    let bytes = std::fs::read(path).map_err(|e| CaptureError::Device {
        device: device(),
        reason: e.to_string(),
    })?;
    Frame::decode(&bytes, chrono::Utc::now().timestamp_millis(), seq).map_err(|e| CaptureError::Device {
        device: device(),
        reason: e.to_string(),
    })
}

impl FrameSource for ReplaySource {
    fn capture(&self) -> Result<Frame, CaptureError> {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.files.len();
        load(&self.files[i], self.seq.fetch_add(1, Ordering::Relaxed))
    }

    fn resolution(&self) -> (u32, u32) {
        self.resolution
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use frame_settle_common::PixelFormat;

    fn write_png(dir: &Path, name: &str, value: u8) {
        let frame = Frame::filled(4, 3, PixelFormat::Gray8, value);
        std::fs::write(dir.join(name), frame.encode_png().unwrap()).unwrap();
    }

    #[test]
    fn loops_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        write_png(dir.path(), "b.png", 20);
        write_png(dir.path(), "a.png", 10);
        std::fs::write(dir.path().join("notes.txt"), "skip me").unwrap();

        let source = ReplaySource::open_dir(dir.path()).unwrap();
        assert_eq!(source.len(), 2);
        assert_eq!(source.resolution(), (4, 3));
        let values: Vec<u8> = (0..3).map(|_| source.capture().unwrap().data()[0]).collect();
        assert_eq!(values, vec![10, 20, 10]);
    }

    #[test]
    fn empty_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(ReplaySource::open_dir(dir.path()), Err(SimError::Replay(_))));
    }
}
