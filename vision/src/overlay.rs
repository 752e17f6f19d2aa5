use std::sync::Arc;
use std::time::Duration;

use frame_settle_common::{Frame, PixelFormat};
use image::{Rgb, RgbImage};

const MARKER_COLOR: Rgb<u8> = Rgb([255, 0, 0]);

/// Geometric annotation drawn on top of a diagnostic image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OverlayMarker {
    None,
    /// Circle outline, center and diameter in pixels.
    Circle { cx: f64, cy: f64, diameter: f64 },
    /// Axis-aligned square outline.
    Square { cx: f64, cy: f64, size: f64 },
    /// Full-frame crosshair through a point.
    Crosshair { cx: f64, cy: f64 },
}

/// A transient image shown in the camera view, e.g. a focus probe or a
/// settle heat map.
#[derive(Debug, Clone)]
pub struct DiagnosticOverlay {
    pub image: Arc<Frame>,
    pub caption: String,
    pub duration: Duration,
    pub marker: OverlayMarker,
}

impl DiagnosticOverlay {
    pub fn new(image: Arc<Frame>, caption: impl Into<String>, duration: Duration) -> Self {
        Self {
            image,
            caption: caption.into(),
            duration,
            marker: OverlayMarker::None,
        }
    }

    pub fn with_marker(mut self, marker: OverlayMarker) -> Self {
        self.marker = marker;
        self
    }

    /// The image with the marker burnt in, always RGB.
    pub fn render(&self) -> Frame {
        let mut rgb = self.image.to_image().to_rgb8();
        match self.marker {
            OverlayMarker::None => {}
            OverlayMarker::Circle { cx, cy, diameter } => draw_circle(&mut rgb, cx, cy, diameter / 2.0),
            OverlayMarker::Square { cx, cy, size } => draw_square(&mut rgb, cx, cy, size / 2.0),
            OverlayMarker::Crosshair { cx, cy } => draw_crosshair(&mut rgb, cx, cy),
        }
        let (width, height) = rgb.dimensions();
        Frame::new(
            width,
            height,
            PixelFormat::Rgb8,
            rgb.into_raw(),
            self.image.captured_at_ms(),
            self.image.seq(),
        )
        .unwrap_or_else(|_| (*self.image).clone())
    }
}

/// UI collaborator that displays diagnostic overlays. Best effort: the sink
/// may drop overlays it cannot show.
pub trait OverlaySink: Send + Sync {
    fn show_diagnostic_overlay(&self, overlay: DiagnosticOverlay);
}

impl<F> OverlaySink for F
where
    F: Fn(DiagnosticOverlay) + Send + Sync,
{
    fn show_diagnostic_overlay(&self, overlay: DiagnosticOverlay) {
        self(overlay)
    }
}

fn put(img: &mut RgbImage, x: i64, y: i64) {
    if x >= 0 && y >= 0 && (x as u32) < img.width() && (y as u32) < img.height() {
        img.put_pixel(x as u32, y as u32, MARKER_COLOR);
    }
}

fn draw_circle(img: &mut RgbImage, cx: f64, cy: f64, radius: f64) {
    let steps = ((radius * 8.0).ceil() as usize).max(16);
    for i in 0..steps {
        let a = i as f64 * std::f64::consts::TAU / steps as f64;
        put(
            img,
            (cx + radius * a.cos()).round() as i64,
            (cy + radius * a.sin()).round() as i64,
        );
    }
}

fn draw_square(img: &mut RgbImage, cx: f64, cy: f64, half: f64) {
    let (x0, x1) = ((cx - half).round() as i64, (cx + half).round() as i64);
    let (y0, y1) = ((cy - half).round() as i64, (cy + half).round() as i64);
    for x in x0..=x1 {
        put(img, x, y0);
        put(img, x, y1);
    }
    for y in y0..=y1 {
        put(img, x0, y);
        put(img, x1, y);
    }
}

fn draw_crosshair(img: &mut RgbImage, cx: f64, cy: f64) {
    let (x, y) = (cx.round() as i64, cy.round() as i64);
    for i in 0..img.width() as i64 {
        put(img, i, y);
    }
    for j in 0..img.height() as i64 {
        put(img, x, j);
    }
}
