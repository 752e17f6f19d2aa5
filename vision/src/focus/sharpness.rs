use frame_settle_common::{Frame, PixelFormat};

const MAX_SAMPLE: f64 = 255.0;
const MARK_EDGE: [u8; 3] = [0, 255, 0];
const MARK_RING: [u8; 3] = [0, 0, 0];
/// Width of the ring drawn around the sampled circle.
const RING_WIDTH: i64 = 3;
/// Smallest frame side holding a 2 pixel circle and its forward differences.
const MIN_SIDE: u32 = 3;

/// Histogram of rounded gradient magnitudes inside a centered circle.
struct EdgeSample {
    diameter: u32,
    x0: u32,
    y0: u32,
    histogram: Vec<u32>,
    /// Gradient per sampled pixel, `None` outside the circle. Row-major
    /// over the `diameter x diameter` sampling square.
    edges: Vec<Option<usize>>,
}

/// Largest even sampling diameter that still leaves room for the forward
/// differences of the last row and column.
pub fn clamp_diameter(diameter: u32, width: u32, height: u32) -> u32 {
    let room = width.min(height).saturating_sub(2);
    (diameter.min(room) & !1).max(2)
}

fn sample(frame: &Frame, diameter: u32) -> Option<EdgeSample> {
    if frame.width().min(frame.height()) < MIN_SIDE {
        return None;
    }
    let diameter = clamp_diameter(diameter, frame.width(), frame.height());
    let bands = frame.channels();
    let histogram_size = 1 + (MAX_SAMPLE * ((bands * 2) as f64).sqrt()).ceil() as usize;
    let x0 = (frame.width() - diameter) / 2;
    let y0 = (frame.height() - diameter) / 2;
    let r = (diameter / 2) as i64;
    let mut histogram = vec![0u32; histogram_size];
    let mut edges = Vec::with_capacity((diameter * diameter) as usize);
    for y in -r..r {
        for x in -r..r {
            if x * x + y * y > r * r {
                edges.push(None);
                continue;
            }
            let px = (x0 as i64 + x + r) as u32;
            let py = (y0 as i64 + y + r) as u32;
            let here = frame.pixel(px, py);
            let right = frame.pixel(px + 1, py);
            let below = frame.pixel(px, py + 1);
            let mut energy = 0i64;
            for b in 0..bands {
                let dx = here[b] as i64 - right[b] as i64;
                let dy = here[b] as i64 - below[b] as i64;
                energy += dx * dx + dy * dy;
            }
            let edge = ((energy as f64).sqrt().round() as usize).min(histogram_size - 1);
            histogram[edge] += 1;
            edges.push(Some(edge));
        }
    }
    Some(EdgeSample {
        diameter,
        x0,
        y0,
        histogram,
        edges,
    })
}

/// Number of hardest-edge pixels whose weakest member is the score. Grows
/// with the diameter to the power of 1.3.
pub fn significant_pixels(diameter: u32) -> u32 {
    ((diameter as f64).powf(1.3) as u32 / 10).max(1)
}

/// `(score, bucket)`: the edge strength reached by the significant pixel
/// fraction, interpolated inside the bucket where the count is reached.
fn fractile(histogram: &[u32], target: u32) -> Option<(f64, usize)> {
    let mut exceeding = 0u32;
    for h in (0..histogram.len()).rev() {
        exceeding += histogram[h];
        if exceeding >= target && histogram[h] > 0 {
            let inter = (exceeding - target) as f64 / histogram[h] as f64;
            return Some((h as f64 + inter, h));
        }
    }
    None
}

/// Edge-histogram sharpness of a centered circle of `diameter` pixels.
/// Higher is sharper; a featureless image, or one too small to sample,
/// scores 0.
pub fn focus_score(frame: &Frame, diameter: u32) -> f64 {
    let Some(s) = sample(frame, diameter) else {
        return 0.0;
    };
    fractile(&s.histogram, significant_pixels(s.diameter)).map_or(0.0, |(score, _)| score)
}

/// Like [`focus_score`], plus the sampled crop with the significant edge
/// pixels marked green and the circle outlined. Frames too small to
/// sample come back unmarked.
pub fn focus_score_marked(frame: &Frame, diameter: u32) -> (f64, Frame) {
    let Some(s) = sample(frame, diameter) else {
        return (0.0, frame.clone());
    };
    let found = fractile(&s.histogram, significant_pixels(s.diameter));
    let side = s.diameter + 1;
    let r = (s.diameter / 2) as i64;
    let ring = (r - RING_WIDTH) * (r - RING_WIDTH);
    let mut data = Vec::with_capacity((side * side * 3) as usize);
    for yi in 0..side {
        for xi in 0..side {
            let src = frame.pixel(s.x0 + xi, s.y0 + yi);
            let mut rgb = if src.len() >= 3 {
                [src[0], src[1], src[2]]
            } else {
                [src[0]; 3]
            };
            if xi < s.diameter && yi < s.diameter {
                let (x, y) = (xi as i64 - r, yi as i64 - r);
                let d2 = x * x + y * y;
                let edge = s.edges[(yi * s.diameter + xi) as usize];
                if let (Some(edge), Some((_, bucket))) = (edge, found) {
                    if edge >= bucket {
                        rgb = MARK_EDGE;
                    }
                }
                if d2 >= ring && d2 <= r * r {
                    rgb = MARK_RING;
                }
            }
            data.extend_from_slice(&rgb);
        }
    }
    let marked = Frame::new(
        side,
        side,
        PixelFormat::Rgb8,
        data,
        frame.captured_at_ms(),
        frame.seq(),
    )
    .unwrap_or_else(|_| frame.clone());
    (found.map_or(0.0, |(score, _)| score), marked)
}
