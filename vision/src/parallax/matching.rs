use frame_settle_common::Frame;

use super::ParallaxError;

/// Single-channel `f64` plane used for correlation.
#[derive(Debug, Clone)]
pub struct Plane {
    width: usize,
    height: usize,
    data: Vec<f64>,
}

impl Plane {
    /// Luma of `frame`, one value per pixel.
    pub fn luma(frame: &Frame) -> Self {
        let data = match frame.channels() {
            1 => frame.data().iter().map(|&v| v as f64).collect(),
            c => frame
                .data()
                .chunks_exact(c)
                .map(|px| 0.299 * px[0] as f64 + 0.587 * px[1] as f64 + 0.114 * px[2] as f64)
                .collect(),
        };
        Self {
            width: frame.width() as usize,
            height: frame.height() as usize,
            data,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    fn at(&self, x: usize, y: usize) -> f64 {
        self.data[y * self.width + x]
    }

    /// Square of `size` pixels centered in the plane.
    pub fn center_crop(&self, size: usize) -> Result<Plane, ParallaxError> {
        if size == 0 || size > self.width || size > self.height {
            return Err(ParallaxError::TemplateTooLarge {
                size: size as u32,
                width: self.width as u32,
                height: self.height as u32,
            });
        }
        let x0 = (self.width - size) / 2;
        let y0 = (self.height - size) / 2;
        let mut data = Vec::with_capacity(size * size);
        for y in y0..y0 + size {
            data.extend_from_slice(&self.data[y * self.width + x0..y * self.width + x0 + size]);
        }
        Ok(Plane {
            width: size,
            height: size,
            data,
        })
    }

    /// Top-left corner of [`Plane::center_crop`].
    pub fn center_origin(&self, size: usize) -> (usize, usize) {
        ((self.width - size) / 2, (self.height - size) / 2)
    }
}

/// Summed-area tables of values and squared values, one row and column
/// larger than the plane.
struct Integral {
    stride: usize,
    sum: Vec<f64>,
    sq: Vec<f64>,
}

impl Integral {
    fn new(plane: &Plane) -> Self {
        let stride = plane.width + 1;
        let mut sum = vec![0.0; stride * (plane.height + 1)];
        let mut sq = vec![0.0; stride * (plane.height + 1)];
        for y in 0..plane.height {
            let mut row = 0.0;
            let mut row_sq = 0.0;
            for x in 0..plane.width {
                let v = plane.at(x, y);
                row += v;
                row_sq += v * v;
                let i = (y + 1) * stride + x + 1;
                sum[i] = sum[i - stride] + row;
                sq[i] = sq[i - stride] + row_sq;
            }
        }
        Self { stride, sum, sq }
    }

    fn window(&self, table: &[f64], x: usize, y: usize, w: usize, h: usize) -> f64 {
        let s = self.stride;
        table[(y + h) * s + x + w] - table[y * s + x + w] - table[(y + h) * s + x] + table[y * s + x]
    }
}

/// Normalized cross-correlation of `template` at every position where it
/// fits inside `image`. Windows without variance score 0.
pub struct CorrelationMap {
    width: usize,
    height: usize,
    data: Vec<f64>,
}

impl CorrelationMap {
    pub fn compute(image: &Plane, template: &Plane) -> Result<Self, ParallaxError> {
        if template.width > image.width || template.height > image.height {
            return Err(ParallaxError::TemplateTooLarge {
                size: template.width as u32,
                width: image.width as u32,
                height: image.height as u32,
            });
        }
        let n = (template.width * template.height) as f64;
        let mean = template.data.iter().sum::<f64>() / n;
        let zero_mean: Vec<f64> = template.data.iter().map(|v| v - mean).collect();
        let template_energy: f64 = zero_mean.iter().map(|v| v * v).sum();
        if template_energy <= f64::EPSILON {
            return Err(ParallaxError::FeaturelessTemplate);
        }

        let integral = Integral::new(image);
        let width = image.width - template.width + 1;
        let height = image.height - template.height + 1;
        let mut data = Vec::with_capacity(width * height);
        for v in 0..height {
            for u in 0..width {
                let s = integral.window(&integral.sum, u, v, template.width, template.height);
                let s2 = integral.window(&integral.sq, u, v, template.width, template.height);
                let variance = s2 - s * s / n;
                if variance <= 1e-9 {
                    data.push(0.0);
                    continue;
                }
                let mut num = 0.0;
                for y in 0..template.height {
                    let row = &image.data[(v + y) * image.width + u..][..template.width];
                    let t = &zero_mean[y * template.width..][..template.width];
                    num += row.iter().zip(t).map(|(a, b)| a * b).sum::<f64>();
                }
                data.push(num / (template_energy * variance).sqrt());
            }
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    fn at(&self, x: usize, y: usize) -> f64 {
        self.data[y * self.width + x]
    }

    /// Integer position and value of the highest score; the first one wins
    /// ties.
    pub fn peak(&self) -> (usize, usize, f64) {
        let mut best = (0, 0, f64::NEG_INFINITY);
        for y in 0..self.height {
            for x in 0..self.width {
                let v = self.at(x, y);
                if v > best.2 {
                    best = (x, y, v);
                }
            }
        }
        best
    }
}

/// Sub-pixel template match, top-left corner of the template in the
/// searched image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShotMatch {
    pub x: f64,
    pub y: f64,
    pub score: f64,
}

/// Vertex of the parabola through `(-1, l)`, `(0, m)`, `(1, r)`. `None`
/// when the samples do not form a maximum.
fn parabola_vertex(l: f64, m: f64, r: f64) -> Option<f64> {
    let curvature = l - 2.0 * m + r;
    if curvature >= 0.0 {
        return None;
    }
    Some(0.5 * (l - r) / curvature)
}

/// Locate `template` in `image`, refining the peak with a parabola fitted
/// to the column and row sums of its 3x3 neighborhood. Refinements larger
/// than `max_offset` pixels are dropped per axis.
pub fn locate(image: &Plane, template: &Plane, max_offset: f64) -> Result<ShotMatch, ParallaxError> {
    let map = CorrelationMap::compute(image, template)?;
    let (px, py, score) = map.peak();
    if !(score > 0.0) {
        return Err(ParallaxError::NoMatch);
    }

    let mut x = px as f64;
    let mut y = py as f64;
    if px > 0 && py > 0 && px + 1 < map.width && py + 1 < map.height {
        let column = |dx: isize| -> f64 {
            (0..3)
                .map(|k| map.at((px as isize + dx) as usize, py + k - 1))
                .sum()
        };
        let row = |dy: isize| -> f64 {
            (0..3)
                .map(|k| map.at(px + k - 1, (py as isize + dy) as usize))
                .sum()
        };
        if let Some(dx) = parabola_vertex(column(-1), column(0), column(1)) {
            if dx.abs() <= max_offset {
                x += dx;
            }
        }
        if let Some(dy) = parabola_vertex(row(-1), row(0), row(1)) {
            if dy.abs() <= max_offset {
                y += dy;
            }
        }
    }
    Ok(ShotMatch { x, y, score })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use frame_settle_common::PixelFormat;

    /// A Gaussian spot on a dark background.
    pub(crate) fn blob(width: u32, height: u32, cx: f64, cy: f64) -> Frame {
        let mut data = Vec::with_capacity((width * height) as usize);
        for y in 0..height {
            for x in 0..width {
                let d2 = (x as f64 - cx).powi(2) + (y as f64 - cy).powi(2);
                let v = 40.0 + 180.0 * (-d2 / 18.0).exp();
                data.push(v.round().clamp(0.0, 255.0) as u8);
            }
        }
        Frame::new(width, height, PixelFormat::Gray8, data, 0, 0).unwrap()
    }

    fn shift_of(dx: f64, dy: f64) -> (f64, f64) {
        let before = Plane::luma(&blob(48, 48, 24.0, 24.0));
        let after = Plane::luma(&blob(48, 48, 24.0 + dx, 24.0 + dy));
        let template = before.center_crop(20).unwrap();
        let (x0, y0) = before.center_origin(20);
        let m = locate(&after, &template, 0.6).unwrap();
        (m.x - x0 as f64, m.y - y0 as f64)
    }

    #[test]
    fn recovers_sub_pixel_shift() {
        let (dx, dy) = shift_of(2.3, -0.4);
        assert!((dx - 2.3).abs() < 0.1, "{dx}");
        assert!((dy + 0.4).abs() < 0.1, "{dy}");
    }

    #[test]
    fn half_pixel_shift() {
        let (dx, dy) = shift_of(0.5, 0.5);
        assert!((dx - 0.5).abs() < 0.1, "{dx}");
        assert!((dy - 0.5).abs() < 0.1, "{dy}");
    }

    #[test]
    fn zero_shift_matches_in_place() {
        let (dx, dy) = shift_of(0.0, 0.0);
        assert!(dx.abs() < 1e-6 && dy.abs() < 1e-6);
    }

    #[test]
    fn refinement_is_dropped_beyond_bound() {
        let before = Plane::luma(&blob(48, 48, 24.0, 24.0));
        let after = Plane::luma(&blob(48, 48, 24.4, 24.0));
        let template = before.center_crop(20).unwrap();
        let m = locate(&after, &template, 0.1).unwrap();
        // 0.4 px exceeds the 0.1 px bound, so only the integer peak remains
        assert_eq!(m.x, 14.0);
    }

    #[test]
    fn flat_template_is_rejected() {
        let flat = Plane::luma(&Frame::filled(32, 32, PixelFormat::Gray8, 9));
        let template = flat.center_crop(8).unwrap();
        assert!(matches!(
            locate(&flat, &template, 0.6),
            Err(ParallaxError::FeaturelessTemplate)
        ));
    }

    #[test]
    fn oversized_template_is_rejected() {
        let plane = Plane::luma(&Frame::filled(16, 12, PixelFormat::Gray8, 9));
        assert!(matches!(
            plane.center_crop(13),
            Err(ParallaxError::TemplateTooLarge { size: 13, .. })
        ));
    }

    #[test]
    fn rgb_luma_weights() {
        let frame = Frame::new(1, 1, PixelFormat::Rgb8, vec![255, 0, 0], 0, 0).unwrap();
        let plane = Plane::luma(&frame);
        assert!((plane.at(0, 0) - 76.245).abs() < 1e-9);
    }
}
