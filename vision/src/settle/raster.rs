use frame_settle_common::config::SettleConfig;
use frame_settle_common::{Frame, PixelFormat};
use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, RgbImage};

/// Blur kernels larger than this are approximated by downscaling first.
const MAX_DIRECT_BLUR_KERNEL: u32 = 5;

/// Contrast stretch never amplifies a range narrower than this, so pure
/// sensor noise is not blown up to full scale.
pub const MINIMUM_CONTRAST_RANGE: f64 = 16.0;

/// An 8-bit working image of the settle pipeline, one or three channels.
#[derive(Debug, Clone, PartialEq)]
pub struct Raster {
    pub width: u32,
    pub height: u32,
    pub channels: usize,
    pub data: Vec<u8>,
}

impl Raster {
    pub fn from_image(img: DynamicImage) -> Self {
        match img {
            DynamicImage::ImageLuma8(gray) => {
                let (width, height) = gray.dimensions();
                Self {
                    width,
                    height,
                    channels: 1,
                    data: gray.into_raw(),
                }
            }
            other => {
                let rgb = other.to_rgb8();
                let (width, height) = rgb.dimensions();
                Self {
                    width,
                    height,
                    channels: 3,
                    data: rgb.into_raw(),
                }
            }
        }
    }

    pub fn to_image(&self) -> DynamicImage {
        let image = if self.channels == 1 {
            GrayImage::from_raw(self.width, self.height, self.data.clone()).map(DynamicImage::ImageLuma8)
        } else {
            RgbImage::from_raw(self.width, self.height, self.data.clone()).map(DynamicImage::ImageRgb8)
        };
        image.unwrap_or_else(|| DynamicImage::new_luma8(self.width, self.height))
    }

    /// Wrap as a frame, e.g. for diagnostics recording.
    pub fn to_frame(&self, captured_at_ms: i64, seq: u64) -> Frame {
        let format = if self.channels == 1 {
            PixelFormat::Gray8
        } else {
            PixelFormat::Rgb8
        };
        Frame::new(
            self.width,
            self.height,
            format,
            self.data.clone(),
            captured_at_ms,
            seq,
        )
        .unwrap_or_else(|_| Frame::filled(self.width.max(1), self.height.max(1), format, 0))
    }

    pub fn from_frame(frame: &Frame) -> Self {
        Self {
            width: frame.width(),
            height: frame.height(),
            channels: frame.channels(),
            data: frame.data().to_vec(),
        }
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn same_geometry(&self, other: &Raster) -> bool {
        self.width == other.width && self.height == other.height && self.channels == other.channels
    }
}

/// Filled circle centered on the raster center. Pixels outside are ignored
/// by every metric.
#[derive(Debug, Clone, PartialEq)]
pub struct CircleMask {
    pub width: u32,
    pub height: u32,
    pub diameter: u32,
    inside: Vec<bool>,
}

impl CircleMask {
    pub fn new(width: u32, height: u32, diameter: u32) -> Self {
        let (cx, cy) = ((width / 2) as i64, (height / 2) as i64);
        let r = (diameter / 2) as i64;
        let mut inside = Vec::with_capacity(width as usize * height as usize);
        for y in 0..height as i64 {
            for x in 0..width as i64 {
                let (dx, dy) = (x - cx, y - cy);
                inside.push(dx * dx + dy * dy <= r * r);
            }
        }
        Self {
            width,
            height,
            diameter,
            inside,
        }
    }

    /// Whether the pixel with row-major index `i` lies inside the circle.
    pub fn contains(&self, i: usize) -> bool {
        self.inside.get(i).copied().unwrap_or(false)
    }

    pub fn fits(&self, raster: &Raster) -> bool {
        self.width == raster.width && self.height == raster.height
    }

    pub fn count(&self) -> usize {
        self.inside.iter().filter(|&&b| b).count()
    }
}

/// A preprocessed frame plus the mask that applies to it.
#[derive(Debug, Clone)]
pub struct Prepared {
    pub raster: Raster,
    pub mask: Option<CircleMask>,
}

impl Prepared {
    pub fn mask_diameter(&self) -> u32 {
        self.mask.as_ref().map_or(0, |m| m.diameter)
    }
}

/// The image conditioning applied to each settle frame before comparison.
///
/// Order: grayscale, mask crop, contrast stretch, downscale, mask, Gaussian
/// blur, Laplacian. Contrast runs before the downscale so mixed colors are
/// produced in the full dynamic range.
#[derive(Debug, Clone, PartialEq)]
pub struct Preprocessor {
    pub full_color: bool,
    pub gaussian_blur: u32,
    pub gradients: bool,
    pub mask_circle: f64,
    pub contrast_enhance: f64,
}

impl Preprocessor {
    pub fn from_config(config: &SettleConfig) -> Self {
        Self {
            full_color: config.full_color,
            gaussian_blur: config.gaussian_blur,
            gradients: config.gradients,
            mask_circle: config.mask_circle,
            contrast_enhance: config.contrast_enhance,
        }
    }

    /// Downscale factor used to keep the effective blur kernel small.
    pub fn divisor(&self) -> u32 {
        if self.gaussian_blur > MAX_DIRECT_BLUR_KERNEL {
            (self.gaussian_blur + MAX_DIRECT_BLUR_KERNEL / 2) / MAX_DIRECT_BLUR_KERNEL
        } else {
            1
        }
    }

    pub fn prepare(&self, frame: &Frame) -> Prepared {
        let img = frame.to_image();
        let img = if self.full_color && frame.format() == PixelFormat::Rgb8 {
            DynamicImage::ImageRgb8(img.to_rgb8())
        } else {
            DynamicImage::ImageLuma8(img.to_luma8())
        };

        let divisor = self.divisor();
        let mut blur = self.gaussian_blur;
        let mut mask_diameter = 0u32;
        let mut img = img;

        if self.mask_circle > 0.0 {
            let (w, h) = (img.width(), img.height());
            let dimension = w.min(h);
            let diameter = ((self.mask_circle * dimension as f64) as u32).max(1);
            let masked_width = align(w.min(diameter), divisor).min(w);
            let masked_height = align(h.min(diameter), divisor).min(h);
            mask_diameter = align(diameter, divisor);
            img = img.crop_imm(
                (w - masked_width) / 2,
                (h - masked_height) / 2,
                masked_width,
                masked_height,
            );
        }

        let mut raster = Raster::from_image(img);

        if self.contrast_enhance > 0.0 {
            let full_mask = (mask_diameter > 0)
                .then(|| CircleMask::new(raster.width, raster.height, mask_diameter));
            enhance_contrast(&mut raster, full_mask.as_ref(), self.contrast_enhance);
        }

        if divisor > 1 {
            blur = (self.gaussian_blur / divisor) | 1;
            let width = (raster.width / divisor).max(1);
            let height = (raster.height / divisor).max(1);
            raster = Raster::from_image(raster.to_image().resize_exact(width, height, FilterType::Triangle));
            mask_diameter /= divisor;
        }

        let mask = (mask_diameter > 0)
            .then(|| CircleMask::new(raster.width, raster.height, mask_diameter));

        if blur > 1 {
            raster = Raster::from_image(raster.to_image().blur(gaussian_sigma(blur)));
        }

        if self.gradients {
            raster = laplacian(&raster);
        }

        Prepared { raster, mask }
    }
}

/// Floor to a multiple of `2 * divisor`, at least one such multiple.
fn align(value: u32, divisor: u32) -> u32 {
    let step = 2 * divisor;
    ((value / step) * step).max(step)
}

/// Sigma a Gaussian kernel of size `k` would get when none is given.
pub fn gaussian_sigma(kernel: u32) -> f32 {
    0.3 * ((kernel as f32 - 1.0) * 0.5 - 1.0) + 0.8
}

/// Min/max stretch inside the mask, blended with the original by `fraction`.
///
/// One scale and offset is applied to all channels, using the largest
/// maximum and the widest range over the channels.
pub fn enhance_contrast(raster: &mut Raster, mask: Option<&CircleMask>, fraction: f64) {
    let c = raster.channels;
    let mut max = MINIMUM_CONTRAST_RANGE;
    let mut range = MINIMUM_CONTRAST_RANGE;
    for ch in 0..c {
        let mut lo = u8::MAX;
        let mut hi = u8::MIN;
        for (i, px) in raster.data.chunks_exact(c).enumerate() {
            if mask.is_some_and(|m| !m.contains(i)) {
                continue;
            }
            lo = lo.min(px[ch]);
            hi = hi.max(px[ch]);
        }
        if lo > hi {
            continue;
        }
        max = max.max(hi as f64);
        range = range.max((hi - lo) as f64);
    }
    let (max, range) = (max / 255.0, range / 255.0);
    let scale = fraction / range + (1.0 - fraction);
    let offset = -(max - range) * fraction / range * 255.0;
    for v in raster.data.iter_mut() {
        *v = (*v as f64 * scale + offset).abs().round().min(255.0) as u8;
    }
}

/// 3x3 Laplacian `[2 0 2; 0 -8 0; 2 0 2]`, replicated border, absolute
/// value saturated to 8 bits.
pub fn laplacian(raster: &Raster) -> Raster {
    let (w, h, c) = (raster.width as i64, raster.height as i64, raster.channels);
    let at = |x: i64, y: i64, ch: usize| -> i32 {
        let x = x.clamp(0, w - 1);
        let y = y.clamp(0, h - 1);
        raster.data[(y * w + x) as usize * c + ch] as i32
    };
    let mut data = Vec::with_capacity(raster.data.len());
    for y in 0..h {
        for x in 0..w {
            for ch in 0..c {
                let corners = at(x - 1, y - 1, ch)
                    + at(x + 1, y - 1, ch)
                    + at(x - 1, y + 1, ch)
                    + at(x + 1, y + 1, ch);
                let value = 2 * corners - 8 * at(x, y, ch);
                data.push(value.unsigned_abs().min(255) as u8);
            }
        }
    }
    Raster {
        width: raster.width,
        height: raster.height,
        channels: c,
        data,
    }
}
