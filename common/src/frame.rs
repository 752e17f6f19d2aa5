use std::io::Cursor;

use image::{DynamicImage, GrayImage, ImageFormat, ImageReader, RgbImage};

/// Pixel layout of a [`Frame`]. Samples are 8-bit intensities in `[0, 255]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// One luminance channel.
    Gray8,
    /// Three interleaved channels, red first.
    Rgb8,
}

impl PixelFormat {
    pub fn channels(self) -> usize {
        match self {
            PixelFormat::Gray8 => 1,
            PixelFormat::Rgb8 => 3,
        }
    }
}

/// An immutable camera frame with capture metadata.
///
/// Frames are produced by a frame source and shared read-only downstream,
/// usually behind an `Arc` so that every preview subscriber receives the
/// identical buffer.
///
/// Layout: row-major, `width * height * channels` bytes, channels interleaved.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    width: u32,
    height: u32,
    format: PixelFormat,
    data: Vec<u8>,
    captured_at_ms: i64,
    seq: u64,
}

impl Frame {
    /// Wrap a raw pixel buffer, checking that its length matches the geometry.
    pub fn new(
        width: u32,
        height: u32,
        format: PixelFormat,
        data: Vec<u8>,
        captured_at_ms: i64,
        seq: u64,
    ) -> Result<Self, FrameError> {
        if width == 0 || height == 0 {
            return Err(FrameError::Empty { width, height });
        }
        let expected = width as usize * height as usize * format.channels();
        if data.len() != expected {
            return Err(FrameError::BufferSize {
                got: data.len(),
                expected,
            });
        }
        Ok(Self {
            width,
            height,
            format,
            data,
            captured_at_ms,
            seq,
        })
    }

    /// A frame with every sample set to `value`.
    pub fn filled(width: u32, height: u32, format: PixelFormat, value: u8) -> Self {
        let len = width as usize * height as usize * format.channels();
        Self {
            width,
            height,
            format,
            data: vec![value; len],
            captured_at_ms: 0,
            seq: 0,
        }
    }

    /// Convert a decoded image. Luma images stay single channel, anything
    /// else is flattened to RGB (alpha is dropped).
    pub fn from_image(img: DynamicImage, captured_at_ms: i64, seq: u64) -> Self {
        let (width, height, format, data) = match img {
            DynamicImage::ImageLuma8(gray) => {
                let (w, h) = gray.dimensions();
                (w, h, PixelFormat::Gray8, gray.into_raw())
            }
            other => {
                let rgb = other.to_rgb8();
                let (w, h) = rgb.dimensions();
                (w, h, PixelFormat::Rgb8, rgb.into_raw())
            }
        };
        Self {
            width,
            height,
            format,
            data,
            captured_at_ms,
            seq,
        }
    }

    /// Decode an encoded image (JPEG, PNG, ...) guessing the container format.
    pub fn decode(bytes: &[u8], captured_at_ms: i64, seq: u64) -> Result<Self, FrameError> {
        let img = ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(|e| FrameError::Decode(e.to_string()))?
            .decode()
            .map_err(|e| FrameError::Decode(e.to_string()))?;
        if img.width() == 0 || img.height() == 0 {
            return Err(FrameError::Empty {
                width: img.width(),
                height: img.height(),
            });
        }
        Ok(Self::from_image(img, captured_at_ms, seq))
    }

    /// Copy into an `image` crate buffer for use with `imageops`.
    pub fn to_image(&self) -> DynamicImage {
        match self.format {
            PixelFormat::Gray8 => GrayImage::from_raw(self.width, self.height, self.data.clone())
                .map(DynamicImage::ImageLuma8),
            PixelFormat::Rgb8 => RgbImage::from_raw(self.width, self.height, self.data.clone())
                .map(DynamicImage::ImageRgb8),
        }
        // Geometry is checked on construction, so the buffer always fits.
        .unwrap_or_else(|| DynamicImage::new_luma8(self.width, self.height))
    }

    /// Encode as PNG, e.g. for diagnostic image dumps.
    pub fn encode_png(&self) -> Result<Vec<u8>, FrameError> {
        let mut out = Cursor::new(Vec::new());
        self.to_image()
            .write_to(&mut out, ImageFormat::Png)
            .map_err(|e| FrameError::Encode(e.to_string()))?;
        Ok(out.into_inner())
    }

    /// Same pixels, new capture metadata.
    pub fn restamped(mut self, captured_at_ms: i64, seq: u64) -> Self {
        self.captured_at_ms = captured_at_ms;
        self.seq = seq;
        self
    }

    // -- Accessors --------------------------------------------------------------

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn channels(&self) -> usize {
        self.format.channels()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Capture instant, Unix millis.
    pub fn captured_at_ms(&self) -> i64 {
        self.captured_at_ms
    }

    /// Per-source sequence number.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// The channel samples of one pixel.
    pub fn pixel(&self, x: u32, y: u32) -> &[u8] {
        let c = self.channels();
        let i = (y as usize * self.width as usize + x as usize) * c;
        &self.data[i..i + c]
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("pixel buffer has {got} bytes, expected {expected}")]
    BufferSize { got: usize, expected: usize },
    #[error("frame has no pixels ({width}x{height})")]
    Empty { width: u32, height: u32 },
    #[error("failed to decode image: {0}")]
    Decode(String),
    #[error("failed to encode image: {0}")]
    Encode(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_wrong_buffer_size() {
        let result = Frame::new(4, 4, PixelFormat::Rgb8, vec![0; 16], 0, 0);
        assert!(matches!(
            result,
            Err(FrameError::BufferSize {
                got: 16,
                expected: 48
            })
        ));
    }

    #[test]
    fn rejects_empty_geometry() {
        assert!(Frame::new(0, 4, PixelFormat::Gray8, vec![], 0, 0).is_err());
    }

    #[test]
    fn png_encode_then_decode_keeps_pixels() {
        let data: Vec<u8> = (0..48).map(|i| (i * 5) as u8).collect();
        let frame = Frame::new(4, 4, PixelFormat::Rgb8, data, 1708300000000, 3).unwrap();
        let png = frame.encode_png().unwrap();
        let decoded = Frame::decode(&png, 1708300000000, 3).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn rgba_is_flattened_to_rgb() {
        let img = DynamicImage::new_rgba8(3, 2);
        let frame = Frame::from_image(img, 0, 0);
        assert_eq!(frame.format(), PixelFormat::Rgb8);
        assert_eq!(frame.data().len(), 3 * 2 * 3);
    }

    #[test]
    fn pixel_accessor_addresses_interleaved_channels() {
        let mut data = vec![0u8; 2 * 2 * 3];
        data[9..12].copy_from_slice(&[7, 8, 9]);
        let frame = Frame::new(2, 2, PixelFormat::Rgb8, data, 0, 0).unwrap();
        assert_eq!(frame.pixel(1, 1), &[7, 8, 9]);
    }

    #[test]
    fn decode_garbage_fails() {
        assert!(Frame::decode(&[0x00, 0x01, 0x02], 0, 0).is_err());
    }
}
