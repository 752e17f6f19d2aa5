use frame_settle_common::config::TransformConfig;
use frame_settle_common::Frame;

/// Clockwise quarter-turn rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Rotation {
    #[default]
    None,
    Cw90,
    Cw180,
    Cw270,
}

impl Rotation {
    /// Nearest quarter turn for an angle in degrees.
    pub fn from_degrees(degrees: u32) -> Self {
        match ((degrees + 45) / 90) % 4 {
            1 => Rotation::Cw90,
            2 => Rotation::Cw180,
            3 => Rotation::Cw270,
            _ => Rotation::None,
        }
    }

    fn swaps_axes(self) -> bool {
        matches!(self, Rotation::Cw90 | Rotation::Cw270)
    }
}

/// Orientation and crop applied to every captured frame before settle
/// analysis, vision or preview sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ImageTransform {
    pub rotation: Rotation,
    pub flip_x: bool,
    pub flip_y: bool,
    /// Centered crop after rotation and flipping.
    pub crop: Option<(u32, u32)>,
}

impl ImageTransform {
    pub fn from_config(config: &TransformConfig) -> Self {
        let crop = if config.crop_width > 0 || config.crop_height > 0 {
            Some((config.crop_width, config.crop_height))
        } else {
            None
        };
        Self {
            rotation: Rotation::from_degrees(config.rotation),
            flip_x: config.flip_x,
            flip_y: config.flip_y,
            crop,
        }
    }

    pub fn is_identity(&self) -> bool {
        *self == ImageTransform::default()
    }

    /// Size of a transformed frame whose native size is `width x height`.
    pub fn output_resolution(&self, width: u32, height: u32) -> (u32, u32) {
        let (w, h) = if self.rotation.swaps_axes() {
            (height, width)
        } else {
            (width, height)
        };
        match self.crop {
            Some((cw, ch)) => (crop_dim(cw, w), crop_dim(ch, h)),
            None => (w, h),
        }
    }

    pub fn apply(&self, frame: Frame) -> Frame {
        if self.is_identity() {
            return frame;
        }
        let (captured_at_ms, seq) = (frame.captured_at_ms(), frame.seq());
        let mut img = frame.to_image();
        img = match self.rotation {
            Rotation::None => img,
            Rotation::Cw90 => img.rotate90(),
            Rotation::Cw180 => img.rotate180(),
            Rotation::Cw270 => img.rotate270(),
        };
        if self.flip_x {
            img = img.fliph();
        }
        if self.flip_y {
            img = img.flipv();
        }
        if let Some((cw, ch)) = self.crop {
            let (w, h) = (img.width(), img.height());
            let (cw, ch) = (crop_dim(cw, w), crop_dim(ch, h));
            img = img.crop_imm((w - cw) / 2, (h - ch) / 2, cw, ch);
        }
        Frame::from_image(img, captured_at_ms, seq)
    }
}

fn crop_dim(requested: u32, available: u32) -> u32 {
    if requested == 0 {
        available
    } else {
        requested.min(available)
    }
}
