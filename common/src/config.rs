use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub camera: CameraConfig,
    #[serde(default)]
    pub settle: SettleConfig,
    #[serde(default)]
    pub preview: PreviewConfig,
    #[serde(default)]
    pub focus: FocusConfig,
    #[serde(default)]
    pub parallax: ParallaxConfig,
    #[serde(default)]
    pub switcher: SwitcherConfig,
    #[serde(default)]
    pub simulator: SimulatorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    pub name: String,
    /// Millimeters per pixel at the default working plane.
    #[serde(default = "default_units_per_pixel")]
    pub units_per_pixel_x: f64,
    #[serde(default = "default_units_per_pixel")]
    pub units_per_pixel_y: f64,
    /// Z of the plane at which the units per pixel were calibrated.
    #[serde(default)]
    pub default_z: f64,
    #[serde(default)]
    pub transform: TransformConfig,
}

/// Per-capture image transform, applied before any consumer sees a frame.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TransformConfig {
    /// Clockwise rotation in degrees; only quarter turns are supported.
    #[serde(default)]
    pub rotation: u32,
    #[serde(default)]
    pub flip_x: bool,
    #[serde(default)]
    pub flip_y: bool,
    /// Centered crop, 0 keeps the full dimension.
    #[serde(default)]
    pub crop_width: u32,
    #[serde(default)]
    pub crop_height: u32,
}

/// The difference metric used to decide that the scene has settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub enum SettleMethod {
    /// Sleep a fixed time, no image comparison.
    FixedTime,
    /// L-infinity norm of the pixel difference.
    Maximum,
    /// L1 norm, i.e. mean absolute difference.
    Mean,
    /// L2 norm.
    Euclidean,
    /// Squared L2 norm.
    Square,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SettleConfig {
    /// `None` only in legacy files; resolved by [`SettleConfig::normalized`].
    #[serde(default)]
    pub method: Option<SettleMethod>,
    /// Fixed settle time. Negative values are a legacy encoding of a
    /// `Maximum` threshold.
    #[serde(default = "default_settle_time_ms")]
    pub time_ms: i64,
    #[serde(default = "default_settle_timeout_ms")]
    pub timeout_ms: u64,
    /// Percent difference below which a frame counts as still.
    #[serde(default)]
    pub threshold: f64,
    /// Extra below-threshold frames required before accepting.
    #[serde(default)]
    pub debounce: u32,
    #[serde(default)]
    pub full_color: bool,
    /// Gaussian kernel size in pixels, 0 disables blurring.
    #[serde(default)]
    pub gaussian_blur: u32,
    /// Compare Laplacian gradient images instead of intensities.
    #[serde(default)]
    pub gradients: bool,
    /// Circular mask diameter as a fraction of the smaller image dimension,
    /// 0 disables masking.
    #[serde(default)]
    pub mask_circle: f64,
    /// Contrast stretch blend in `[0, 1]`.
    #[serde(default)]
    pub contrast_enhance: f64,
    #[serde(default)]
    pub diagnostics: bool,
    /// When set, diagnostic heat maps are also written here as PNG.
    #[serde(default)]
    pub diagnostics_dir: Option<PathBuf>,
}

impl Default for SettleConfig {
    fn default() -> Self {
        Self {
            method: None,
            time_ms: default_settle_time_ms(),
            timeout_ms: default_settle_timeout_ms(),
            threshold: 0.0,
            debounce: 0,
            full_color: false,
            gaussian_blur: 0,
            gradients: false,
            mask_circle: 0.0,
            contrast_enhance: 0.0,
            diagnostics: false,
            diagnostics_dir: None,
        }
    }
}

impl SettleConfig {
    /// Resolve legacy and out-of-range values.
    ///
    /// A missing method with a negative `time_ms` is the old encoding of a
    /// `Maximum` threshold in 1/255 units; a missing method otherwise means
    /// `FixedTime`. Blur kernels are forced odd, sizes `<= 1` disable it.
    pub fn normalized(mut self) -> Self {
        if self.method.is_none() {
            if self.time_ms < 0 {
                self.method = Some(SettleMethod::Maximum);
                self.threshold = self.time_ms.unsigned_abs() as f64 / 2.55;
                self.time_ms = default_settle_time_ms();
                debug!(
                    threshold = self.threshold,
                    "migrated legacy negative settle time to Maximum threshold"
                );
            } else {
                self.method = Some(SettleMethod::FixedTime);
            }
        }
        self.gaussian_blur = if self.gaussian_blur <= 1 {
            0
        } else {
            self.gaussian_blur | 1
        };
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.threshold >= 0.0) {
            return Err(ConfigError::Invalid(format!(
                "settle.threshold must be >= 0, got {}",
                self.threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.mask_circle) {
            return Err(ConfigError::Invalid(format!(
                "settle.mask_circle must be within [0, 1], got {}",
                self.mask_circle
            )));
        }
        if !(0.0..=1.0).contains(&self.contrast_enhance) {
            return Err(ConfigError::Invalid(format!(
                "settle.contrast_enhance must be within [0, 1], got {}",
                self.contrast_enhance
            )));
        }
        Ok(())
    }

    pub fn method(&self) -> SettleMethod {
        self.method.unwrap_or(SettleMethod::FixedTime)
    }

    pub fn settle_time(&self) -> Duration {
        Duration::from_millis(self.time_ms.max(0) as u64)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PreviewConfig {
    /// Preview rate for continuous capture, 0 means external trigger only.
    #[serde(default = "default_fps")]
    pub fps: f64,
    /// Pause preview captures while the machine reports busy.
    #[serde(default)]
    pub suspend_in_tasks: bool,
    /// Bounded wait when stopping the preview thread.
    #[serde(default = "default_join_timeout_ms")]
    pub join_timeout_ms: u64,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            fps: default_fps(),
            suspend_in_tasks: false,
            join_timeout_ms: default_join_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FocusConfig {
    /// Search stops once the sample spacing reaches this resolution.
    #[serde(default = "default_focal_resolution_mm")]
    pub focal_resolution_mm: f64,
    #[serde(default = "default_averaged_frames")]
    pub averaged_frames: u32,
    /// Fraction of the nominal machine speed used for focus moves.
    #[serde(default = "default_focus_speed")]
    pub focus_speed: f64,
    #[serde(default = "default_true")]
    pub show_diagnostics: bool,
    /// Backlash retract distance along the approach vector.
    #[serde(default = "default_retract_mm")]
    pub retract_mm: f64,
}

impl Default for FocusConfig {
    fn default() -> Self {
        Self {
            focal_resolution_mm: default_focal_resolution_mm(),
            averaged_frames: default_averaged_frames(),
            focus_speed: default_focus_speed(),
            show_diagnostics: true,
            retract_mm: default_retract_mm(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ParallaxConfig {
    /// Sideways camera move that creates the parallax.
    #[serde(default = "default_shift_distance_mm")]
    pub shift_distance_mm: f64,
    /// Edge length of the square template, pixels.
    #[serde(default = "default_feature_size")]
    pub feature_size: u32,
    /// Z of the camera's perspective center.
    #[serde(default = "default_focal_point_z")]
    pub focal_point_z: f64,
    #[serde(default = "default_averaged_frames")]
    pub averaged_frames: u32,
    #[serde(default = "default_true")]
    pub show_diagnostics: bool,
    /// Sub-pixel refinements larger than this are discarded.
    #[serde(default = "default_max_subpixel_offset")]
    pub max_subpixel_offset: f64,
}

impl Default for ParallaxConfig {
    fn default() -> Self {
        Self {
            shift_distance_mm: default_shift_distance_mm(),
            feature_size: default_feature_size(),
            focal_point_z: default_focal_point_z(),
            averaged_frames: default_averaged_frames(),
            show_diagnostics: true,
            max_subpixel_offset: default_max_subpixel_offset(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SwitcherConfig {
    /// Time for the analog multiplexer to deliver the newly selected signal.
    #[serde(default = "default_switch_delay_ms")]
    pub switch_delay_ms: u64,
}

impl Default for SwitcherConfig {
    fn default() -> Self {
        Self {
            switch_delay_ms: default_switch_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SimulatorConfig {
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default = "default_sim_width")]
    pub width: u32,
    #[serde(default = "default_sim_height")]
    pub height: u32,
    /// Peak sensor noise, intensity units.
    #[serde(default = "default_noise")]
    pub noise: f64,
    /// Vibration amplitude right after a move, pixels.
    #[serde(default = "default_vibration_px")]
    pub vibration_px: f64,
    #[serde(default = "default_vibration_decay_ms")]
    pub vibration_decay_ms: f64,
    /// Z at which the simulated optics are sharp.
    #[serde(default = "default_focus_z")]
    pub focus_z: f64,
    /// Height of the raised feature used for parallax.
    #[serde(default = "default_feature_z")]
    pub feature_z: f64,
    /// Minimum time between two simulated frames.
    #[serde(default = "default_frame_interval_ms")]
    pub frame_interval_ms: u64,
    /// Image directory for the `replay` mode.
    #[serde(default)]
    pub replay_dir: Option<PathBuf>,
    #[serde(default = "default_preview_secs")]
    pub preview_secs: u64,
    #[serde(default = "default_cycles")]
    pub cycles: u32,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            width: default_sim_width(),
            height: default_sim_height(),
            noise: default_noise(),
            vibration_px: default_vibration_px(),
            vibration_decay_ms: default_vibration_decay_ms(),
            focus_z: default_focus_z(),
            feature_z: default_feature_z(),
            frame_interval_ms: default_frame_interval_ms(),
            replay_dir: None,
            preview_secs: default_preview_secs(),
            cycles: default_cycles(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e))?;
        Self::parse(&content)
    }

    /// Parse TOML text, then normalize and validate every section.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut config: Config =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.settle = config.settle.normalized();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.settle.validate()?;
        if !(self.camera.units_per_pixel_x > 0.0 && self.camera.units_per_pixel_y > 0.0) {
            return Err(ConfigError::Invalid(
                "camera.units_per_pixel_x/y must be > 0".into(),
            ));
        }
        if self.camera.transform.rotation % 90 != 0 {
            return Err(ConfigError::Invalid(format!(
                "camera.transform.rotation must be a multiple of 90, got {}",
                self.camera.transform.rotation
            )));
        }
        if !(self.focus.focal_resolution_mm > 0.0) {
            return Err(ConfigError::Invalid(
                "focus.focal_resolution_mm must be > 0".into(),
            ));
        }
        if self.focus.averaged_frames == 0 || self.parallax.averaged_frames == 0 {
            return Err(ConfigError::Invalid(
                "averaged_frames must be at least 1".into(),
            ));
        }
        if self.parallax.feature_size < 3 {
            return Err(ConfigError::Invalid(format!(
                "parallax.feature_size must be at least 3, got {}",
                self.parallax.feature_size
            )));
        }
        if self.parallax.shift_distance_mm == 0.0 {
            return Err(ConfigError::Invalid(
                "parallax.shift_distance_mm must not be 0".into(),
            ));
        }
        if self.preview.fps < 0.0 {
            warn!(fps = self.preview.fps, "negative preview fps, treated as 0");
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    ReadFile(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

// Default value functions
fn default_true() -> bool {
    true
}
fn default_units_per_pixel() -> f64 {
    0.03
}
fn default_settle_time_ms() -> i64 {
    250
}
fn default_settle_timeout_ms() -> u64 {
    500
}
fn default_fps() -> f64 {
    5.0
}
fn default_join_timeout_ms() -> u64 {
    200
}
fn default_focal_resolution_mm() -> f64 {
    0.05
}
fn default_averaged_frames() -> u32 {
    1
}
fn default_focus_speed() -> f64 {
    0.5
}
fn default_retract_mm() -> f64 {
    1.0
}
fn default_shift_distance_mm() -> f64 {
    2.0
}
fn default_feature_size() -> u32 {
    64
}
fn default_focal_point_z() -> f64 {
    60.0
}
fn default_max_subpixel_offset() -> f64 {
    0.6
}
fn default_switch_delay_ms() -> u64 {
    500
}
fn default_mode() -> String {
    "settle".into()
}
fn default_sim_width() -> u32 {
    320
}
fn default_sim_height() -> u32 {
    240
}
fn default_noise() -> f64 {
    2.0
}
fn default_vibration_px() -> f64 {
    6.0
}
fn default_vibration_decay_ms() -> f64 {
    120.0
}
fn default_focus_z() -> f64 {
    -1.2
}
fn default_feature_z() -> f64 {
    1.5
}
fn default_frame_interval_ms() -> u64 {
    20
}
fn default_preview_secs() -> u64 {
    5
}
fn default_cycles() -> u32 {
    3
}
fn default_log_level() -> String {
    "info".into()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [camera]
        name = "top"
    "#;

    #[test]
    fn minimal_file_gets_defaults() {
        let config = Config::parse(MINIMAL).unwrap();
        assert_eq!(config.camera.name, "top");
        assert_eq!(config.settle.method(), SettleMethod::FixedTime);
        assert_eq!(config.settle.timeout_ms, 500);
        assert_eq!(config.preview.fps, 5.0);
        assert_eq!(config.focus.averaged_frames, 1);
        assert!((config.parallax.max_subpixel_offset - 0.6).abs() < 1e-12);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn full_settle_section_parses() {
        let text = r#"
            [camera]
            name = "bottom"
            units_per_pixel_x = 0.02
            units_per_pixel_y = 0.021

            [settle]
            method = "Euclidean"
            timeout_ms = 800
            threshold = 0.6
            debounce = 2
            gaussian_blur = 8
            mask_circle = 0.5
            contrast_enhance = 0.25
            diagnostics = true
        "#;
        let config = Config::parse(text).unwrap();
        assert_eq!(config.settle.method(), SettleMethod::Euclidean);
        assert_eq!(config.settle.debounce, 2);
        // forced odd
        assert_eq!(config.settle.gaussian_blur, 9);
        assert!(config.settle.diagnostics);
    }

    #[test]
    fn legacy_negative_time_becomes_maximum_threshold() {
        let settle = SettleConfig {
            time_ms: -51,
            ..SettleConfig::default()
        }
        .normalized();
        assert_eq!(settle.method(), SettleMethod::Maximum);
        assert!((settle.threshold - 20.0).abs() < 1e-9);
        assert_eq!(settle.time_ms, 250);
    }

    #[test]
    fn tiny_blur_is_disabled() {
        let settle = SettleConfig {
            gaussian_blur: 1,
            ..SettleConfig::default()
        }
        .normalized();
        assert_eq!(settle.gaussian_blur, 0);
    }

    #[test]
    fn negative_threshold_is_rejected() {
        let text = r#"
            [camera]
            name = "top"
            [settle]
            method = "Mean"
            threshold = -1.0
        "#;
        assert!(matches!(Config::parse(text), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn odd_rotation_is_rejected() {
        let text = r#"
            [camera]
            name = "top"
            [camera.transform]
            rotation = 45
        "#;
        assert!(Config::parse(text).is_err());
    }

    #[test]
    fn missing_camera_section_is_a_parse_error() {
        assert!(matches!(Config::parse(""), Err(ConfigError::Parse(_))));
    }
}
