//! Front end parameters loaded from YAML.
//!
//! Every field has a default, so a parameter file only needs to name what it
//! changes:
//!
//! ```yaml
//! use_encoder: true
//! wheelbase: 0.5
//! camera:
//!   fx: 458.0
//!   fy: 457.0
//!   cx: 367.0
//!   cy: 248.0
//!   width: 752
//!   height: 480
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{algorithms::camera::PinholeCamera, error::ConfigError, sensors::EncoderConfig};

/// Image preprocessing applied before building the pyramid
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PreprocessMode {
    #[default]
    None,
    /// Contrast limited adaptive histogram equalization
    Clahe,
    /// Linear stretch of the 1st..99th intensity percentiles to the full range
    HistogramStretch,
}

/// Pinhole calibration of the left camera, plus the stereo baseline
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CameraParams {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub width: u32,
    pub height: u32,
    /// Distance between the rectified left and right optical centers (meters)
    #[serde(default)]
    pub baseline: Option<f64>,
}

impl Default for CameraParams {
    fn default() -> Self {
        Self {
            fx: 458.0,
            fy: 457.0,
            cx: 367.0,
            cy: 248.0,
            width: 752,
            height: 480,
            baseline: None,
        }
    }
}

impl CameraParams {
    pub fn to_camera(&self) -> PinholeCamera {
        PinholeCamera::new(self.fx, self.fy, self.cx, self.cy, self.width, self.height)
            .with_baseline(self.baseline)
    }
}

/// Full parameter set of the visual front end
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SlamParams {
    pub camera: CameraParams,
    /// Track the right image as well (requires `camera.baseline`)
    pub stereo: bool,

    pub use_encoder: bool,
    /// Distance between the wheel contact points (meters)
    pub wheelbase: f64,

    /// KLT window half size (pixels)
    pub klt_window: usize,
    pub klt_pyramid_levels: usize,
    pub klt_max_iter: usize,
    /// KLT convergence threshold (pixels)
    pub klt_epsilon: f64,
    pub klt_min_eigenvalue: f64,
    /// Maximum forward-backward tracking disagreement (pixels)
    pub klt_max_fb_dist_px: f64,

    pub epipolar_threshold_px: f64,

    pub keyframe_parallax_deg: f64,
    pub keyframe_track_floor: usize,
    /// Request a keyframe when 3-D tracks drop below this share of the reference keyframe's
    pub keyframe_track_ratio: f64,

    pub init_parallax_deg: f64,
    pub init_track_floor: usize,

    pub preprocess_mode: PreprocessMode,
    pub clahe_clip_limit: f64,
    /// CLAHE tile grid is `clahe_tiles x clahe_tiles`
    pub clahe_tiles: u32,

    pub fast_threshold: u8,
    pub max_keypoints: usize,
    /// Side of the occupancy cells used to spread keypoints (pixels)
    pub cell_size: u32,

    pub pose_solver_huber_px: f64,
    pub pose_min_inliers: usize,
    pub pose_max_iterations: usize,
    /// Reprojection error above which an observation is an outlier (pixels)
    pub pose_max_reproj_err_px: f64,

    pub ransac_seed: u64,
}

impl Default for SlamParams {
    fn default() -> Self {
        Self {
            camera: CameraParams::default(),
            stereo: false,
            use_encoder: false,
            wheelbase: 0.5,
            klt_window: 9,
            klt_pyramid_levels: 3,
            klt_max_iter: 30,
            klt_epsilon: 0.01,
            klt_min_eigenvalue: 1e-4,
            klt_max_fb_dist_px: 0.5,
            epipolar_threshold_px: 2.0,
            keyframe_parallax_deg: 2.0,
            keyframe_track_floor: 20,
            keyframe_track_ratio: 0.75,
            init_parallax_deg: 3.0,
            init_track_floor: 50,
            preprocess_mode: PreprocessMode::None,
            clahe_clip_limit: 3.0,
            clahe_tiles: 8,
            fast_threshold: 20,
            max_keypoints: 300,
            cell_size: 35,
            pose_solver_huber_px: 1.0,
            pose_min_inliers: 10,
            pose_max_iterations: 10,
            pose_max_reproj_err_px: 2.45,
            ransac_seed: 42,
        }
    }
}

impl SlamParams {
    /// Load parameters from a YAML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse and validate parameters from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let params: Self = serde_yaml::from_str(yaml)?;
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_owned()));

        if self.camera.fx <= 0.0 || self.camera.fy <= 0.0 {
            return invalid("focal lengths must be positive");
        }
        if self.camera.width == 0 || self.camera.height == 0 {
            return invalid("image size must be non-zero");
        }
        if self.stereo && !self.camera.baseline.map_or(false, |b| b > 0.0) {
            return invalid("stereo requires a positive camera.baseline");
        }
        if self.use_encoder && self.wheelbase <= 0.0 {
            return invalid("wheelbase must be positive when use_encoder is set");
        }
        if self.klt_window == 0 || self.klt_pyramid_levels == 0 || self.klt_max_iter == 0 {
            return invalid("klt_window, klt_pyramid_levels and klt_max_iter must be non-zero");
        }
        if self.epipolar_threshold_px <= 0.0 || self.pose_solver_huber_px <= 0.0 {
            return invalid("pixel thresholds must be positive");
        }
        if self.pose_max_reproj_err_px <= 0.0 || self.klt_max_fb_dist_px <= 0.0 {
            return invalid("pixel thresholds must be positive");
        }
        if self.keyframe_parallax_deg <= 0.0 || self.init_parallax_deg <= 0.0 {
            return invalid("parallax thresholds must be positive");
        }
        if self.klt_epsilon <= 0.0 {
            return invalid("klt_epsilon must be positive");
        }
        if self.cell_size == 0 || self.clahe_tiles == 0 {
            return invalid("cell_size and clahe_tiles must be non-zero");
        }
        if self.pose_min_inliers < 3 {
            return invalid("pose_min_inliers must be at least 3");
        }

        Ok(())
    }

    pub fn encoder_config(&self) -> EncoderConfig {
        EncoderConfig {
            wheelbase: self.wheelbase,
            enabled: self.use_encoder,
        }
    }
}
