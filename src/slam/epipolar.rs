//! Epipolar outlier rejection of tracked correspondences.
//!
//! With a pose prior, the fundamental matrix comes straight from the two
//! predicted poses. Without one (monocular bootstrap) it is estimated from the
//! correspondences themselves with ARRSAC.

use log::debug;
use nalgebra::{Isometry3, Matrix3, Point2, Point3};

use crate::algorithms::{
    camera::PinholeCamera,
    lie::skew,
    two_view::{epipolar_distance, estimate_fundamental, PixelMatch},
};

/// Below this baseline (in map units) two views carry no epipolar information
pub const MIN_BASELINE: f64 = 1e-6;

#[derive(Clone, Debug)]
pub struct EpipolarFilter {
    threshold: f64,
    do_unrot: bool,
}

impl EpipolarFilter {
    pub fn new(threshold_px: f64) -> Self {
        Self {
            threshold: threshold_px,
            do_unrot: true,
        }
    }

    /// Whether current points are de-rotated before measuring their distance
    pub fn with_unrotation(mut self, do_unrot: bool) -> Self {
        self.do_unrot = do_unrot;
        self
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Fundamental matrix with `x_cur^T F x_prev = 0`, `None` for a pure rotation
    pub fn fundamental(
        camera: &PinholeCamera,
        prev_twc: &Isometry3<f64>,
        cur_twc: &Isometry3<f64>,
    ) -> Option<Matrix3<f64>> {
        let t_cur_prev = cur_twc.inverse() * prev_twc;
        let translation = t_cur_prev.translation.vector;
        if translation.norm() < MIN_BASELINE {
            return None;
        }

        let essential = skew(&translation) * t_cur_prev.rotation.to_rotation_matrix().matrix();
        let k_inv = camera.intrinsic_inverse();
        Some(k_inv.transpose() * essential * k_inv)
    }

    /// Flags which of `matches` (previous -> current pixels) agree with the two
    /// predicted poses. Everything is kept when the poses share an optical center.
    pub fn filter(
        &self,
        camera: &PinholeCamera,
        prev_twc: &Isometry3<f64>,
        cur_twc: &Isometry3<f64>,
        matches: &[PixelMatch],
    ) -> Vec<bool> {
        let Some(fundamental) = Self::fundamental(camera, prev_twc, cur_twc) else {
            debug!("no baseline between predicted poses, skipping epipolar filter");
            return vec![true; matches.len()];
        };

        let t_cur_prev = cur_twc.inverse() * prev_twc;
        // once rotated back, the current camera differs from the previous one by a translation only
        let unrotated_fundamental = self.do_unrot.then(|| {
            let k_inv = camera.intrinsic_inverse();
            let translation = t_cur_prev.rotation.inverse() * t_cur_prev.translation.vector;
            k_inv.transpose() * skew(&translation) * k_inv
        });

        let keep: Vec<bool> = matches
            .iter()
            .map(|m| {
                let distance = unrotated_fundamental
                    .as_ref()
                    .and_then(|unrotated_fundamental| {
                        let dst = unrotate(camera, &t_cur_prev, &m.dst)?;
                        Some(epipolar_distance(unrotated_fundamental, &m.src, &dst))
                    })
                    .unwrap_or_else(|| epipolar_distance(&fundamental, &m.src, &m.dst));
                distance <= self.threshold
            })
            .collect();

        debug!(
            "epipolar filter kept {} / {} matches",
            keep.iter().filter(|&&k| k).count(),
            matches.len()
        );

        keep
    }

    /// Flags matches consistent with a fundamental matrix fit by ARRSAC, or
    /// `None` when no model could be fit
    pub fn filter_estimated(&self, matches: &[PixelMatch], seed: u64) -> Option<Vec<bool>> {
        let (_, inliers) = estimate_fundamental(matches, self.threshold, seed)?;

        let mut keep = vec![false; matches.len()];
        for i in inliers {
            keep[i] = true;
        }
        Some(keep)
    }
}

/// Pixel of `px` in a camera rotated back by the relative rotation `t_cur_prev`, so
/// that the only remaining motion from the previous camera is a translation
pub fn unrotate(camera: &PinholeCamera, t_cur_prev: &Isometry3<f64>, px: &Point2<f64>) -> Option<Point2<f64>> {
    let bearing = t_cur_prev.rotation.inverse() * camera.bearing(px);
    camera.project(&Point3::from(bearing))
}
