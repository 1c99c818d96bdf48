//! Sparse KLT tracking between two pyramids.

use std::sync::Arc;

use log::debug;
use nalgebra::{Matrix2, Point2, Vector2};

use super::pyramid::{ImagePyramid, PyramidLevel};
use crate::config::SlamParams;

/// Tracking primitive: refines a location in `dst` for every point of `src`,
/// starting from the predicted locations. `None` marks a lost point.
pub trait FeatureTracker: Send + Sync {
    fn track(
        &self,
        src: &ImagePyramid,
        dst: &ImagePyramid,
        src_points: &[Point2<f64>],
        predicted: &[Point2<f64>],
    ) -> Vec<Option<Point2<f64>>>;
}

/// Configuration for the Lucas-Kanade tracker
#[derive(Debug, Clone)]
pub struct LkConfig {
    /// Window half size, the window is `2 * window + 1` pixels wide
    pub window: usize,
    /// Maximum number of iterations per pyramid level
    pub max_iterations: usize,
    /// Stop once the update is smaller than this (pixels)
    pub epsilon: f64,
    /// Minimum eigenvalue of the normalized structure tensor
    pub min_eigenvalue: f64,
}

impl Default for LkConfig {
    fn default() -> Self {
        Self {
            window: 9,
            max_iterations: 30,
            epsilon: 0.01,
            min_eigenvalue: 1e-4,
        }
    }
}

impl From<&SlamParams> for LkConfig {
    fn from(params: &SlamParams) -> Self {
        Self {
            window: params.klt_window,
            max_iterations: params.klt_max_iter,
            epsilon: params.klt_epsilon,
            min_eigenvalue: params.klt_min_eigenvalue,
        }
    }
}

/// Inverse-compositional pyramidal Lucas-Kanade, coarse to fine
#[derive(Debug, Clone, Default)]
pub struct PyramidalLk {
    config: LkConfig,
}

impl PyramidalLk {
    pub fn new(config: LkConfig) -> Self {
        Self { config }
    }

    /// Refines `guess` at one level; `None` when the patch is untrackable
    fn track_at_level(
        &self,
        src: &PyramidLevel,
        dst: &PyramidLevel,
        point: Point2<f64>,
        guess: Point2<f64>,
    ) -> Option<Point2<f64>> {
        let half = self.config.window as i32;
        let half_f = half as f64;
        if !src.contains_window(point.x, point.y, half_f) {
            return None;
        }

        // template intensities and gradients, normalized to [0, 1]
        let mut template = Vec::with_capacity(((2 * half + 1) * (2 * half + 1)) as usize);
        let mut tensor = Matrix2::zeros();
        for dy in -half..=half {
            for dx in -half..=half {
                let (x, y) = (point.x + dx as f64, point.y + dy as f64);
                let (gx, gy) = src.gradient(x, y);
                let gradient = Vector2::new(gx, gy) / 255.0;
                tensor += gradient * gradient.transpose();
                template.push((dx, dy, src.intensity(x, y) / 255.0, gradient));
            }
        }

        let area = template.len() as f64;
        let min_eigenvalue = (tensor / area).symmetric_eigenvalues().min();
        if min_eigenvalue < self.config.min_eigenvalue {
            return None;
        }
        let inverse = tensor.try_inverse()?;

        let mut current = guess;
        for _ in 0..self.config.max_iterations {
            if !dst.contains_window(current.x, current.y, half_f) {
                return None;
            }

            let mismatch = template
                .iter()
                .fold(Vector2::<f64>::zeros(), |acc, (dx, dy, value, gradient)| {
                    let warped = dst.intensity(current.x + *dx as f64, current.y + *dy as f64) / 255.0;
                    acc + gradient * (warped - value)
                });

            let step = inverse * mismatch;
            current -= step;
            if step.norm() < self.config.epsilon {
                break;
            }
        }

        dst.contains_window(current.x, current.y, 0.0).then_some(current)
    }
}

impl FeatureTracker for PyramidalLk {
    fn track(
        &self,
        src: &ImagePyramid,
        dst: &ImagePyramid,
        src_points: &[Point2<f64>],
        predicted: &[Point2<f64>],
    ) -> Vec<Option<Point2<f64>>> {
        let nb_levels = src.nb_levels().min(dst.nb_levels());

        src_points
            .iter()
            .zip(predicted)
            .map(|(point, prior)| {
                let top = (nb_levels - 1) as i32;
                let mut guess = prior / 2f64.powi(top);

                for level in (0..nb_levels).rev() {
                    let scale = 2f64.powi(level as i32);
                    let refined = self.track_at_level(&src.levels[level], &dst.levels[level], point / scale, guess);

                    guess = match refined {
                        Some(refined) => refined,
                        // coarse levels may clip the window, only the full resolution must succeed
                        None if level > 0 => guess,
                        None => return None,
                    };

                    if level > 0 {
                        guess *= 2.0;
                    }
                }

                Some(guess)
            })
            .collect()
    }
}

/// Wraps a [`FeatureTracker`] with a forward-backward consistency check.
#[derive(Clone)]
pub struct KltStage {
    tracker: Arc<dyn FeatureTracker>,
    max_fb_dist: f64,
    max_row_dist: f64,
}

impl KltStage {
    pub fn new(tracker: Arc<dyn FeatureTracker>, params: &SlamParams) -> Self {
        Self {
            tracker,
            max_fb_dist: params.klt_max_fb_dist_px,
            max_row_dist: params.epipolar_threshold_px,
        }
    }

    /// Tracks `src_points` from `src` into `dst`.
    ///
    /// A point is kept only if tracking its refined location back lands within
    /// `klt_max_fb_dist_px` of where it started.
    pub fn track(
        &self,
        src: &ImagePyramid,
        dst: &ImagePyramid,
        src_points: &[Point2<f64>],
        predicted: &[Point2<f64>],
    ) -> Vec<Option<Point2<f64>>> {
        let mut forward = self.tracker.track(src, dst, src_points, predicted);

        let (indices, tracked): (Vec<usize>, Vec<Point2<f64>>) = forward
            .iter()
            .enumerate()
            .filter_map(|(i, p)| p.map(|p| (i, p)))
            .unzip();
        let priors: Vec<_> = indices.iter().map(|&i| src_points[i]).collect();
        let backward = self.tracker.track(dst, src, &tracked, &priors);

        let mut nb_rejected = 0;
        for (&i, back) in indices.iter().zip(backward) {
            let consistent = back.map_or(false, |back| (back - src_points[i]).norm() <= self.max_fb_dist);
            if !consistent {
                forward[i] = None;
                nb_rejected += 1;
            }
        }

        debug!(
            "klt {} -> {}: {} / {} tracked, {} failed forward-backward",
            src.frame_id,
            dst.frame_id,
            forward.iter().flatten().count(),
            src_points.len(),
            nb_rejected
        );

        forward
    }

    /// Left to right matching of a rectified stereo pair; a match must stay on the
    /// same row and have positive disparity
    pub fn track_stereo(
        &self,
        left: &ImagePyramid,
        right: &ImagePyramid,
        points: &[Point2<f64>],
    ) -> Vec<Option<Point2<f64>>> {
        self.track(left, right, points, points)
            .into_iter()
            .zip(points)
            .map(|(matched, left_px)| {
                matched.filter(|right_px| {
                    (right_px.y - left_px.y).abs() <= self.max_row_dist && left_px.x - right_px.x > 0.0
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slam::pyramid::Side;
    use image::{GrayImage, ImageBuffer, Luma};

    /// Smooth blobs, shifted by `offset`
    fn blobs(offset: Vector2<f64>) -> GrayImage {
        let centers = [(40.0, 40.0), (90.0, 55.0), (60.0, 100.0), (120.0, 90.0), (30.0, 85.0)];
        ImageBuffer::from_fn(160, 128, |x, y| {
            let value = centers.iter().fold(40.0, |acc, (cx, cy)| {
                let dx = x as f64 - cx - offset.x;
                let dy = y as f64 - cy - offset.y;
                acc + 180.0 * (-(dx * dx + dy * dy) / (2.0 * 36.0)).exp()
            });
            Luma([value.min(255.0) as u8])
        })
    }

    fn pyramid(frame_id: u64, image: GrayImage) -> ImagePyramid {
        ImagePyramid::build(frame_id, Side::Left, image, 3, 7)
    }

    fn tracker() -> PyramidalLk {
        PyramidalLk::new(LkConfig {
            window: 7,
            ..LkConfig::default()
        })
    }

    #[test]
    fn test_tracks_translation() {
        let shift = Vector2::new(3.4, -2.2);
        let src = pyramid(0, blobs(Vector2::zeros()));
        let dst = pyramid(1, blobs(shift));

        let points = [Point2::new(36.0, 37.0), Point2::new(94.0, 52.0), Point2::new(64.0, 104.0)];
        let tracked = tracker().track(&src, &dst, &points, &points);

        for (point, tracked) in points.iter().zip(tracked) {
            let tracked = tracked.unwrap();
            assert!((tracked - (point + shift)).norm() < 0.3, "{tracked} vs {}", point + shift);
        }
    }

    #[test]
    fn test_prior_helps_large_motion() {
        let shift = Vector2::new(18.0, 0.0);
        let src = pyramid(0, blobs(Vector2::zeros()));
        let dst = pyramid(1, blobs(shift));

        let points = [Point2::new(36.0, 37.0)];
        let priors = [Point2::new(36.0 + 17.0, 37.5)];
        let tracked = tracker().track(&src, &dst, &points, &priors)[0].unwrap();
        assert!((tracked - (points[0] + shift)).norm() < 0.3);
    }

    #[test]
    fn test_flat_patch_is_rejected() {
        let flat = pyramid(0, ImageBuffer::from_pixel(160, 128, Luma([90u8])));
        let points = [Point2::new(80.0, 64.0)];
        assert_eq!(tracker().track(&flat, &flat, &points, &points), vec![None]);
    }

    #[test]
    fn test_forward_backward_rejects_inconsistent() {
        /// Moves every point right; the backward pass does not come back
        struct Drifting;
        impl FeatureTracker for Drifting {
            fn track(
                &self,
                _: &ImagePyramid,
                _: &ImagePyramid,
                src_points: &[Point2<f64>],
                _: &[Point2<f64>],
            ) -> Vec<Option<Point2<f64>>> {
                src_points.iter().map(|p| Some(p + Vector2::new(2.0, 0.0))).collect()
            }
        }

        let image = pyramid(0, blobs(Vector2::zeros()));
        let params = SlamParams::default();

        let stage = KltStage::new(Arc::new(Drifting), &params);
        let points = [Point2::new(40.0, 40.0)];
        assert_eq!(stage.track(&image, &image, &points, &points), vec![None]);

        let stage = KltStage::new(Arc::new(tracker()), &params);
        let shifted = pyramid(1, blobs(Vector2::new(1.5, 0.5)));
        assert!(stage.track(&image, &shifted, &points, &points)[0].is_some());
    }

    #[test]
    fn test_stereo_requires_positive_disparity() {
        let left = pyramid(0, blobs(Vector2::zeros()));
        let right_good = pyramid(0, blobs(Vector2::new(-4.0, 0.0)));
        let right_bad = pyramid(0, blobs(Vector2::new(4.0, 0.0)));
        let stage = KltStage::new(Arc::new(tracker()), &SlamParams::default());

        let points = [Point2::new(40.0, 40.0)];
        let matched = stage.track_stereo(&left, &right_good, &points)[0].unwrap();
        assert!((matched.x - 36.0).abs() < 0.3);
        assert!(stage.track_stereo(&left, &right_bad, &points)[0].is_none());
    }
}
