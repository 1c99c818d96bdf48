//! Motion-only pose refinement from 2D-3D correspondences.
//!
//! Gauss-Newton on SE(3) with a right perturbation `Twc <- Twc * exp(d)`,
//! `d = [rho; phi]`. Observations are re-weighted with a Huber kernel on their
//! reprojection error, then classified with a hard threshold and the pose is
//! refined once more on the inliers.
//!
//! For a camera point `Xc = Tcw * Xw` the perturbation gives
//! `dXc/drho = -I` and `dXc/dphi = [Xc]x`.

use log::debug;
use nalgebra::{
    Isometry3, Matrix2x3, Matrix2x6, Matrix3, Matrix3x6, Matrix6, Point2, Point3, RowVector3, RowVector6, Vector2,
    Vector6,
};

use crate::{
    algorithms::{
        camera::PinholeCamera,
        lie::{exp_se3, skew},
    },
    config::SlamParams,
};

/// Smallest update norm worth another iteration
const CONVERGENCE_EPS: f64 = 1e-9;

/// A 2-D observation of a known world point
#[derive(Clone, Debug, PartialEq)]
pub struct Correspondence {
    pub px: Point2<f64>,
    /// Observation in the right image of a rectified pair
    pub right_px: Option<Point2<f64>>,
    pub landmark: Point3<f64>,
}

impl Correspondence {
    pub fn new(px: Point2<f64>, landmark: Point3<f64>) -> Self {
        Self {
            px,
            right_px: None,
            landmark,
        }
    }

    pub fn with_right(mut self, right_px: Option<Point2<f64>>) -> Self {
        self.right_px = right_px;
        self
    }
}

#[derive(Clone, Debug)]
pub struct PoseEstimate {
    pub twc: Isometry3<f64>,
    /// One flag per input correspondence
    pub inliers: Vec<bool>,
    pub nb_inliers: usize,
}

#[derive(Clone, Debug)]
pub struct PoseSolver {
    pub huber_px: f64,
    pub min_inliers: usize,
    pub max_iterations: usize,
    pub max_reproj_err_px: f64,
}

impl From<&SlamParams> for PoseSolver {
    fn from(params: &SlamParams) -> Self {
        Self {
            huber_px: params.pose_solver_huber_px,
            min_inliers: params.pose_min_inliers,
            max_iterations: params.pose_max_iterations,
            max_reproj_err_px: params.pose_max_reproj_err_px,
        }
    }
}

/// Reprojection residuals of one correspondence and their Jacobians
struct Linearization {
    left: Vector2<f64>,
    left_jacobian: Matrix2x6<f64>,
    right: Option<(f64, RowVector6<f64>)>,
}

fn linearize(camera: &PinholeCamera, tcw: &Isometry3<f64>, obs: &Correspondence) -> Option<Linearization> {
    let xc = tcw * obs.landmark;
    let projected = camera.project(&xc)?;

    let z_inv = 1.0 / xc.z;
    let projection_jacobian = Matrix2x3::new(
        camera.fx * z_inv,
        0.0,
        -camera.fx * xc.x * z_inv * z_inv,
        0.0,
        camera.fy * z_inv,
        -camera.fy * xc.y * z_inv * z_inv,
    );

    let mut point_jacobian = Matrix3x6::zeros();
    point_jacobian
        .fixed_slice_mut::<3, 3>(0, 0)
        .copy_from(&(-Matrix3::<f64>::identity()));
    point_jacobian
        .fixed_slice_mut::<3, 3>(0, 3)
        .copy_from(&skew(&xc.coords));

    let right = match (obs.right_px, camera.baseline) {
        (Some(right_px), Some(baseline)) => {
            let u_right = camera.fx * (xc.x - baseline) * z_inv + camera.cx;
            let row = RowVector3::new(camera.fx * z_inv, 0.0, -camera.fx * (xc.x - baseline) * z_inv * z_inv);
            Some((u_right - right_px.x, row * point_jacobian))
        }
        _ => None,
    };

    Some(Linearization {
        left: projected - obs.px,
        left_jacobian: projection_jacobian * point_jacobian,
        right,
    })
}

impl PoseSolver {
    fn huber_weight(&self, error: f64) -> f64 {
        if error <= self.huber_px {
            1.0
        } else {
            self.huber_px / error
        }
    }

    /// Reprojection error of one correspondence, the worse of both images
    fn reprojection_error(camera: &PinholeCamera, tcw: &Isometry3<f64>, obs: &Correspondence) -> Option<f64> {
        let xc = tcw * obs.landmark;
        let left = (camera.project(&xc)? - obs.px).norm();
        let right = match obs.right_px {
            Some(right_px) => (camera.project_right(&xc)? - right_px).norm(),
            None => 0.0,
        };
        Some(left.max(right))
    }

    /// Huber-weighted Gauss-Newton over the selected correspondences
    fn optimize(
        &self,
        camera: &PinholeCamera,
        mut twc: Isometry3<f64>,
        observations: &[Correspondence],
        selected: &[bool],
    ) -> Isometry3<f64> {
        for iteration in 0..self.max_iterations {
            let tcw = twc.inverse();
            let mut hessian = Matrix6::zeros();
            let mut gradient = Vector6::zeros();
            let mut cost = 0.0;

            for (obs, _) in observations.iter().zip(selected).filter(|&(_, &s)| s) {
                let Some(lin) = linearize(camera, &tcw, obs) else {
                    continue;
                };

                let error = lin.left.norm().max(lin.right.map_or(0.0, |(r, _)| r.abs()));
                let weight = self.huber_weight(error);
                cost += weight * lin.left.norm_squared();

                hessian += weight * lin.left_jacobian.transpose() * lin.left_jacobian;
                gradient += weight * lin.left_jacobian.transpose() * lin.left;

                if let Some((residual, jacobian)) = lin.right {
                    cost += weight * residual * residual;
                    hessian += weight * jacobian.transpose() * jacobian;
                    gradient += weight * jacobian.transpose() * residual;
                }
            }

            let Some(step) = hessian.cholesky().map(|c| -c.solve(&gradient)) else {
                debug!("pose solver: singular normal equations at iteration {iteration}");
                break;
            };

            twc *= exp_se3(&step);
            if step.norm() < CONVERGENCE_EPS {
                break;
            }
            debug!("pose solver iteration {iteration}: cost {cost:.4}");
        }

        twc
    }

    fn classify(&self, camera: &PinholeCamera, twc: &Isometry3<f64>, observations: &[Correspondence]) -> Vec<bool> {
        let tcw = twc.inverse();
        observations
            .iter()
            .map(|obs| {
                Self::reprojection_error(camera, &tcw, obs).map_or(false, |error| error <= self.max_reproj_err_px)
            })
            .collect()
    }

    /// Refines `init_twc` from `observations`; `None` when fewer than
    /// `pose_min_inliers` of them agree with the result.
    pub fn solve(
        &self,
        camera: &PinholeCamera,
        init_twc: &Isometry3<f64>,
        observations: &[Correspondence],
    ) -> Option<PoseEstimate> {
        if observations.len() < self.min_inliers.max(3) {
            debug!("pose solver: {} correspondences, not enough to start", observations.len());
            return None;
        }

        let everything = vec![true; observations.len()];
        let twc = self.optimize(camera, *init_twc, observations, &everything);
        let inliers = self.classify(camera, &twc, observations);

        let twc = self.optimize(camera, twc, observations, &inliers);
        let inliers = self.classify(camera, &twc, observations);
        let nb_inliers = inliers.iter().filter(|&&i| i).count();

        debug!("pose solver: {nb_inliers} / {} inliers", observations.len());
        if nb_inliers < self.min_inliers {
            return None;
        }

        Some(PoseEstimate {
            twc,
            inliers,
            nb_inliers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Vector3;
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use rand_distr::{Distribution, Normal};

    fn camera() -> PinholeCamera {
        PinholeCamera::new(458.0, 457.0, 367.0, 248.0, 752, 480).with_baseline(Some(0.11))
    }

    fn solver() -> PoseSolver {
        PoseSolver::from(&SlamParams::default())
    }

    fn scene(twc: &Isometry3<f64>, count: usize, stereo: bool, seed: u64) -> Vec<Correspondence> {
        let cam = camera();
        let mut rng = StdRng::seed_from_u64(seed);
        let mut observations = Vec::new();
        while observations.len() < count {
            let local = Point3::new(rng.gen_range(-4.0..4.0), rng.gen_range(-3.0..3.0), rng.gen_range(3.0..15.0));
            let Some(px) = cam.project(&local).filter(|px| cam.contains(px)) else {
                continue;
            };
            let right_px = stereo.then(|| cam.project_right(&local)).flatten();
            observations.push(Correspondence::new(px, twc * local).with_right(right_px));
        }
        observations
    }

    fn truth() -> Isometry3<f64> {
        Isometry3::new(Vector3::new(0.4, -0.1, 1.2), Vector3::new(0.02, 0.3, -0.05))
    }

    fn perturbed() -> Isometry3<f64> {
        truth() * Isometry3::new(Vector3::new(0.05, -0.03, 0.08), Vector3::new(0.01, -0.02, 0.015))
    }

    #[test]
    fn test_converges_from_prediction() {
        let observations = scene(&truth(), 60, false, 1);
        let estimate = solver().solve(&camera(), &perturbed(), &observations).unwrap();

        assert_eq!(estimate.nb_inliers, 60);
        assert_relative_eq!(estimate.twc.to_homogeneous(), truth().to_homogeneous(), epsilon = 1e-6);
    }

    #[test]
    fn test_robust_to_outliers() {
        let mut observations = scene(&truth(), 80, false, 2);
        let mut rng = StdRng::seed_from_u64(9);
        for obs in observations.iter_mut().take(16) {
            obs.px += Vector2::new(rng.gen_range(15.0..40.0), rng.gen_range(-40.0..-15.0));
        }

        let estimate = solver().solve(&camera(), &perturbed(), &observations).unwrap();
        assert!(estimate.inliers[..16].iter().all(|&i| !i));
        assert_eq!(estimate.nb_inliers, 64);
        assert_relative_eq!(estimate.twc.translation.vector, truth().translation.vector, epsilon = 1e-5);
    }

    #[test]
    fn test_noisy_stereo() {
        let mut observations = scene(&truth(), 80, true, 3);
        let noise = Normal::new(0.0, 0.3).unwrap();
        let mut rng = StdRng::seed_from_u64(4);
        for obs in observations.iter_mut() {
            obs.px += Vector2::new(noise.sample(&mut rng), noise.sample(&mut rng));
        }

        let estimate = solver().solve(&camera(), &perturbed(), &observations).unwrap();
        assert!(estimate.nb_inliers >= 75);
        assert!((estimate.twc.translation.vector - truth().translation.vector).norm() < 0.05);
        assert!(estimate.twc.rotation.angle_to(&truth().rotation) < 0.01);
    }

    #[test]
    fn test_too_few_inliers() {
        let observations = scene(&truth(), 5, false, 5);
        assert!(solver().solve(&camera(), &truth(), &observations).is_none());

        // enough correspondences, but they all disagree
        let mut observations = scene(&truth(), 30, false, 6);
        let mut rng = StdRng::seed_from_u64(7);
        for obs in observations.iter_mut() {
            obs.px = Point2::new(rng.gen_range(0.0..752.0), rng.gen_range(0.0..480.0));
        }
        assert!(solver().solve(&camera(), &truth(), &observations).is_none());
    }
}
