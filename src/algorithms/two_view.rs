//! Two-view epipolar geometry: fundamental matrix estimation with ARRSAC and
//! recovery of the relative pose from the essential matrix.

use arrsac::Arrsac;
use nalgebra::{
    DMatrix, Isometry3, Matrix3, Point2, Point3, Rotation3, Translation3, UnitQuaternion, Vector3,
};
use rand::{rngs::StdRng, SeedableRng};
use sample_consensus::{Consensus, Estimator, Model};

use super::{
    camera::{disambiguate_camera_pose, PinholeCamera, PoseCandidate},
    triangulation::{projection_matrix, triangulate_linear},
};

/// A pixel correspondence from a source image to a destination image
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PixelMatch {
    pub src: Point2<f64>,
    pub dst: Point2<f64>,
}

impl PixelMatch {
    pub fn new(src: Point2<f64>, dst: Point2<f64>) -> Self {
        Self { src, dst }
    }
}

/// Distance between the two points of a match and the epipolar lines of `F`
/// (`dst^T F src = 0`), taking the larger of the two point-to-line distances.
pub fn epipolar_distance(fundamental: &Matrix3<f64>, src: &Point2<f64>, dst: &Point2<f64>) -> f64 {
    let src_homogenous = src.to_homogeneous();
    let dst_homogenous = dst.to_homogeneous();

    // line in the destination image, and its counterpart in the source image
    let dst_line = fundamental * src_homogenous;
    let src_line = fundamental.transpose() * dst_homogenous;
    let algebraic = dst_homogenous.dot(&dst_line).abs();

    let dst_norm = dst_line.x.hypot(dst_line.y);
    let src_norm = src_line.x.hypot(src_line.y);
    if dst_norm < f64::EPSILON || src_norm < f64::EPSILON {
        return if algebraic < f64::EPSILON { 0.0 } else { f64::INFINITY };
    }

    (algebraic / dst_norm).max(algebraic / src_norm)
}

// Implementations for `sample_consensus`

#[derive(Clone, Debug)]
pub struct FundamentalMatrix(pub Matrix3<f64>);

impl Model<PixelMatch> for FundamentalMatrix {
    /// Computes the distance from the Feature Keypoint
    /// to the epipolar line defined through the Fundamental Matrix
    fn residual(&self, data: &PixelMatch) -> f64 {
        epipolar_distance(&self.0, &data.src, &data.dst)
    }
}

/// Normalized 8-point algorithm
#[derive(Default)]
pub struct EightPoint;

/// Similarity moving the centroid to the origin with mean distance sqrt(2)
fn hartley_normalization<'a>(points: impl Iterator<Item = &'a Point2<f64>> + Clone) -> Matrix3<f64> {
    let count = points.clone().count().max(1) as f64;
    let centroid = points.clone().fold(Vector3::zeros(), |acc, p| acc + p.to_homogeneous()) / count;
    let mean_distance = points
        .map(|p| (p.x - centroid.x).hypot(p.y - centroid.y))
        .sum::<f64>()
        / count;
    let scale = if mean_distance > f64::EPSILON {
        std::f64::consts::SQRT_2 / mean_distance
    } else {
        1.0
    };

    Matrix3::new(
        scale, 0.0, -scale * centroid.x, //
        0.0, scale, -scale * centroid.y, //
        0.0, 0.0, 1.0,
    )
}

/// Forces the smallest singular value of a 3x3 matrix to zero
fn enforce_rank2(matrix: Matrix3<f64>) -> Option<Matrix3<f64>> {
    let mut svd = matrix.svd(true, true);
    let smallest = svd.singular_values.imin();
    svd.singular_values[smallest] = 0.0;
    svd.recompose().ok()
}

impl EightPoint {
    /// Least squares fundamental matrix from at least 8 correspondences
    pub fn fundamental(samples: &[PixelMatch]) -> Option<Matrix3<f64>> {
        if samples.len() < <Self as Estimator<PixelMatch>>::MIN_SAMPLES {
            return None;
        }

        let t_src = hartley_normalization(samples.iter().map(|m| &m.src));
        let t_dst = hartley_normalization(samples.iter().map(|m| &m.dst));

        // Setup homogeneous linear equation as dst' * F * src = 0.
        // The zero padding keeps the full right singular basis for exactly 8 samples.
        const COLUMNS: usize = 9;
        let mut matrix_a = DMatrix::<f64>::zeros(samples.len().max(COLUMNS), COLUMNS);

        for (i, sample) in samples.iter().enumerate() {
            let x1 = t_src * sample.src.to_homogeneous();
            let x2 = t_dst * sample.dst.to_homogeneous();

            matrix_a[(i, 0)] = x2.x * x1.x;
            matrix_a[(i, 1)] = x2.x * x1.y;
            matrix_a[(i, 2)] = x2.x;
            matrix_a[(i, 3)] = x2.y * x1.x;
            matrix_a[(i, 4)] = x2.y * x1.y;
            matrix_a[(i, 5)] = x2.y;
            matrix_a[(i, 6)] = x1.x;
            matrix_a[(i, 7)] = x1.y;
            matrix_a[(i, 8)] = 1.0;
        }

        // Solve for the nullspace of the constraint matrix.
        let svd = matrix_a.svd(false, true);
        let matrix_v_t = svd.v_t?;
        let nullspace = matrix_v_t.row(svd.singular_values.imin());
        let normalized = Matrix3::from_row_iterator(nullspace.iter().copied());

        let fundamental = t_dst.transpose() * enforce_rank2(normalized)? * t_src;
        let norm = fundamental.norm();
        (norm > f64::EPSILON).then(|| fundamental / norm)
    }
}

impl Estimator<PixelMatch> for EightPoint {
    const MIN_SAMPLES: usize = 8;
    type Model = FundamentalMatrix;
    type ModelIter = Option<FundamentalMatrix>;

    fn estimate<I>(&self, data: I) -> Self::ModelIter
    where
        I: Iterator<Item = PixelMatch> + Clone,
    {
        let samples: Vec<PixelMatch> = data.collect();
        Self::fundamental(&samples).map(FundamentalMatrix)
    }
}

/// Robustly fits a fundamental matrix to `matches`.
///
/// This is an ARRSAC (Adaptive Real-Time Random Sample Consensus) package,
/// which could perform as well or better than RANSAC.
/// https://people.inf.ethz.ch/pomarc/pubs/RaguramECCV08.pdf
///
/// The consensus model is refit on all of its inliers before returning.
pub fn estimate_fundamental(
    matches: &[PixelMatch],
    inlier_threshold: f64,
    seed: u64,
) -> Option<(Matrix3<f64>, Vec<usize>)> {
    if matches.len() < <EightPoint as Estimator<PixelMatch>>::MIN_SAMPLES {
        return None;
    }

    let (model, inliers) = Arrsac::new(inlier_threshold, StdRng::seed_from_u64(seed))
        .model_inliers(&EightPoint, matches.iter().copied())?;

    let inlier_matches: Vec<PixelMatch> = inliers.iter().map(|&i| matches[i]).collect();
    let refined = EightPoint::fundamental(&inlier_matches).unwrap_or(model.0);
    let inliers = (0..matches.len())
        .filter(|&i| epipolar_distance(&refined, &matches[i].src, &matches[i].dst) <= inlier_threshold)
        .collect();

    Some((refined, inliers))
}

/// Convert from a fundamental matrix to the essential matrix of the calibrated camera
/// and project it onto the essential manifold (two equal singular values, one zero).
pub fn essential_from_fundamental(fundamental: &Matrix3<f64>, camera: &PinholeCamera) -> Option<Matrix3<f64>> {
    // E = K_T F K
    let essential = camera.intrinsic().transpose() * fundamental * camera.intrinsic();

    let mut svd = essential.svd(true, true);
    let smallest = svd.singular_values.imin();
    for i in 0..3 {
        svd.singular_values[i] = if i == smallest { 0.0 } else { 1.0 };
    }
    svd.recompose().ok()
}

/// Convert from Essential Matrix to the four (R, t) configurations with `X_2 = R X_1 + t`
pub fn extract_pose_configurations(essential: &Matrix3<f64>) -> Option<[PoseCandidate; 4]> {
    let svd = essential.svd(true, true);
    let (u, v_t) = (svd.u?, svd.v_t?);

    // order singular vectors so the null direction is last
    let smallest = svd.singular_values.imin();
    let order: Vec<usize> = (0..3).filter(|&i| i != smallest).chain([smallest]).collect();
    let mut matrix_u = Matrix3::from_columns(&[u.column(order[0]), u.column(order[1]), u.column(order[2])]);
    let mut matrix_v_t = Matrix3::from_rows(&[v_t.row(order[0]), v_t.row(order[1]), v_t.row(order[2])]);

    if matrix_u.determinant() < 0.0 {
        matrix_u = -matrix_u;
    }
    if matrix_v_t.determinant() < 0.0 {
        matrix_v_t = -matrix_v_t;
    }

    let matrix_w = Matrix3::new(0.0, -1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0);

    // R = U W V_T and R = U W_T V_T
    let rotation1 = matrix_u * matrix_w * matrix_v_t;
    let rotation2 = matrix_u * matrix_w.transpose() * matrix_v_t;

    // t = u_3 where: U[u_1, u_2, u_3]
    let camera_t = matrix_u.column(2).clone_owned();

    Some([
        (rotation1, camera_t),
        (rotation1, -camera_t),
        (rotation2, camera_t),
        (rotation2, -camera_t),
    ])
}

/// Relative pose between two views recovered from pixel matches
#[derive(Clone, Debug)]
pub struct RelativePose {
    /// Pose of the second camera in the first camera frame, with unit translation
    pub t12: Isometry3<f64>,
    /// Indices into the input matches that agree with the epipolar geometry
    pub inliers: Vec<usize>,
    /// Triangulated inliers in the first camera frame, in the order of `inliers`,
    /// `None` where the point fails cheirality
    pub points: Vec<Option<Vector3<f64>>>,
}

/// Estimates the up-to-scale motion between two views of a static scene
pub fn recover_relative_pose(
    camera: &PinholeCamera,
    matches: &[PixelMatch],
    inlier_threshold: f64,
    seed: u64,
) -> Option<RelativePose> {
    let (fundamental, inliers) = estimate_fundamental(matches, inlier_threshold, seed)?;
    let essential = essential_from_fundamental(&fundamental, camera)?;
    let candidates = extract_pose_configurations(&essential)?;

    let x1: Vec<Point2<f64>> = inliers.iter().map(|&i| matches[i].src).collect();
    let x2: Vec<Point2<f64>> = inliers.iter().map(|&i| matches[i].dst).collect();
    let camera_matrix1 = projection_matrix(camera, &Isometry3::identity());

    let x_sets: Vec<Vec<Vector3<f64>>> = candidates
        .iter()
        .map(|(r, t)| {
            let tcw2 = pose_from_parts(r, t);
            triangulate_linear(&camera_matrix1, &projection_matrix(camera, &tcw2), &x1, &x2)
                .into_iter()
                .flatten()
                .collect()
        })
        .collect();

    // final data for camera pose and 3D coordinates
    let (best, score) = disambiguate_camera_pose(&candidates, &x_sets);
    if score == 0 {
        return None;
    }

    let (r, t) = &candidates[best];
    let t21 = pose_from_parts(r, t);
    let camera_matrix2 = projection_matrix(camera, &t21);
    let points = triangulate_linear(&camera_matrix1, &camera_matrix2, &x1, &x2)
        .into_iter()
        .map(|x| x.filter(|x| x.z > 0.0 && (t21 * Point3::from(*x)).z > 0.0))
        .collect();

    Some(RelativePose {
        t12: t21.inverse(),
        inliers,
        points,
    })
}

fn pose_from_parts(rotation: &Matrix3<f64>, translation: &Vector3<f64>) -> Isometry3<f64> {
    Isometry3::from_parts(
        Translation3::from(*translation),
        UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(*rotation)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::Rng;

    fn camera() -> PinholeCamera {
        PinholeCamera::new(450.0, 450.0, 320.0, 240.0, 640, 480)
    }

    fn scene(count: usize) -> Vec<Point3<f64>> {
        let mut rng = StdRng::seed_from_u64(7);
        (0..count)
            .map(|_| {
                Point3::new(
                    rng.gen_range(-2.0..2.0),
                    rng.gen_range(-1.5..1.5),
                    rng.gen_range(3.0..8.0),
                )
            })
            .collect()
    }

    fn matches_for(twc2: &Isometry3<f64>, points: &[Point3<f64>]) -> Vec<PixelMatch> {
        let cam = camera();
        points
            .iter()
            .filter_map(|p| {
                Some(PixelMatch::new(
                    cam.project(p)?,
                    cam.project_world(twc2, p)?,
                ))
            })
            .collect()
    }

    fn true_fundamental(twc2: &Isometry3<f64>) -> Matrix3<f64> {
        let t21 = twc2.inverse();
        let essential =
            crate::algorithms::lie::skew(&t21.translation.vector) * t21.rotation.to_rotation_matrix().matrix();
        let k_inv = camera().intrinsic_inverse();
        k_inv.transpose() * essential * k_inv
    }

    #[test]
    fn test_epipolar_distance_zero_for_exact_matches() {
        let twc2 = Isometry3::new(Vector3::new(0.4, 0.0, 0.1), Vector3::new(0.0, 0.1, 0.0));
        let fundamental = true_fundamental(&twc2);

        for m in matches_for(&twc2, &scene(20)) {
            assert!(epipolar_distance(&fundamental, &m.src, &m.dst) < 1e-6);
        }
        let off = PixelMatch::new(Point2::new(100.0, 100.0), Point2::new(300.0, 50.0));
        assert!(epipolar_distance(&fundamental, &off.src, &off.dst) > 1.0);
    }

    #[test]
    fn test_eight_point_recovers_epipolar_geometry() {
        let twc2 = Isometry3::new(Vector3::new(0.5, 0.05, 0.2), Vector3::new(0.02, -0.1, 0.01));
        let matches = matches_for(&twc2, &scene(30));
        let fundamental = EightPoint::fundamental(&matches).unwrap();

        for m in &matches {
            assert!(epipolar_distance(&fundamental, &m.src, &m.dst) < 1e-4);
        }
    }

    #[test]
    fn test_ransac_rejects_gross_outliers() {
        let twc2 = Isometry3::new(Vector3::new(0.5, 0.0, 0.1), Vector3::new(0.0, 0.08, 0.0));
        let mut matches = matches_for(&twc2, &scene(60));
        let outliers = [3, 17, 42];
        for &i in &outliers {
            matches[i].dst.x += 40.0;
            matches[i].dst.y -= 35.0;
        }

        let (_, inliers) = estimate_fundamental(&matches, 1.0, 42).unwrap();
        for i in outliers {
            assert!(!inliers.contains(&i));
        }
        assert!(inliers.len() >= matches.len() - outliers.len() - 2);
    }

    #[test]
    fn test_recover_relative_pose() {
        let twc2 = Isometry3::new(Vector3::new(0.6, 0.0, 0.2), Vector3::new(0.0, -0.05, 0.0));
        let matches = matches_for(&twc2, &scene(80));

        let relative = recover_relative_pose(&camera(), &matches, 1.0, 42).unwrap();
        let expected_direction = twc2.translation.vector.normalize();

        assert_relative_eq!(relative.t12.translation.vector, expected_direction, epsilon = 1e-3);
        assert_relative_eq!(
            relative.t12.rotation.angle_to(&twc2.rotation),
            0.0,
            epsilon = 1e-3
        );
        assert!(relative.points.iter().filter(|p| p.is_some()).count() > 70);
    }

    #[test]
    fn test_too_few_matches() {
        let twc2 = Isometry3::translation(0.3, 0.0, 0.0);
        let matches = matches_for(&twc2, &scene(5));
        assert!(estimate_fundamental(&matches, 1.0, 1).is_none());
    }
}
