use nalgebra::{Isometry3, Matrix3x4, Matrix4, Point2, Point3, RowVector4, Vector3};

use super::camera::PinholeCamera;

/// Camera matrix `P = K [R | t]` for a camera whose pose maps points as `X_c = R X + t`
pub fn projection_matrix(camera: &PinholeCamera, tcw: &Isometry3<f64>) -> Matrix3x4<f64> {
    let mut extrinsic = Matrix3x4::zeros();
    extrinsic
        .fixed_slice_mut::<3, 3>(0, 0)
        .copy_from(tcw.rotation.to_rotation_matrix().matrix());
    extrinsic
        .fixed_slice_mut::<3, 1>(0, 3)
        .copy_from(&tcw.translation.vector);

    camera.intrinsic() * extrinsic
}

/// Linear (DLT) triangulation of pixel correspondences between two cameras.
///
/// Points at infinity or not determined by the two rays come back as `None`.
pub fn triangulate_linear(
    camera_matrix1: &Matrix3x4<f64>,
    camera_matrix2: &Matrix3x4<f64>,
    x1_set: &[Point2<f64>],
    x2_set: &[Point2<f64>],
) -> Vec<Option<Vector3<f64>>> {
    x1_set
        .iter()
        .zip(x2_set)
        .map(|(x1, x2)| {
            let row = |x: f64, p: &Matrix3x4<f64>, r: usize| {
                RowVector4::new(
                    x * p[(2, 0)] - p[(r, 0)],
                    x * p[(2, 1)] - p[(r, 1)],
                    x * p[(2, 2)] - p[(r, 2)],
                    x * p[(2, 3)] - p[(r, 3)],
                )
            };

            let matrix_a = Matrix4::from_rows(&[
                row(x1.y, camera_matrix1, 1),
                row(x1.x, camera_matrix1, 0),
                row(x2.y, camera_matrix2, 1),
                row(x2.x, camera_matrix2, 0),
            ]);

            // the solution is the right singular vector of the smallest singular value
            let svd = matrix_a.svd(false, true);
            let matrix_v_t = svd.v_t?;
            let solution = matrix_v_t.row(svd.singular_values.imin());

            // convert to homogenous coordinates and back into euclidean
            let w = solution[3];
            if w.abs() < 1e-12 {
                return None;
            }

            Some(Vector3::new(solution[0], solution[1], solution[2]) / w)
        })
        .collect()
}

/// Depth from a rectified stereo match, expressed in the left camera frame
pub fn triangulate_stereo(
    camera: &PinholeCamera,
    left: &Point2<f64>,
    right: &Point2<f64>,
) -> Option<Point3<f64>> {
    let baseline = camera.baseline?;
    let disparity = left.x - right.x;
    if disparity <= f64::EPSILON {
        return None;
    }

    let z = camera.fx * baseline / disparity;
    Some(Point3::new(
        (left.x - camera.cx) * z / camera.fx,
        (left.y - camera.cy) * z / camera.fy,
        z,
    ))
}
