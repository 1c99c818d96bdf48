use nalgebra::{Isometry3, Matrix3, Point2, Point3, Vector3};

/// Pinhole camera model of the (rectified) left camera
///
/// Camera frame: x right, y down, z forward.
#[derive(Clone, Debug, PartialEq)]
pub struct PinholeCamera {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub width: u32,
    pub height: u32,
    /// Stereo baseline; the right camera sits at `+baseline` along x
    pub baseline: Option<f64>,
}

impl PinholeCamera {
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64, width: u32, height: u32) -> Self {
        Self {
            fx,
            fy,
            cx,
            cy,
            width,
            height,
            baseline: None,
        }
    }

    pub fn with_baseline(mut self, baseline: Option<f64>) -> Self {
        self.baseline = baseline;
        self
    }

    /// Camera Intrinsic `3x3` Matrix known as `K`
    pub fn intrinsic(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.fx, 0.0, self.cx, //
            0.0, self.fy, self.cy, //
            0.0, 0.0, 1.0,
        )
    }

    pub fn intrinsic_inverse(&self) -> Matrix3<f64> {
        Matrix3::new(
            1.0 / self.fx,
            0.0,
            -self.cx / self.fx,
            0.0,
            1.0 / self.fy,
            -self.cy / self.fy,
            0.0,
            0.0,
            1.0,
        )
    }

    /// Projects a point expressed in the camera frame, `None` when it is behind the camera
    pub fn project(&self, point: &Point3<f64>) -> Option<Point2<f64>> {
        if point.z <= f64::EPSILON {
            return None;
        }

        Some(Point2::new(
            self.fx * point.x / point.z + self.cx,
            self.fy * point.y / point.z + self.cy,
        ))
    }

    /// Projects into the right camera of a rectified stereo pair
    pub fn project_right(&self, point: &Point3<f64>) -> Option<Point2<f64>> {
        let baseline = self.baseline?;
        self.project(&Point3::new(point.x - baseline, point.y, point.z))
    }

    /// Projects a world point seen from the camera at `twc`
    pub fn project_world(&self, twc: &Isometry3<f64>, world: &Point3<f64>) -> Option<Point2<f64>> {
        self.project(&twc.inverse_transform_point(world))
    }

    /// Unit bearing vector of a pixel
    pub fn bearing(&self, px: &Point2<f64>) -> Vector3<f64> {
        Vector3::new((px.x - self.cx) / self.fx, (px.y - self.cy) / self.fy, 1.0).normalize()
    }

    /// Pixel of a bearing vector; `None` when it points backwards
    pub fn bearing_to_pixel(&self, bearing: &Vector3<f64>) -> Option<Point2<f64>> {
        self.project(&Point3::from(*bearing))
    }

    pub fn contains(&self, px: &Point2<f64>) -> bool {
        px.x >= 0.0 && px.y >= 0.0 && px.x < self.width as f64 && px.y < self.height as f64
    }
}

/// Relative pose candidate `X_2 = R X_1 + t` with the points it triangulates
pub type PoseCandidate = (Matrix3<f64>, Vector3<f64>);

/// Determines which Camera Pose is correct by evaluating the [Cheirality Condition](http://users.cecs.anu.edu.au/~hartley/Papers/cheiral/revision/cheiral.pdf),
/// which is defined as when the transformed point lies in front of the camera.
///
/// Verify that the triangulated point has a Z-value greater than `0` in the first camera,
/// and then the same for the point moved into the second camera `r_3 X + t_3 > 0`.
///
/// Returns the index of the winning candidate and how many points satisfied it.
pub fn disambiguate_camera_pose(
    candidates: &[PoseCandidate],
    x_sets: &[Vec<Vector3<f64>>],
) -> (usize, usize) {
    // compute the score for the set of points belonging to each configuration,
    // and then return the group with the most points in front of the camera views.
    let mut max_satisfied = (0, 0);
    for (i, ((r, t), x_set)) in candidates.iter().zip(x_sets).enumerate() {
        let score = x_set
            .iter()
            .filter(|x| x.z > 0.0 && (r.row(2) * *x)[0] + t.z > 0.0)
            .count();

        if score > max_satisfied.1 {
            max_satisfied = (i, score);
        }
    }

    max_satisfied
}
