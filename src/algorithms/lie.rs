//! Exponential and logarithm maps of SO(3) and SE(3) over `nalgebra` isometries.
//!
//! Tangent vectors of SE(3) are ordered `[translation (3); rotation (3)]`,
//! so a body-frame twist reads `[v_x, v_y, v_z, w_x, w_y, w_z]`.

use nalgebra::{Isometry3, Matrix3, Translation3, UnitQuaternion, Vector3, Vector6};

const SMALL_ANGLE_THRESHOLD: f64 = 1e-8;

/// Skew-symmetric matrix `[v]x` such that `[v]x u = v x u`
#[inline]
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(
        0.0, -v.z, v.y, //
        v.z, 0.0, -v.x, //
        -v.y, v.x, 0.0,
    )
}

/// Left Jacobian of SO(3), the `V` matrix coupling rotation and translation in `exp`
fn left_jacobian(phi: &Vector3<f64>) -> Matrix3<f64> {
    let theta = phi.norm();
    let phi_x = skew(phi);

    if theta < SMALL_ANGLE_THRESHOLD {
        return Matrix3::identity() + 0.5 * phi_x;
    }

    let theta_sq = theta * theta;
    Matrix3::identity()
        + ((1.0 - theta.cos()) / theta_sq) * phi_x
        + ((theta - theta.sin()) / (theta_sq * theta)) * phi_x * phi_x
}

fn left_jacobian_inverse(phi: &Vector3<f64>) -> Matrix3<f64> {
    let theta = phi.norm();
    let phi_x = skew(phi);

    if theta < SMALL_ANGLE_THRESHOLD {
        return Matrix3::identity() - 0.5 * phi_x + (1.0 / 12.0) * phi_x * phi_x;
    }

    let half = 0.5 * theta;
    let coeff = (1.0 - half * half.cos() / half.sin()) / (theta * theta);
    Matrix3::identity() - 0.5 * phi_x + coeff * phi_x * phi_x
}

/// SO(3) exponential: rotation vector to unit quaternion
#[inline]
pub fn exp_so3(phi: &Vector3<f64>) -> UnitQuaternion<f64> {
    UnitQuaternion::from_scaled_axis(*phi)
}

/// SO(3) logarithm: unit quaternion to rotation vector with angle in `[0, pi]`
#[inline]
pub fn log_so3(rotation: &UnitQuaternion<f64>) -> Vector3<f64> {
    rotation.scaled_axis()
}

/// SE(3) exponential map
pub fn exp_se3(xi: &Vector6<f64>) -> Isometry3<f64> {
    let rho = Vector3::new(xi[0], xi[1], xi[2]);
    let phi = Vector3::new(xi[3], xi[4], xi[5]);

    Isometry3::from_parts(
        Translation3::from(left_jacobian(&phi) * rho),
        exp_so3(&phi),
    )
}

/// SE(3) logarithm map, inverse of [`exp_se3`]
pub fn log_se3(pose: &Isometry3<f64>) -> Vector6<f64> {
    let phi = log_so3(&pose.rotation);
    let rho = left_jacobian_inverse(&phi) * pose.translation.vector;

    Vector6::new(rho.x, rho.y, rho.z, phi.x, phi.y, phi.z)
}

/// Whether `pose` is the identity up to `tolerance` in tangent-space norm
#[inline]
pub fn is_near_identity(pose: &Isometry3<f64>, tolerance: f64) -> bool {
    log_se3(pose).norm() <= tolerance
}
