//! Pose prediction for the next frame.
//!
//! Two sources of motion are supported:
//! - constant twist: the body-frame velocity between the last two accepted
//!   poses is carried forward;
//! - wheel encoders: differential-drive kinematics give the twist directly and
//!   vision never overwrites it.
//!
//! # Coordinate Frame
//!
//! Camera body frame: x right, y down, z forward. The encoder twist is
//! `[0, 0, v, 0, w, 0]`: forward speed along z and yaw rate about y. A positive
//! yaw rate (left wheel travelling further than the right one) turns the
//! forward axis towards +x, i.e. the platform turns right.

use log::{error, warn};
use nalgebra::{Isometry3, Vector6};

use crate::{
    algorithms::lie::{exp_se3, is_near_identity, log_se3},
    error::{FrontendError, Result},
    sensors::{EncoderConfig, EncoderReading},
};

/// Tangent-space tolerance under which the given pose is considered unchanged
const ANCHOR_TOLERANCE: f64 = 1e-5;

#[derive(Clone, Copy, Debug)]
struct EncoderState {
    wheelbase: f64,
    /// Travel at the last accepted frame, `None` until the first reading arrives
    prev_travel: Option<(f64, f64)>,
    /// Most recent reading consumed by `apply`
    latest_travel: Option<(f64, f64)>,
}

/// Predicts the current camera pose from the previous one.
#[derive(Clone, Debug)]
pub struct MotionPredictor {
    prev_time: Option<f64>,
    prev_twc: Isometry3<f64>,
    /// Body-frame velocity `[v; w]` per second
    twist: Vector6<f64>,
    encoder: Option<EncoderState>,
}

impl Default for MotionPredictor {
    fn default() -> Self {
        Self::new(EncoderConfig::default())
    }
}

impl MotionPredictor {
    pub fn new(config: EncoderConfig) -> Self {
        Self {
            prev_time: None,
            prev_twc: Isometry3::identity(),
            twist: Vector6::zeros(),
            encoder: config.enabled.then(|| EncoderState {
                wheelbase: config.wheelbase,
                prev_travel: None,
                latest_travel: None,
            }),
        }
    }

    pub fn uses_encoder(&self) -> bool {
        self.encoder.is_some()
    }

    pub fn is_initialized(&self) -> bool {
        self.prev_time.is_some()
    }

    /// Timestamp of the last accepted pose, `None` before the first update
    pub fn prev_time(&self) -> Option<f64> {
        self.prev_time
    }

    /// Anchor pose the twist is applied from
    pub fn prev_twc(&self) -> &Isometry3<f64> {
        &self.prev_twc
    }

    pub fn twist(&self) -> &Vector6<f64> {
        &self.twist
    }

    /// Predicts the pose at time `time` starting from the most recently accepted pose `twc`.
    ///
    /// The first call only initializes the predictor and returns `twc` unchanged.
    ///
    /// `twc` is normally the pose stored by the last [`update`](Self::update). When it is
    /// not (a loop closure or relocalization moved the trajectory) the anchor follows it,
    /// while the twist is carried forward unchanged.
    ///
    /// With encoders enabled the twist is recomputed from `encoder`; without a reading
    /// the previous twist is extrapolated.
    pub fn apply(
        &mut self,
        twc: &Isometry3<f64>,
        time: f64,
        encoder: Option<&EncoderReading>,
    ) -> Isometry3<f64> {
        let Some(prev_time) = self.prev_time else {
            self.initialize(twc, time);
            // the first reading becomes the baseline
            if let (Some(state), Some(reading)) = (self.encoder.as_mut(), encoder) {
                let travel = (reading.left_wheel_travel, reading.right_wheel_travel);
                state.prev_travel = Some(travel);
                state.latest_travel = Some(travel);
            }
            return *twc;
        };

        if !is_near_identity(&(twc * self.prev_twc.inverse()), ANCHOR_TOLERANCE) {
            warn!("given pose differs from the motion model anchor, re-anchoring");
            self.prev_twc = *twc;
        }

        let dt = time - prev_time;

        if let Some(state) = self.encoder.as_mut() {
            match encoder {
                Some(reading) => {
                    let travel = (reading.left_wheel_travel, reading.right_wheel_travel);
                    let (prev_left, prev_right) = *state.prev_travel.get_or_insert(travel);
                    state.latest_travel = Some(travel);

                    if dt > 0.0 {
                        let d_left = travel.0 - prev_left;
                        let d_right = travel.1 - prev_right;
                        let velocity = (d_left + d_right) / 2.0 / dt;
                        let angular_velocity = (d_left - d_right) / state.wheelbase / dt;
                        self.twist = Vector6::new(0.0, 0.0, velocity, 0.0, angular_velocity, 0.0);
                    }
                }
                None => warn!(
                    "wheel encoder enabled but no reading at t = {time:.6}, extrapolating last twist"
                ),
            }
        }

        twc * exp_se3(&(self.twist * dt))
    }

    /// Records the pose accepted for time `time`.
    ///
    /// Time running backwards is fatal: the returned error means upstream
    /// timestamps are corrupt and the caller must not continue silently.
    pub fn update(&mut self, twc: &Isometry3<f64>, time: f64) -> Result<()> {
        let Some(prev_time) = self.prev_time else {
            self.initialize(twc, time);
            return Ok(());
        };

        let dt = time - prev_time;
        if dt < 0.0 || dt.is_nan() {
            error!("got image older than previous image ({time} < {prev_time})");
            return Err(FrontendError::TimeRegression {
                previous: prev_time,
                current: time,
            });
        }

        match self.encoder.as_mut() {
            Some(state) => {
                if let Some(latest) = state.latest_travel {
                    state.prev_travel = Some(latest);
                }
            }
            None if dt > 0.0 => {
                let t_prev_cur = self.prev_twc.inverse() * twc;
                self.twist = log_se3(&t_prev_cur) / dt;
            }
            None => {}
        }

        self.prev_twc = *twc;
        self.prev_time = Some(time);

        Ok(())
    }

    fn initialize(&mut self, twc: &Isometry3<f64>, time: f64) {
        self.prev_time = Some(time);
        self.prev_twc = *twc;
        self.twist = Vector6::zeros();
    }

    /// Restarts the constant-twist estimate from `twc` at `time`.
    ///
    /// Unlike [`reset`](Self::reset) the encoder baseline moves to the last
    /// consumed reading, so wheel travel after this point is still integrated.
    pub fn restart(&mut self, twc: &Isometry3<f64>, time: f64) {
        self.initialize(twc, time);
        if let Some(state) = self.encoder.as_mut() {
            if let Some(latest) = state.latest_travel {
                state.prev_travel = Some(latest);
            }
        }
    }

    /// Back to the uninitialized state; the next encoder reading is a fresh baseline
    pub fn reset(&mut self) {
        self.prev_time = None;
        self.prev_twc = Isometry3::identity();
        self.twist = Vector6::zeros();
        if let Some(state) = self.encoder.as_mut() {
            state.prev_travel = None;
            state.latest_travel = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{Translation3, UnitQuaternion, Vector3};

    fn encoder_predictor(wheelbase: f64) -> MotionPredictor {
        MotionPredictor::new(EncoderConfig {
            wheelbase,
            enabled: true,
        })
    }

    #[test]
    fn test_first_apply_initializes() {
        let mut predictor = MotionPredictor::default();
        let pose = Isometry3::translation(1.0, 2.0, 3.0);

        assert_eq!(predictor.apply(&pose, 5.0, None), pose);
        assert_eq!(predictor.prev_time(), Some(5.0));
        assert_eq!(*predictor.prev_twc(), pose);
        assert_eq!(*predictor.twist(), Vector6::zeros());
    }

    #[test]
    fn test_update_stores_accepted_pose() {
        let mut predictor = MotionPredictor::default();
        let poses = [
            Isometry3::translation(0.0, 0.0, 0.0),
            Isometry3::translation(0.0, 0.0, 0.1),
            Isometry3::new(Vector3::new(0.05, 0.0, 0.2), Vector3::new(0.0, 0.1, 0.0)),
        ];

        for (i, pose) in poses.iter().enumerate() {
            let t = i as f64 * 0.1;
            predictor.apply(pose, t, None);
            predictor.update(pose, t).unwrap();

            assert_eq!(predictor.prev_twc(), pose);
            assert_eq!(predictor.prev_time(), Some(t));
        }
    }

    #[test]
    fn test_constant_twist_extrapolation() {
        let mut predictor = MotionPredictor::default();
        let start = Isometry3::identity();
        let next = Isometry3::new(Vector3::new(0.1, 0.0, 0.3), Vector3::new(0.0, 0.2, 0.0));

        predictor.update(&start, 0.0).unwrap();
        predictor.update(&next, 0.5).unwrap();
        let xi = log_se3(&next) / 0.5;
        assert_relative_eq!(*predictor.twist(), xi, epsilon = 1e-12);

        for dt in [0.01, 0.5, 1.3] {
            let predicted = predictor.apply(&next, 0.5 + dt, None);
            let expected = next * exp_se3(&(xi * dt));
            assert_relative_eq!(predicted.to_homogeneous(), expected.to_homogeneous(), epsilon = 1e-12);
        }
    }

    #[test]
    fn test_loop_closure_reanchors() {
        let mut predictor = MotionPredictor::default();
        predictor.update(&Isometry3::identity(), 0.0).unwrap();
        let before_jump = Isometry3::translation(0.0, 0.0, 0.2);
        predictor.update(&before_jump, 0.1).unwrap();
        let xi = *predictor.twist();

        let jumped = Isometry3::translation(1.0, 0.0, 0.2);
        let predicted = predictor.apply(&jumped, 0.2, None);

        assert_relative_eq!(
            predicted.to_homogeneous(),
            (jumped * exp_se3(&(xi * 0.1))).to_homogeneous(),
            epsilon = 1e-12
        );
        assert_eq!(*predictor.prev_twc(), jumped);

        // the next update measures motion from the new anchor, not across the jump
        predictor.update(&predicted, 0.2).unwrap();
        assert_relative_eq!(*predictor.twist(), xi, epsilon = 1e-9);
    }

    #[test]
    fn test_time_regression_is_fatal() {
        let mut predictor = MotionPredictor::default();
        predictor.update(&Isometry3::identity(), 1.0).unwrap();

        let err = predictor.update(&Isometry3::identity(), 0.5).unwrap_err();
        assert!(matches!(
            err,
            FrontendError::TimeRegression { previous, current } if previous == 1.0 && current == 0.5
        ));
    }

    #[test]
    fn test_same_timestamp_keeps_twist() {
        let mut predictor = MotionPredictor::default();
        predictor.update(&Isometry3::identity(), 0.0).unwrap();
        predictor.update(&Isometry3::translation(0.0, 0.0, 0.1), 0.1).unwrap();
        let xi = *predictor.twist();

        predictor.update(&Isometry3::translation(0.0, 0.0, 0.1), 0.1).unwrap();
        assert_eq!(*predictor.twist(), xi);
    }

    #[test]
    fn test_encoder_forward() {
        let mut predictor = encoder_predictor(0.5);
        let mut pose = Isometry3::identity();

        for i in 0..5 {
            let t = i as f64 * 0.1;
            let reading = EncoderReading::new(0.1 * i as f64, 0.1 * i as f64, t);
            pose = predictor.apply(&pose, t, Some(&reading));
            predictor.update(&pose, t).unwrap();
        }

        assert_relative_eq!(*predictor.twist(), Vector6::new(0.0, 0.0, 1.0, 0.0, 0.0, 0.0), epsilon = 1e-12);
        assert_relative_eq!(pose.translation.vector, Vector3::new(0.0, 0.0, 0.4), epsilon = 1e-12);
    }

    #[test]
    fn test_encoder_pure_yaw() {
        let mut predictor = encoder_predictor(0.5);
        predictor.apply(&Isometry3::identity(), 0.0, Some(&EncoderReading::new(0.0, 0.0, 0.0)));
        predictor.update(&Isometry3::identity(), 0.0).unwrap();

        let pose = predictor.apply(&Isometry3::identity(), 0.1, Some(&EncoderReading::new(0.1, -0.1, 0.1)));

        assert_relative_eq!(*predictor.twist(), Vector6::new(0.0, 0.0, 0.0, 0.0, 4.0, 0.0), epsilon = 1e-12);
        assert_relative_eq!(pose.translation.vector, Vector3::zeros(), epsilon = 1e-12);
        assert_relative_eq!(
            pose.rotation,
            UnitQuaternion::from_axis_angle(&Vector3::y_axis(), 0.4),
            epsilon = 1e-12
        );
        // yawing about +y swings the forward axis towards +x
        assert!((pose.rotation * Vector3::z()).x > 0.0);
    }

    #[test]
    fn test_encoder_twist_components() {
        for (d_left, d_right) in [(0.2, 0.2), (0.05, 0.05), (0.3, -0.3), (-0.1, 0.1)] {
            let mut predictor = encoder_predictor(0.4);
            predictor.apply(&Isometry3::identity(), 0.0, Some(&EncoderReading::new(0.0, 0.0, 0.0)));
            predictor.update(&Isometry3::identity(), 0.0).unwrap();
            predictor.apply(&Isometry3::identity(), 0.2, Some(&EncoderReading::new(d_left, d_right, 0.2)));

            let xi = predictor.twist();
            if d_left == d_right {
                assert_eq!(xi[4], 0.0);
            }
            if d_left == -d_right {
                assert_eq!(xi[2], 0.0);
            }
        }
    }

    #[test]
    fn test_first_reading_seeds_baseline() {
        // absolute travel on the first reading must not turn into a spurious jump
        let mut predictor = encoder_predictor(0.5);
        let first = EncoderReading::new(152.7, 149.1, 0.0);
        let pose = predictor.apply(&Isometry3::identity(), 0.0, Some(&first));
        predictor.update(&pose, 0.0).unwrap();

        let pose = predictor.apply(&pose, 0.1, Some(&EncoderReading::new(152.8, 149.2, 0.1)));
        assert_relative_eq!(pose.translation.vector, Vector3::new(0.0, 0.0, 0.1), epsilon = 1e-9);
    }

    #[test]
    fn test_encoder_not_overwritten_by_vision() {
        let mut predictor = encoder_predictor(0.5);
        predictor.apply(&Isometry3::identity(), 0.0, Some(&EncoderReading::new(0.0, 0.0, 0.0)));
        predictor.update(&Isometry3::identity(), 0.0).unwrap();
        predictor.apply(&Isometry3::identity(), 0.1, Some(&EncoderReading::new(0.1, 0.1, 0.1)));

        // vision disagrees and reports a sideways motion
        let measured = Isometry3::from_parts(Translation3::new(0.3, 0.0, 0.0), UnitQuaternion::identity());
        predictor.update(&measured, 0.1).unwrap();
        assert_relative_eq!(*predictor.twist(), Vector6::new(0.0, 0.0, 1.0, 0.0, 0.0, 0.0), epsilon = 1e-12);
    }

    #[test]
    fn test_missing_reading_extrapolates() {
        let mut predictor = encoder_predictor(0.5);
        predictor.apply(&Isometry3::identity(), 0.0, Some(&EncoderReading::new(0.0, 0.0, 0.0)));
        predictor.update(&Isometry3::identity(), 0.0).unwrap();
        let pose = predictor.apply(&Isometry3::identity(), 0.1, Some(&EncoderReading::new(0.1, 0.1, 0.1)));
        predictor.update(&pose, 0.1).unwrap();

        let stale = predictor.apply(&pose, 0.2, None);
        assert_relative_eq!(stale.translation.vector, Vector3::new(0.0, 0.0, 0.2), epsilon = 1e-12);

        // cumulative travel catches the prediction up on the missed interval
        predictor.update(&stale, 0.2).unwrap();
        let next = predictor.apply(&stale, 0.3, Some(&EncoderReading::new(0.3, 0.3, 0.3)));
        assert_relative_eq!(*predictor.twist(), Vector6::new(0.0, 0.0, 2.0, 0.0, 0.0, 0.0), epsilon = 1e-9);
        assert_relative_eq!(next.translation.vector, Vector3::new(0.0, 0.0, 0.4), epsilon = 1e-9);
    }

    #[test]
    fn test_nan_timestamp_is_rejected() {
        let mut predictor = MotionPredictor::default();
        predictor.update(&Isometry3::identity(), 1.0).unwrap();

        assert!(predictor.update(&Isometry3::identity(), f64::NAN).is_err());
        assert_eq!(predictor.prev_time(), Some(1.0));
        assert!(predictor.update(&Isometry3::identity(), 0.2).is_err());
    }

    #[test]
    fn test_restart_keeps_encoder_baseline() {
        let mut predictor = encoder_predictor(0.5);
        predictor.apply(&Isometry3::identity(), 0.0, Some(&EncoderReading::new(0.0, 0.0, 0.0)));
        predictor.update(&Isometry3::identity(), 0.0).unwrap();
        let pose = predictor.apply(&Isometry3::identity(), 0.1, Some(&EncoderReading::new(0.1, 0.1, 0.1)));

        let anchor = Isometry3::translation(1.0, 0.0, 0.0);
        predictor.restart(&anchor, 0.1);
        assert_eq!(*predictor.twist(), Vector6::zeros());
        assert_eq!(*predictor.prev_twc(), anchor);
        assert!(pose.translation.vector.z > 0.0);

        // travel from 0.1 to 0.2 still counts after the restart
        let next = predictor.apply(&anchor, 0.2, Some(&EncoderReading::new(0.2, 0.2, 0.2)));
        assert_relative_eq!(*predictor.twist(), Vector6::new(0.0, 0.0, 1.0, 0.0, 0.0, 0.0), epsilon = 1e-9);
        assert_relative_eq!(next.translation.vector, Vector3::new(1.0, 0.0, 0.1), epsilon = 1e-9);
    }

    #[test]
    fn test_reset() {
        let mut predictor = MotionPredictor::default();
        predictor.update(&Isometry3::identity(), 0.0).unwrap();
        predictor.update(&Isometry3::translation(0.1, 0.0, 0.0), 0.1).unwrap();

        predictor.reset();
        assert!(!predictor.is_initialized());
        assert_eq!(*predictor.twist(), Vector6::zeros());

        // timestamps may restart after a reset
        assert!(predictor.update(&Isometry3::identity(), 0.0).is_ok());
    }
}
