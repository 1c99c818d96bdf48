//! Keyframe promotion and monocular initialization decisions.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use super::frame::Frame;
use crate::{algorithms::camera::PinholeCamera, config::SlamParams};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TrackingState {
    #[default]
    Uninitialized,
    /// A reference keyframe exists, waiting for enough parallax to bootstrap
    WaitingForInit,
    Tracking,
    /// Pose solving failed even from the keyframe; only `reset` leaves this state
    Lost,
}

/// One-shot keyframe request shared with the back end.
///
/// The front end raises it when it promotes a frame; the back end consumes it
/// with [`take`](Self::take) at its own pace.
#[derive(Clone, Debug, Default)]
pub struct KeyframeRequest(Arc<AtomicBool>);

impl KeyframeRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Returns whether a request was pending and clears it
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }

    pub fn is_pending(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// How [`compute_parallax`] aggregates the shared observations
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParallaxQuery {
    /// Remove the relative rotation before measuring the angle
    pub do_unrot: bool,
    /// Median instead of mean
    pub median: bool,
    /// Only observations without a 3-D landmark
    pub only_2d: bool,
}

impl Default for ParallaxQuery {
    fn default() -> Self {
        Self {
            do_unrot: true,
            median: true,
            only_2d: false,
        }
    }
}

/// Parallax in degrees between `keyframe` and `current` over the landmarks they share.
///
/// `None` when they share no observation.
pub fn compute_parallax(
    camera: &PinholeCamera,
    keyframe: &Frame,
    current: &Frame,
    query: ParallaxQuery,
) -> Option<f64> {
    let rotation = query
        .do_unrot
        .then(|| keyframe.twc.rotation.inverse() * current.twc.rotation);

    let mut angles: Vec<f64> = current
        .keypoints
        .iter()
        .filter(|kp| !(query.only_2d && kp.is_3d))
        .filter_map(|kp| {
            let reference = keyframe.keypoint(kp.lmid)?;
            let bearing = camera.bearing(&kp.px);
            let bearing = match &rotation {
                Some(rotation) => rotation * bearing,
                None => bearing,
            };
            let cosine = camera.bearing(&reference.px).dot(&bearing).clamp(-1.0, 1.0);
            Some(cosine.acos().to_degrees())
        })
        .collect();

    if angles.is_empty() {
        return None;
    }

    if query.median {
        angles.sort_by(f64::total_cmp);
        let middle = angles.len() / 2;
        Some(if angles.len() % 2 == 0 {
            (angles[middle - 1] + angles[middle]) / 2.0
        } else {
            angles[middle]
        })
    } else {
        Some(angles.iter().sum::<f64>() / angles.len() as f64)
    }
}

/// Observed quantities a keyframe decision is based on
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct GateInput {
    /// Parallax to the reference keyframe, in degrees
    pub parallax_deg: f64,
    /// Surviving tracks in the current frame
    pub nb_tracks: usize,
    /// Surviving tracks with a 3-D landmark
    pub nb_3d: usize,
    /// 3-D observations of the reference keyframe
    pub ref_nb_3d: usize,
}

#[derive(Clone, Debug)]
pub struct KeyframeGate {
    pub init_parallax_deg: f64,
    pub init_track_floor: usize,
    pub parallax_deg: f64,
    pub track_floor: usize,
    pub track_ratio: f64,
}

impl From<&SlamParams> for KeyframeGate {
    fn from(params: &SlamParams) -> Self {
        Self {
            init_parallax_deg: params.init_parallax_deg,
            init_track_floor: params.init_track_floor,
            parallax_deg: params.keyframe_parallax_deg,
            track_floor: params.keyframe_track_floor,
            track_ratio: params.keyframe_track_ratio,
        }
    }
}

impl KeyframeGate {
    /// Enough motion and enough tracks to attempt a two-view bootstrap
    pub fn check_ready_for_init(&self, parallax_deg: f64, nb_tracks: usize) -> bool {
        parallax_deg >= self.init_parallax_deg && nb_tracks >= self.init_track_floor
    }

    /// Whether the current frame should be promoted to keyframe
    pub fn check_new_kf_req(&self, input: &GateInput) -> bool {
        let enough_parallax = input.parallax_deg >= self.parallax_deg;
        let few_tracks = input.nb_tracks < self.track_floor;
        let losing_map = (input.nb_3d as f64) < self.track_ratio * input.ref_nb_3d as f64;

        enough_parallax || few_tracks || losing_map
    }

    /// Tracks are below the working floor, a keyframe should be created as soon as possible
    pub fn is_below_floor(&self, nb_tracks: usize) -> bool {
        nb_tracks < self.track_floor
    }
}
