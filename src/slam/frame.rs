use nalgebra::{Isometry3, Point2};

pub type FrameId = u64;
pub type KeyframeId = u64;
pub type LandmarkId = u64;

/// A 2-D observation, linked to a landmark id that may or may not be triangulated yet
#[derive(Clone, Debug, PartialEq)]
pub struct Keypoint {
    pub lmid: LandmarkId,
    /// Left image position (pixels)
    pub px: Point2<f64>,
    /// Matching position in the right image of a stereo pair
    pub right_px: Option<Point2<f64>>,
    /// Whether the map holds a 3-D position for `lmid`
    pub is_3d: bool,
}

impl Keypoint {
    pub fn new(lmid: LandmarkId, px: Point2<f64>) -> Self {
        Self {
            lmid,
            px,
            right_px: None,
            is_3d: false,
        }
    }
}

/// The frame being tracked, mutated in place during a tick
#[derive(Clone, Debug)]
pub struct Frame {
    pub id: FrameId,
    /// Reference keyframe this frame is tracked against
    pub kfid: KeyframeId,
    pub timestamp: f64,
    pub keypoints: Vec<Keypoint>,
    /// World-from-camera pose
    pub twc: Isometry3<f64>,
}

impl Default for Frame {
    fn default() -> Self {
        Self {
            id: 0,
            kfid: 0,
            timestamp: 0.0,
            keypoints: Vec::new(),
            twc: Isometry3::identity(),
        }
    }
}

impl Frame {
    pub fn nb_3d(&self) -> usize {
        self.keypoints.iter().filter(|kp| kp.is_3d).count()
    }

    pub fn nb_2d(&self) -> usize {
        self.keypoints.len() - self.nb_3d()
    }

    pub fn keypoint(&self, lmid: LandmarkId) -> Option<&Keypoint> {
        self.keypoints.iter().find(|kp| kp.lmid == lmid)
    }

    pub fn tcw(&self) -> Isometry3<f64> {
        self.twc.inverse()
    }
}

/// A promoted frame whose pose and observations are kept as a tracking reference
#[derive(Clone, Debug)]
pub struct Keyframe {
    pub id: KeyframeId,
    pub frame: Frame,
}

impl Keyframe {
    pub fn twc(&self) -> &Isometry3<f64> {
        &self.frame.twc
    }
}
