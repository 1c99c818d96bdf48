//! The front end's window onto the map shared with the back end.
//!
//! The map itself (landmark optimization, keyframe culling, loop closure) lives
//! elsewhere; tracking only needs point lookups, the keyframe registry and a
//! way to hand over freshly triangulated points.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};

use parking_lot::RwLock;
use nalgebra::{Isometry3, Point3};

use super::frame::{Keyframe, KeyframeId, LandmarkId};

/// Map operations used by the front end. Implementations guard their own state;
/// every call is a short critical section.
pub trait MapView: Send + Sync {
    /// World position of a triangulated landmark
    fn landmark(&self, id: LandmarkId) -> Option<Point3<f64>>;

    fn insert_landmark(&self, id: LandmarkId, position: Point3<f64>);

    /// Every triangulated landmark, used to seed tracking against an existing map
    fn landmarks(&self) -> Vec<(LandmarkId, Point3<f64>)>;

    fn keyframe(&self, id: KeyframeId) -> Option<Keyframe>;

    fn insert_keyframe(&self, keyframe: Keyframe);

    /// Reserves a landmark id for a newly detected keypoint
    fn next_landmark_id(&self) -> LandmarkId;
}

/// Lock-guarded in-memory map
#[derive(Default)]
pub struct SharedMap {
    landmarks: RwLock<HashMap<LandmarkId, Point3<f64>>>,
    keyframes: RwLock<HashMap<KeyframeId, Keyframe>>,
    next_lmid: AtomicU64,
}

impl SharedMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn nb_landmarks(&self) -> usize {
        self.landmarks.read().len()
    }

    pub fn nb_keyframes(&self) -> usize {
        self.keyframes.read().len()
    }

    /// Moves a keyframe, as a loop closure correction would
    pub fn set_keyframe_pose(&self, id: KeyframeId, twc: Isometry3<f64>) -> bool {
        match self.keyframes.write().get_mut(&id) {
            Some(keyframe) => {
                keyframe.frame.twc = twc;
                true
            }
            None => false,
        }
    }

    pub fn clear(&self) {
        self.landmarks.write().clear();
        self.keyframes.write().clear();
    }
}

impl MapView for SharedMap {
    fn landmark(&self, id: LandmarkId) -> Option<Point3<f64>> {
        self.landmarks.read().get(&id).copied()
    }

    fn insert_landmark(&self, id: LandmarkId, position: Point3<f64>) {
        self.landmarks.write().insert(id, position);
        // keep ids handed out by `next_landmark_id` clear of externally chosen ones
        self.next_lmid.fetch_max(id + 1, Ordering::Relaxed);
    }

    fn landmarks(&self) -> Vec<(LandmarkId, Point3<f64>)> {
        self.landmarks
            .read()
            .iter()
            .map(|(&id, &position)| (id, position))
            .collect()
    }

    fn keyframe(&self, id: KeyframeId) -> Option<Keyframe> {
        self.keyframes.read().get(&id).cloned()
    }

    fn insert_keyframe(&self, keyframe: Keyframe) {
        self.keyframes.write().insert(keyframe.id, keyframe);
    }

    fn next_landmark_id(&self) -> LandmarkId {
        self.next_lmid.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slam::frame::Frame;
    use std::sync::Arc;

    #[test]
    fn test_landmark_ids_skip_inserted() {
        let map = SharedMap::new();
        assert_eq!(map.next_landmark_id(), 0);

        map.insert_landmark(10, Point3::new(1.0, 2.0, 3.0));
        assert_eq!(map.next_landmark_id(), 11);
        assert_eq!(map.landmark(10), Some(Point3::new(1.0, 2.0, 3.0)));
        assert_eq!(map.landmark(3), None);
        assert_eq!(map.landmarks(), vec![(10, Point3::new(1.0, 2.0, 3.0))]);
    }

    #[test]
    fn test_writes_survive_panicking_writer() {
        let map = Arc::new(SharedMap::new());
        let back_end = map.clone();
        let crashed = std::thread::spawn(move || {
            let _guard = back_end.landmarks.write();
            panic!("back end crashed while holding the map");
        })
        .join();
        assert!(crashed.is_err());

        map.insert_landmark(4, Point3::new(0.0, 0.0, 1.0));
        assert_eq!(map.landmark(4), Some(Point3::new(0.0, 0.0, 1.0)));
        assert_eq!(map.nb_landmarks(), 1);
    }

    #[test]
    fn test_keyframe_pose_edit() {
        let map = SharedMap::new();
        map.insert_keyframe(Keyframe {
            id: 2,
            frame: Frame::default(),
        });

        let moved = Isometry3::translation(1.0, 0.0, 0.0);
        assert!(map.set_keyframe_pose(2, moved));
        assert!(!map.set_keyframe_pose(3, moved));
        assert_eq!(*map.keyframe(2).unwrap().twc(), moved);
        assert_eq!(map.nb_keyframes(), 1);
    }
}
