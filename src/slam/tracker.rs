//! Frame-to-frame visual tracking.
//!
//! [`VisualFrontEnd::track`] runs once per image: it predicts the pose, tracks
//! the previous keypoints with KLT, rejects epipolar outliers, refines the pose
//! against the map and decides whether the frame becomes a keyframe. A
//! monocular front end first waits for enough parallax to bootstrap the map
//! from two views.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use image::GrayImage;
use log::{debug, error, info, warn};
use nalgebra::{Isometry3, Matrix3, Point2, Point3};

use super::{
    epipolar::EpipolarFilter,
    features::KeypointDetector,
    frame::{Frame, FrameId, Keyframe, KeyframeId, Keypoint, LandmarkId},
    keyframe_gate::{compute_parallax, GateInput, KeyframeGate, KeyframeRequest, ParallaxQuery, TrackingState},
    klt::{FeatureTracker, KltStage},
    map::MapView,
    motion_model::MotionPredictor,
    pose_solver::{Correspondence, PoseSolver},
    pyramid::{ImagePyramid, PyramidCache},
};
use crate::{
    algorithms::{
        camera::PinholeCamera,
        triangulation::{projection_matrix, triangulate_linear, triangulate_stereo},
        two_view::{recover_relative_pose, PixelMatch},
    },
    config::SlamParams,
    error::{FrontendError, Result},
    sensors::EncoderReading,
};

/// Smallest angle between the two rays of a keyframe triangulation
const MIN_TRIANGULATION_ANGLE_DEG: f64 = 0.5;

/// Soft outcomes of a tick, reported alongside the pose
#[derive(Clone, Debug, PartialEq)]
pub enum TrackingEvent {
    /// The pose could not be recovered, the front end holds until `reset`
    TrackingLost,
    /// Fewer surviving tracks than the working floor
    InsufficientTracks { tracked: usize, floor: usize },
    /// Encoders are enabled but the tick carried no reading
    MissingEncoder,
    /// Frame-to-frame tracking fell short and the reference keyframe was tracked
    /// into the current image instead
    KltFallback { frame_to_frame: usize, recovered: usize },
}

/// Counters describing one tick
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TrackingStats {
    /// Keypoints surviving KLT and the epipolar filter
    pub nb_tracked: usize,
    pub nb_epipolar_rejected: usize,
    /// 2D-3D correspondences handed to the pose solver
    pub nb_pose_candidates: usize,
    pub nb_inliers: usize,
    /// Parallax to the reference keyframe in degrees, when measured
    pub parallax_deg: Option<f64>,
}

#[derive(Clone, Debug)]
pub struct TrackResult {
    /// World-from-camera pose of the frame, or of the last accepted one when lost
    pub pose: Isometry3<f64>,
    pub keyframe_requested: bool,
    pub lost: bool,
    pub state: TrackingState,
    pub events: Vec<TrackingEvent>,
    pub stats: TrackingStats,
}

pub struct VisualFrontEnd {
    params: SlamParams,
    camera: PinholeCamera,
    map: Arc<dyn MapView>,
    detector: Arc<dyn KeypointDetector>,

    predictor: MotionPredictor,
    pyramids: PyramidCache,
    klt: KltStage,
    epipolar: EpipolarFilter,
    pose_solver: PoseSolver,
    gate: KeyframeGate,
    request: KeyframeRequest,

    state: TrackingState,
    /// Last accepted frame
    frame: Frame,
    /// Reference keyframe tracks are measured against
    keyframe: Option<Keyframe>,
    next_frame_id: FrameId,
    next_keyframe_id: KeyframeId,
    /// Set by a timestamp regression, `(previous, current)`
    poisoned: Option<(f64, f64)>,
}

impl VisualFrontEnd {
    pub fn new(
        params: SlamParams,
        map: Arc<dyn MapView>,
        tracker: Arc<dyn FeatureTracker>,
        detector: Arc<dyn KeypointDetector>,
    ) -> Result<Self> {
        params.validate()?;

        Ok(Self {
            camera: params.camera.to_camera(),
            predictor: MotionPredictor::new(params.encoder_config()),
            pyramids: PyramidCache::new(&params),
            klt: KltStage::new(tracker, &params),
            epipolar: EpipolarFilter::new(params.epipolar_threshold_px),
            pose_solver: PoseSolver::from(&params),
            gate: KeyframeGate::from(&params),
            request: KeyframeRequest::new(),
            state: TrackingState::default(),
            frame: Frame::default(),
            keyframe: None,
            next_frame_id: 0,
            next_keyframe_id: 0,
            poisoned: None,
            params,
            map,
            detector,
        })
    }

    pub fn state(&self) -> TrackingState {
        self.state
    }

    /// The last accepted frame
    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    pub fn keyframe(&self) -> Option<&Keyframe> {
        self.keyframe.as_ref()
    }

    pub fn predictor(&self) -> &MotionPredictor {
        &self.predictor
    }

    pub fn camera(&self) -> &PinholeCamera {
        &self.camera
    }

    /// Handle the back end polls for new keyframes
    pub fn keyframe_request(&self) -> KeyframeRequest {
        self.request.clone()
    }

    /// Replaces the pose of the last accepted frame, e.g. after a loop closure.
    ///
    /// The next prediction notices the jump and re-anchors on it.
    pub fn correct_pose(&mut self, twc: Isometry3<f64>) {
        self.frame.twc = twc;
    }

    /// Forgets everything tracked so far, the next image starts a new session
    pub fn reset(&mut self) {
        info!("resetting visual front end");
        self.predictor.reset();
        self.pyramids.reset();
        self.state = TrackingState::Uninitialized;
        self.frame = Frame::default();
        self.keyframe = None;
        self.poisoned = None;
        // a request from the previous session refers to keyframes that no longer exist
        self.request.take();
    }

    /// Tracks one image (and its right counterpart in stereo mode) taken at
    /// `timestamp`.
    ///
    /// Returns an error for malformed input or a timestamp older than the last
    /// accepted one; the latter is fatal until [`reset`](Self::reset).
    pub fn track(
        &mut self,
        left: &GrayImage,
        right: Option<&GrayImage>,
        timestamp: f64,
        encoder: Option<EncoderReading>,
    ) -> Result<TrackResult> {
        if let Some((previous, current)) = self.poisoned {
            return Err(FrontendError::TimeRegression { previous, current });
        }
        self.check_input(left, right, timestamp)?;

        if let Some(previous) = self.predictor.prev_time() {
            if timestamp < previous {
                error!("timestamp went back from {previous} to {timestamp}, front end halted until reset");
                self.poisoned = Some((previous, timestamp));
                return Err(FrontendError::TimeRegression {
                    previous,
                    current: timestamp,
                });
            }
        }

        if self.state == TrackingState::Lost {
            return Ok(self.result(false, vec![TrackingEvent::TrackingLost], TrackingStats::default()));
        }

        let frame_id = self.next_frame_id;
        self.next_frame_id += 1;
        self.pyramids.ingest(frame_id, left);
        if let (true, Some(right)) = (self.params.stereo, right) {
            self.pyramids.ingest_right(frame_id, right);
        }

        let mut events = Vec::new();
        if self.predictor.uses_encoder() && encoder.is_none() {
            events.push(TrackingEvent::MissingEncoder);
        }

        match self.state {
            TrackingState::Uninitialized => self.track_first_frame(frame_id, timestamp, encoder.as_ref(), events),
            _ => self.track_frame(frame_id, timestamp, encoder.as_ref(), events),
        }
    }

    fn check_input(&self, left: &GrayImage, right: Option<&GrayImage>, timestamp: f64) -> Result<()> {
        if !timestamp.is_finite() {
            return Err(FrontendError::InvalidTimestamp(timestamp));
        }
        let expected = (self.camera.width, self.camera.height);
        for image in std::iter::once(left).chain(right) {
            if image.dimensions() != expected {
                return Err(FrontendError::ImageSizeMismatch {
                    expected,
                    actual: image.dimensions(),
                });
            }
        }
        if self.params.stereo && right.is_none() {
            return Err(FrontendError::MissingRightImage);
        }
        Ok(())
    }

    fn result(&self, keyframe_requested: bool, events: Vec<TrackingEvent>, stats: TrackingStats) -> TrackResult {
        TrackResult {
            pose: self.frame.twc,
            keyframe_requested,
            lost: self.state == TrackingState::Lost,
            state: self.state,
            events,
            stats,
        }
    }

    fn commit(&mut self, frame: Frame) {
        self.pyramids.commit_frame();
        self.frame = frame;
    }

    /// The first image becomes the first keyframe
    fn track_first_frame(
        &mut self,
        frame_id: FrameId,
        timestamp: f64,
        encoder: Option<&EncoderReading>,
        events: Vec<TrackingEvent>,
    ) -> Result<TrackResult> {
        let twc = self.frame.twc;
        self.predictor.apply(&twc, timestamp, encoder);
        self.predictor.update(&twc, timestamp)?;

        let mut frame = Frame {
            id: frame_id,
            kfid: 0,
            timestamp,
            keypoints: self.adopt_map_landmarks(&twc),
            twc,
        };
        let nb_adopted = frame.keypoints.len();
        self.create_keyframe(&mut frame);

        self.state = if nb_adopted >= self.params.init_track_floor {
            info!("{nb_adopted} map landmarks in view, tracking against the existing map");
            TrackingState::Tracking
        } else if self.params.stereo && frame.nb_3d() >= self.params.pose_min_inliers {
            info!("stereo initialization with {} landmarks", frame.nb_3d());
            TrackingState::Tracking
        } else {
            TrackingState::WaitingForInit
        };

        let stats = TrackingStats {
            nb_tracked: frame.keypoints.len(),
            ..TrackingStats::default()
        };
        self.commit(frame);
        Ok(self.result(true, events, stats))
    }

    fn track_frame(
        &mut self,
        frame_id: FrameId,
        timestamp: f64,
        encoder: Option<&EncoderReading>,
        events: Vec<TrackingEvent>,
    ) -> Result<TrackResult> {
        self.refresh_keyframe();
        let mut stats = TrackingStats::default();

        let prev_twc = self.frame.twc;
        let predicted = self.predictor.apply(&prev_twc, timestamp, encoder);

        let tracked = match (self.pyramids.previous(), self.pyramids.current()) {
            (Some(previous), Some(current)) => {
                self.track_keypoints(previous, current, &self.frame.keypoints, &prev_twc, &predicted)
            }
            _ => Vec::new(),
        };

        // the bootstrap runs its own robust estimation, a pose prior exists only once tracking
        let keypoints = if self.state == TrackingState::Tracking {
            let (keypoints, nb_rejected) = self.epipolar_prune(tracked, &self.frame, &predicted);
            stats.nb_epipolar_rejected = nb_rejected;
            keypoints
        } else {
            tracked
        };

        let frame = Frame {
            id: frame_id,
            kfid: self.frame.kfid,
            timestamp,
            keypoints,
            twc: predicted,
        };
        stats.nb_tracked = frame.keypoints.len();

        if self.state == TrackingState::WaitingForInit {
            self.try_initialize(frame, timestamp, events, stats)
        } else {
            self.track_against_map(frame, timestamp, events, stats)
        }
    }

    /// Monocular two-view bootstrap, or another stereo attempt at finding depth
    fn try_initialize(
        &mut self,
        mut frame: Frame,
        timestamp: f64,
        mut events: Vec<TrackingEvent>,
        mut stats: TrackingStats,
    ) -> Result<TrackResult> {
        if self.params.stereo {
            self.predictor.update(&frame.twc, timestamp)?;
            self.create_keyframe(&mut frame);
            if frame.nb_3d() >= self.params.pose_min_inliers {
                info!("stereo initialization with {} landmarks", frame.nb_3d());
                self.state = TrackingState::Tracking;
            }
            self.commit(frame);
            return Ok(self.result(true, events, stats));
        }

        // rotation is part of what the bootstrap has to explain, keep it in the parallax
        let raw = ParallaxQuery {
            do_unrot: false,
            ..ParallaxQuery::default()
        };
        let parallax = self
            .keyframe
            .as_ref()
            .and_then(|keyframe| compute_parallax(&self.camera, &keyframe.frame, &frame, raw));
        stats.parallax_deg = parallax;
        let nb_tracks = frame.keypoints.len();

        if self.gate.check_ready_for_init(parallax.unwrap_or(0.0), nb_tracks) && self.bootstrap(&mut frame, timestamp)? {
            self.state = TrackingState::Tracking;
            stats.nb_tracked = frame.keypoints.len();
            self.create_keyframe(&mut frame);
            self.commit(frame);
            return Ok(self.result(true, events, stats));
        }

        self.predictor.update(&frame.twc, timestamp)?;
        let keyframe_requested = nb_tracks < self.params.init_track_floor;
        if keyframe_requested {
            warn!(
                "{nb_tracks} tracks left to bootstrap from, restarting from frame {}",
                frame.id
            );
            events.push(TrackingEvent::InsufficientTracks {
                tracked: nb_tracks,
                floor: self.params.init_track_floor,
            });
            self.create_keyframe(&mut frame);
        }

        self.commit(frame);
        Ok(self.result(keyframe_requested, events, stats))
    }

    /// Recovers the motion from the reference keyframe to `frame` and triangulates
    /// the first landmarks. The translation between both views has unit length.
    fn bootstrap(&mut self, frame: &mut Frame, timestamp: f64) -> Result<bool> {
        let Some(keyframe) = self.keyframe.clone() else {
            return Ok(false);
        };
        let seed = self.params.ransac_seed;
        let floor = self.params.init_track_floor;

        let (indices, matches): (Vec<usize>, Vec<PixelMatch>) = frame
            .keypoints
            .iter()
            .enumerate()
            .filter_map(|(i, kp)| Some((i, PixelMatch::new(keyframe.frame.keypoint(kp.lmid)?.px, kp.px))))
            .unzip();

        let Some(keep) = self.epipolar.filter_estimated(&matches, seed) else {
            debug!("bootstrap: no fundamental matrix fits {} matches", matches.len());
            return Ok(false);
        };
        let rejected: HashSet<LandmarkId> = indices
            .iter()
            .zip(&keep)
            .filter(|&(_, &k)| !k)
            .map(|(&i, _)| frame.keypoints[i].lmid)
            .collect();
        let (indices, matches): (Vec<usize>, Vec<PixelMatch>) = indices
            .into_iter()
            .zip(matches)
            .zip(&keep)
            .filter(|&(_, &k)| k)
            .map(|(pair, _)| pair)
            .unzip();
        if matches.len() < floor {
            debug!("bootstrap: {} epipolar inliers", matches.len());
            return Ok(false);
        }

        let Some(relative) = recover_relative_pose(&self.camera, &matches, self.epipolar.threshold(), seed) else {
            debug!("bootstrap: no relative pose");
            return Ok(false);
        };
        let triangulated: Vec<(usize, Point3<f64>)> = relative
            .inliers
            .iter()
            .zip(&relative.points)
            .filter_map(|(&j, point)| Some((indices[j], Point3::from((*point)?))))
            .collect();
        if triangulated.len() < floor {
            debug!("bootstrap: {} points in front of both cameras", triangulated.len());
            return Ok(false);
        }

        let kf_twc = *keyframe.twc();
        frame.twc = kf_twc * relative.t12;
        for &(i, local) in &triangulated {
            self.map.insert_landmark(frame.keypoints[i].lmid, kf_twc * local);
            frame.keypoints[i].is_3d = true;
        }
        frame.keypoints.retain(|kp| !rejected.contains(&kp.lmid));

        let mut reference = keyframe;
        for kp in reference.frame.keypoints.iter_mut() {
            kp.is_3d = self.map.landmark(kp.lmid).is_some();
        }
        self.map.insert_keyframe(reference.clone());
        self.keyframe = Some(reference);

        // the velocity measured so far has no scale
        self.predictor.restart(&frame.twc, timestamp);

        info!(
            "monocular initialization between keyframe {} and frame {}: {} landmarks",
            frame.kfid,
            frame.id,
            triangulated.len()
        );
        Ok(true)
    }

    fn track_against_map(
        &mut self,
        mut frame: Frame,
        timestamp: f64,
        mut events: Vec<TrackingEvent>,
        mut stats: TrackingStats,
    ) -> Result<TrackResult> {
        let mut fallback_done = false;
        if self.gate.is_below_floor(frame.keypoints.len()) {
            events.push(self.klt_fallback(&mut frame));
            fallback_done = true;
        }

        let solved = loop {
            self.match_stereo(&mut frame);
            let (indices, correspondences) = self.correspondences(&frame);
            stats.nb_pose_candidates = correspondences.len();

            match self.pose_solver.solve(&self.camera, &frame.twc, &correspondences) {
                Some(estimate) => break Some((indices, estimate)),
                None if !fallback_done => {
                    events.push(self.klt_fallback(&mut frame));
                    fallback_done = true;
                }
                None => break None,
            }
        };

        let Some((indices, estimate)) = solved else {
            warn!(
                "tracking lost at frame {} with {} pose candidates",
                frame.id, stats.nb_pose_candidates
            );
            self.state = TrackingState::Lost;
            self.pyramids.discard_current();
            events.push(TrackingEvent::TrackingLost);
            return Ok(self.result(false, events, stats));
        };

        let outliers: HashSet<usize> = indices
            .iter()
            .zip(&estimate.inliers)
            .filter(|&(_, &inlier)| !inlier)
            .map(|(&i, _)| i)
            .collect();
        frame.keypoints = std::mem::take(&mut frame.keypoints)
            .into_iter()
            .enumerate()
            .filter(|(i, _)| !outliers.contains(i))
            .map(|(_, kp)| kp)
            .collect();
        frame.twc = estimate.twc;
        stats.nb_inliers = estimate.nb_inliers;
        stats.nb_tracked = frame.keypoints.len();
        self.predictor.update(&frame.twc, timestamp)?;

        let reference = self.keyframe.as_ref();
        let parallax =
            reference.and_then(|keyframe| compute_parallax(&self.camera, &keyframe.frame, &frame, ParallaxQuery::default()));
        let input = GateInput {
            parallax_deg: parallax.unwrap_or(0.0),
            nb_tracks: frame.keypoints.len(),
            nb_3d: frame.nb_3d(),
            ref_nb_3d: reference.map_or(0, |keyframe| keyframe.frame.nb_3d()),
        };
        stats.parallax_deg = parallax;

        if self.gate.is_below_floor(input.nb_tracks) {
            events.push(TrackingEvent::InsufficientTracks {
                tracked: input.nb_tracks,
                floor: self.gate.track_floor,
            });
        }

        let keyframe_requested = self.gate.check_new_kf_req(&input);
        if keyframe_requested {
            self.create_keyframe(&mut frame);
        }

        debug!(
            "frame {}: {} tracks, {} / {} inliers, parallax {:.2}",
            frame.id, input.nb_tracks, stats.nb_inliers, stats.nb_pose_candidates, input.parallax_deg
        );
        self.commit(frame);
        Ok(self.result(keyframe_requested, events, stats))
    }

    /// Tracks the reference keyframe's keypoints that the previous frame lost
    /// straight into the current image
    fn klt_fallback(&self, frame: &mut Frame) -> TrackingEvent {
        let frame_to_frame = frame.keypoints.len();

        let recovered = match (&self.keyframe, self.pyramids.last_keyframe(), self.pyramids.current()) {
            (Some(keyframe), Some(reference), Some(current)) => {
                let known: HashSet<LandmarkId> = frame.keypoints.iter().map(|kp| kp.lmid).collect();
                let candidates: Vec<Keypoint> = keyframe
                    .frame
                    .keypoints
                    .iter()
                    .filter(|kp| !known.contains(&kp.lmid))
                    .cloned()
                    .collect();

                let tracked = self.track_keypoints(reference, current, &candidates, keyframe.twc(), &frame.twc);
                let (tracked, _) = self.epipolar_prune(tracked, &keyframe.frame, &frame.twc);
                let recovered = tracked.len();
                frame.keypoints.extend(tracked);
                recovered
            }
            _ => 0,
        };

        warn!(
            "frame-to-frame tracking kept {frame_to_frame} keypoints, {recovered} recovered from keyframe {}",
            frame.kfid
        );
        TrackingEvent::KltFallback {
            frame_to_frame,
            recovered,
        }
    }

    /// KLT from `src` to `dst`. Landmarks are predicted by projection into the
    /// predicted pose, 2-D keypoints by the homography of the relative rotation.
    fn track_keypoints(
        &self,
        src: &ImagePyramid,
        dst: &ImagePyramid,
        keypoints: &[Keypoint],
        src_twc: &Isometry3<f64>,
        dst_twc: &Isometry3<f64>,
    ) -> Vec<Keypoint> {
        if keypoints.is_empty() {
            return Vec::new();
        }

        let rotation = (dst_twc.inverse() * src_twc).rotation.to_rotation_matrix();
        let homography: Matrix3<f64> = self.camera.intrinsic() * rotation.matrix() * self.camera.intrinsic_inverse();

        let landmarks: Vec<Option<Point3<f64>>> = keypoints.iter().map(|kp| self.map.landmark(kp.lmid)).collect();
        let priors: Vec<Point2<f64>> = keypoints
            .iter()
            .zip(&landmarks)
            .map(|(kp, landmark)| {
                landmark
                    .as_ref()
                    .and_then(|world| self.camera.project_world(dst_twc, world))
                    .or_else(|| Point2::from_homogeneous(homography * kp.px.to_homogeneous()))
                    .unwrap_or(kp.px)
            })
            .collect();
        let src_points: Vec<Point2<f64>> = keypoints.iter().map(|kp| kp.px).collect();

        self.klt
            .track(src, dst, &src_points, &priors)
            .into_iter()
            .zip(keypoints.iter().zip(&landmarks))
            .filter_map(|(px, (kp, landmark))| {
                Some(Keypoint {
                    lmid: kp.lmid,
                    px: px?,
                    right_px: None,
                    is_3d: landmark.is_some(),
                })
            })
            .collect()
    }

    /// Drops keypoints inconsistent with the motion from `reference` to `cur_twc`,
    /// returns the survivors and the number rejected
    fn epipolar_prune(
        &self,
        keypoints: Vec<Keypoint>,
        reference: &Frame,
        cur_twc: &Isometry3<f64>,
    ) -> (Vec<Keypoint>, usize) {
        let sources: HashMap<LandmarkId, Point2<f64>> =
            reference.keypoints.iter().map(|kp| (kp.lmid, kp.px)).collect();
        let matches: Vec<PixelMatch> = keypoints
            .iter()
            .map(|kp| PixelMatch::new(sources.get(&kp.lmid).copied().unwrap_or(kp.px), kp.px))
            .collect();

        let keep = self.epipolar.filter(&self.camera, &reference.twc, cur_twc, &matches);
        let before = keypoints.len();
        let kept: Vec<Keypoint> = keypoints
            .into_iter()
            .zip(keep)
            .filter_map(|(kp, keep)| keep.then_some(kp))
            .collect();
        let nb_rejected = before - kept.len();
        (kept, nb_rejected)
    }

    /// 2D-3D correspondences of the frame, with the keypoint index of each
    fn correspondences(&self, frame: &Frame) -> (Vec<usize>, Vec<Correspondence>) {
        frame
            .keypoints
            .iter()
            .enumerate()
            .filter(|(_, kp)| kp.is_3d)
            .filter_map(|(i, kp)| {
                let landmark = self.map.landmark(kp.lmid)?;
                Some((i, Correspondence::new(kp.px, landmark).with_right(kp.right_px)))
            })
            .unzip()
    }

    /// Finds the right image position of every keypoint still missing one
    fn match_stereo(&self, frame: &mut Frame) {
        let (Some(left), Some(right)) = (self.pyramids.current(), self.pyramids.current_right()) else {
            return;
        };

        let pending: Vec<usize> = (0..frame.keypoints.len())
            .filter(|&i| frame.keypoints[i].right_px.is_none())
            .collect();
        if pending.is_empty() {
            return;
        }

        let points: Vec<Point2<f64>> = pending.iter().map(|&i| frame.keypoints[i].px).collect();
        for (i, right_px) in pending.into_iter().zip(self.klt.track_stereo(left, right, &points)) {
            frame.keypoints[i].right_px = right_px;
        }
    }

    fn triangulate_stereo_keypoints(&self, frame: &mut Frame) -> usize {
        let twc = frame.twc;
        let mut nb_triangulated = 0;

        for kp in frame.keypoints.iter_mut().filter(|kp| !kp.is_3d) {
            let Some(right_px) = kp.right_px else {
                continue;
            };
            let Some(local) = triangulate_stereo(&self.camera, &kp.px, &right_px) else {
                continue;
            };
            self.map.insert_landmark(kp.lmid, twc * local);
            kp.is_3d = true;
            nb_triangulated += 1;
        }

        nb_triangulated
    }

    /// Triangulates the 2-D keypoints `frame` shares with `keyframe`
    fn triangulate_from_keyframe(&self, keyframe: &Keyframe, frame: &mut Frame) -> usize {
        let pairs: Vec<(usize, Point2<f64>, Point2<f64>)> = frame
            .keypoints
            .iter()
            .enumerate()
            .filter(|(_, kp)| !kp.is_3d)
            .filter_map(|(i, kp)| Some((i, keyframe.frame.keypoint(kp.lmid)?.px, kp.px)))
            .collect();
        if pairs.is_empty() {
            return 0;
        }

        let x1: Vec<Point2<f64>> = pairs.iter().map(|(_, x1, _)| *x1).collect();
        let x2: Vec<Point2<f64>> = pairs.iter().map(|(_, _, x2)| *x2).collect();
        let points = triangulate_linear(
            &projection_matrix(&self.camera, &keyframe.frame.tcw()),
            &projection_matrix(&self.camera, &frame.tcw()),
            &x1,
            &x2,
        );

        let kf_center = keyframe.twc().translation.vector;
        let center = frame.twc.translation.vector;
        let mut nb_triangulated = 0;

        for ((i, px1, px2), point) in pairs.into_iter().zip(points) {
            let Some(point) = point else {
                continue;
            };
            let world = Point3::from(point);

            let reprojects = [(keyframe.twc(), px1), (&frame.twc, px2)].iter().all(|(twc, px)| {
                self.camera
                    .project_world(twc, &world)
                    .map_or(false, |projected| (projected - *px).norm() <= self.params.pose_max_reproj_err_px)
            });
            let angle = (point - kf_center).angle(&(point - center)).to_degrees();

            if reprojects && angle >= MIN_TRIANGULATION_ANGLE_DEG {
                self.map.insert_landmark(frame.keypoints[i].lmid, world);
                frame.keypoints[i].is_3d = true;
                nb_triangulated += 1;
            }
        }

        nb_triangulated
    }

    /// Landmarks of an existing map visible from `twc`, as tracked keypoints
    fn adopt_map_landmarks(&self, twc: &Isometry3<f64>) -> Vec<Keypoint> {
        let border = self.params.klt_window as f64;
        let width = self.camera.width as f64 - border;
        let height = self.camera.height as f64 - border;

        let mut adopted: Vec<Keypoint> = self
            .map
            .landmarks()
            .into_iter()
            .filter_map(|(lmid, position)| {
                let px = self.camera.project_world(twc, &position)?;
                let inside = px.x >= border && px.y >= border && px.x < width && px.y < height;
                inside.then_some(Keypoint {
                    lmid,
                    px,
                    right_px: None,
                    is_3d: true,
                })
            })
            .collect();
        adopted.sort_by_key(|kp| kp.lmid);
        adopted
    }

    /// Promotes `frame` to keyframe: triangulates what it can, detects new
    /// keypoints in the empty cells and raises the keyframe request
    fn create_keyframe(&mut self, frame: &mut Frame) {
        let mut nb_triangulated = match (&self.keyframe, self.params.stereo, self.state) {
            (Some(keyframe), false, TrackingState::Tracking) => self.triangulate_from_keyframe(keyframe, frame),
            _ => 0,
        };

        if let Some(base) = self.pyramids.current().and_then(|pyramid| pyramid.levels.first()) {
            let occupied: Vec<Point2<f64>> = frame.keypoints.iter().map(|kp| kp.px).collect();
            let detected = self.detector.detect(&base.image, &occupied);
            frame
                .keypoints
                .extend(detected.into_iter().map(|px| Keypoint::new(self.map.next_landmark_id(), px)));
        }

        if self.params.stereo {
            self.match_stereo(frame);
            nb_triangulated += self.triangulate_stereo_keypoints(frame);
        }

        let id = self.next_keyframe_id;
        self.next_keyframe_id += 1;
        frame.kfid = id;

        let keyframe = Keyframe {
            id,
            frame: frame.clone(),
        };
        self.map.insert_keyframe(keyframe.clone());
        self.keyframe = Some(keyframe);
        self.pyramids.commit_keyframe();
        self.request.raise();

        info!(
            "keyframe {id} from frame {}: {} keypoints, {} with landmarks, {nb_triangulated} new",
            frame.id,
            frame.keypoints.len(),
            frame.nb_3d()
        );
    }

    /// Picks up keyframe poses the back end may have moved
    fn refresh_keyframe(&mut self) {
        if let Some(stored) = self.keyframe.as_ref().and_then(|keyframe| self.map.keyframe(keyframe.id)) {
            self.keyframe = Some(stored);
        }
    }
}
