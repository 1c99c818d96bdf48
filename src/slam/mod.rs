//! Tracking side of the SLAM pipeline: everything run once per image to turn
//! pixels into a camera pose and keyframe candidates.

pub mod epipolar;
pub mod features;
pub mod frame;
pub mod keyframe_gate;
pub mod klt;
pub mod map;
pub mod motion_model;
pub mod pose_solver;
pub mod pyramid;
pub mod system;
pub mod tracker;
