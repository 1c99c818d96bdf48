//! Collection of general geometry algorithms which may be useful
//! to any kind of odometry or pose tracking implementations

pub mod camera;
pub mod lie;
pub mod triangulation;
pub mod two_view;
