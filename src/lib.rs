//! Visual front end of a keyframe-based SLAM system.
//!
//! Images come in one at a time (optionally with their stereo counterpart and a
//! wheel encoder reading) and go out as camera poses, keyframe requests and
//! freshly triangulated landmarks in a map shared with the back end.
//!
//! ```no_run
//! use slamr_frontend::{slam::system::System, SlamParams};
//!
//! # fn main() -> slamr_frontend::Result<()> {
//! let mut slam = System::new(SlamParams::load("config.yaml".as_ref())?)?;
//! let image = image::open("frame_0000.png").unwrap().to_rgba8();
//! let result = slam.track_monocular(&image, 0.0, None)?;
//! println!("{}", result.pose);
//! slam.shutdown();
//! # Ok(())
//! # }
//! ```

pub mod algorithms;
pub mod config;
pub mod error;
pub mod sensors;
pub mod slam;

pub use config::{CameraParams, PreprocessMode, SlamParams};
pub use error::{ConfigError, FrontendError, Result};
pub use sensors::{EncoderConfig, EncoderReading};
pub use slam::{
    keyframe_gate::{KeyframeRequest, TrackingState},
    system::{InputSensor, System},
    tracker::{TrackResult, TrackingEvent, VisualFrontEnd},
};
