use std::{ops::Deref, path::Path, sync::Arc};

use image::{imageops::grayscale_with_type, GrayImage, ImageBuffer, Luma, Rgba};
use log::{info, warn};

use super::{
    features::{FastDetector, KeypointDetector},
    keyframe_gate::KeyframeRequest,
    klt::{FeatureTracker, LkConfig, PyramidalLk},
    map::SharedMap,
    tracker::{TrackResult, VisualFrontEnd},
};
use crate::{config::SlamParams, error::Result, sensors::EncoderReading};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InputSensor {
    Monocular = 1,
    Stereo = 2,
}

pub struct System {
    pub sensor: InputSensor,
    /// Map structure shared with the back end, holding keyframes and landmarks
    pub map: Arc<SharedMap>,
    /// Tracker. It receives a frame and computes the associated camera pose.
    /// It also decides when to insert a new keyframe and creates the first map points.
    pub tracker: VisualFrontEnd,
}

impl System {
    /// Builds the system with pyramidal Lucas-Kanade tracking and FAST keypoints
    pub fn new(params: SlamParams) -> Result<Self> {
        let tracker = Arc::new(PyramidalLk::new(LkConfig::from(&params)));
        let detector = Arc::new(FastDetector::from(&params));
        Self::with_components(params, tracker, detector)
    }

    /// Builds the system around a custom tracking primitive and detector
    pub fn with_components(
        params: SlamParams,
        tracker: Arc<dyn FeatureTracker>,
        detector: Arc<dyn KeypointDetector>,
    ) -> Result<Self> {
        let sensor = if params.stereo {
            InputSensor::Stereo
        } else {
            InputSensor::Monocular
        };
        let map = Arc::new(SharedMap::new());
        let tracker = VisualFrontEnd::new(params, map.clone(), tracker, detector)?;
        info!("visual front end ready ({sensor:?})");

        Ok(Self { sensor, map, tracker })
    }

    pub fn from_config_file(path: &Path) -> Result<Self> {
        Self::new(SlamParams::load(path)?)
    }

    pub fn track_monocular<C>(
        &mut self,
        image_buffer: &ImageBuffer<Rgba<u8>, C>,
        timestamp: f64,
        encoder: Option<EncoderReading>,
    ) -> Result<TrackResult>
    where
        C: Deref<Target = [u8]>,
    {
        let gray = to_gray(image_buffer);
        let result = self.tracker.track(&gray, None, timestamp, encoder)?;
        Self::report(&result, timestamp);
        Ok(result)
    }

    pub fn track_stereo<C>(
        &mut self,
        left: &ImageBuffer<Rgba<u8>, C>,
        right: &ImageBuffer<Rgba<u8>, C>,
        timestamp: f64,
        encoder: Option<EncoderReading>,
    ) -> Result<TrackResult>
    where
        C: Deref<Target = [u8]>,
    {
        let (left, right) = (to_gray(left), to_gray(right));
        let result = self.tracker.track(&left, Some(&right), timestamp, encoder)?;
        Self::report(&result, timestamp);
        Ok(result)
    }

    /// Handle the back end polls for new keyframes
    pub fn keyframe_request(&self) -> KeyframeRequest {
        self.tracker.keyframe_request()
    }

    /// Starts a new session, dropping the map built so far
    pub fn reset(&mut self) {
        self.tracker.reset();
        self.map.clear();
    }

    // Run any important cleanup procedures then SLAM instance is no longer in use
    pub fn shutdown(self) {
        info!(
            "shutting down with {} keyframes and {} landmarks",
            self.map.nb_keyframes(),
            self.map.nb_landmarks()
        );
    }

    fn report(result: &TrackResult, timestamp: f64) {
        if result.lost {
            warn!("t = {timestamp:.6}: tracking lost, waiting for reset");
        }
    }
}

fn to_gray<C>(image_buffer: &ImageBuffer<Rgba<u8>, C>) -> GrayImage
where
    C: Deref<Target = [u8]>,
{
    grayscale_with_type::<Luma<u8>, _>(image_buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbaImage;

    #[test]
    fn test_sensor_follows_params() {
        let system = System::new(SlamParams::default()).unwrap();
        assert_eq!(system.sensor, InputSensor::Monocular);

        let stereo = SlamParams {
            stereo: true,
            ..SlamParams::default()
        };
        // stereo without a baseline does not validate
        assert!(System::new(stereo).is_err());
    }

    #[test]
    fn test_monocular_session() {
        let params = SlamParams::default();
        let mut system = System::new(params.clone()).unwrap();
        let image = RgbaImage::new(params.camera.width, params.camera.height);

        let result = system.track_monocular(&image, 0.0, None).unwrap();
        assert!(result.keyframe_requested);
        assert!(system.keyframe_request().take());
        assert_eq!(system.map.nb_keyframes(), 1);

        system.reset();
        assert_eq!(system.map.nb_keyframes(), 0);
        system.shutdown();
    }
}
