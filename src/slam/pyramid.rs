//! Image pyramids shared by the KLT stage.
//!
//! The cache keeps three pyramids alive: the frame being tracked, the last
//! committed frame and the last keyframe. Pyramids are reference counted, so
//! promoting the current frame to keyframe does not copy pixels.

use std::sync::Arc;

use image::{imageops, GrayImage, ImageBuffer, Luma};
use imageproc::{contrast, filter::gaussian_blur_f32, gradients};
use log::debug;

use super::frame::FrameId;
use crate::config::{PreprocessMode, SlamParams};

/// Smoothing applied before every 2x decimation
const PYRAMID_SIGMA: f32 = 1.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

/// A single resolution of a pyramid with its Sobel gradients
pub struct PyramidLevel {
    pub image: GrayImage,
    grad_x: ImageBuffer<Luma<i16>, Vec<i16>>,
    grad_y: ImageBuffer<Luma<i16>, Vec<i16>>,
}

impl PyramidLevel {
    fn new(image: GrayImage) -> Self {
        Self {
            grad_x: gradients::horizontal_sobel(&image),
            grad_y: gradients::vertical_sobel(&image),
            image,
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Whether a square window of half size `half` around `(x, y)` can be sampled
    pub fn contains_window(&self, x: f64, y: f64, half: f64) -> bool {
        x - half >= 0.0
            && y - half >= 0.0
            && x + half + 1.0 < self.width() as f64
            && y + half + 1.0 < self.height() as f64
    }

    /// Bilinearly interpolated intensity; the caller keeps `(x, y)` inside the image
    pub fn intensity(&self, x: f64, y: f64) -> f64 {
        bilinear(x, y, |u, v| self.image.get_pixel(u, v).0[0] as f64)
    }

    /// Bilinearly interpolated image gradient, in intensity per pixel
    pub fn gradient(&self, x: f64, y: f64) -> (f64, f64) {
        // the Sobel kernels sum to 8x the central difference
        (
            bilinear(x, y, |u, v| self.grad_x.get_pixel(u, v).0[0] as f64) / 8.0,
            bilinear(x, y, |u, v| self.grad_y.get_pixel(u, v).0[0] as f64) / 8.0,
        )
    }
}

fn bilinear(x: f64, y: f64, sample: impl Fn(u32, u32) -> f64) -> f64 {
    let (x0, y0) = (x.floor(), y.floor());
    let (ax, ay) = (x - x0, y - y0);
    let (u, v) = (x0 as u32, y0 as u32);

    (1.0 - ay) * ((1.0 - ax) * sample(u, v) + ax * sample(u + 1, v))
        + ay * ((1.0 - ax) * sample(u, v + 1) + ax * sample(u + 1, v + 1))
}

/// Gaussian pyramid of one preprocessed image; level 0 is full resolution
pub struct ImagePyramid {
    pub frame_id: FrameId,
    pub side: Side,
    pub levels: Vec<PyramidLevel>,
}

impl ImagePyramid {
    /// Builds up to `nb_levels` levels, stopping before a level gets smaller than
    /// a tracking window of half size `window`
    pub fn build(frame_id: FrameId, side: Side, image: GrayImage, nb_levels: usize, window: usize) -> Self {
        let min_side = 2 * window as u32 + 2;
        let mut levels = vec![PyramidLevel::new(image)];

        while levels.len() < nb_levels.max(1) {
            let Some(finer) = levels.last() else { break };
            let (width, height) = (finer.width() / 2, finer.height() / 2);
            if width < min_side || height < min_side {
                break;
            }

            let blurred = gaussian_blur_f32(&finer.image, PYRAMID_SIGMA);
            let coarser = imageops::resize(&blurred, width, height, imageops::FilterType::Triangle);
            levels.push(PyramidLevel::new(coarser));
        }

        Self {
            frame_id,
            side,
            levels,
        }
    }

    pub fn nb_levels(&self) -> usize {
        self.levels.len()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.levels[0].image.dimensions()
    }
}

#[derive(Clone, Copy, Debug)]
struct Preprocessing {
    mode: PreprocessMode,
    clip_limit: f64,
    tiles: u32,
}

impl Preprocessing {
    fn apply(&self, image: &GrayImage) -> GrayImage {
        match self.mode {
            PreprocessMode::None => image.clone(),
            PreprocessMode::Clahe => clahe(image, self.clip_limit, self.tiles),
            PreprocessMode::HistogramStretch => histogram_stretch(image),
        }
    }
}

/// Stretches the 1st..99th intensity percentiles over the full range
fn histogram_stretch(image: &GrayImage) -> GrayImage {
    let lower = imageproc::stats::percentile(image, 1);
    let upper = imageproc::stats::percentile(image, 99);
    if upper <= lower {
        return image.clone();
    }

    contrast::stretch_contrast(image, lower, upper)
}

/// Contrast limited adaptive histogram equalization.
///
/// Each tile of a `tiles x tiles` grid gets its own clipped histogram; the
/// excess is spread uniformly and pixels are mapped by bilinear interpolation
/// between the four surrounding tile lookup tables.
fn clahe(image: &GrayImage, clip_limit: f64, tiles: u32) -> GrayImage {
    let (width, height) = image.dimensions();
    let tiles = tiles.clamp(1, width.min(height).max(1));
    let tile_w = (width as f64 / tiles as f64).max(1.0);
    let tile_h = (height as f64 / tiles as f64).max(1.0);

    let mut luts = vec![[0u8; 256]; (tiles * tiles) as usize];
    for ty in 0..tiles {
        for tx in 0..tiles {
            let x0 = (tx as f64 * tile_w) as u32;
            let y0 = (ty as f64 * tile_h) as u32;
            let x1 = (((tx + 1) as f64 * tile_w) as u32).min(width);
            let y1 = (((ty + 1) as f64 * tile_h) as u32).min(height);

            let mut histogram = [0u32; 256];
            for y in y0..y1 {
                for x in x0..x1 {
                    histogram[image.get_pixel(x, y).0[0] as usize] += 1;
                }
            }

            let nb_pixels = ((x1 - x0) * (y1 - y0)).max(1);
            let limit = ((clip_limit * nb_pixels as f64 / 256.0) as u32).max(1);
            let mut excess = 0;
            for bin in histogram.iter_mut() {
                if *bin > limit {
                    excess += *bin - limit;
                    *bin = limit;
                }
            }
            let (spread, remainder) = (excess / 256, (excess % 256) as usize);

            let lut = &mut luts[(ty * tiles + tx) as usize];
            let mut cumulative = 0u32;
            for (value, bin) in histogram.iter().enumerate() {
                cumulative += bin + spread + u32::from(value < remainder);
                lut[value] = ((cumulative as f64 * 255.0 / nb_pixels as f64).round()).min(255.0) as u8;
            }
        }
    }

    let last = (tiles - 1) as f64;
    ImageBuffer::from_fn(width, height, |x, y| {
        // position relative to tile centers
        let gx = ((x as f64 + 0.5) / tile_w - 0.5).clamp(0.0, last);
        let gy = ((y as f64 + 0.5) / tile_h - 0.5).clamp(0.0, last);
        let (tx0, ty0) = (gx.floor() as u32, gy.floor() as u32);
        let (tx1, ty1) = ((tx0 + 1).min(tiles - 1), (ty0 + 1).min(tiles - 1));
        let (ax, ay) = (gx - tx0 as f64, gy - ty0 as f64);

        let value = image.get_pixel(x, y).0[0] as usize;
        let lut = |tx: u32, ty: u32| luts[(ty * tiles + tx) as usize][value] as f64;

        let mapped = (1.0 - ay) * ((1.0 - ax) * lut(tx0, ty0) + ax * lut(tx1, ty0))
            + ay * ((1.0 - ax) * lut(tx0, ty1) + ax * lut(tx1, ty1));
        Luma([mapped.round().clamp(0.0, 255.0) as u8])
    })
}

/// Owns the current, previous and last keyframe pyramids
pub struct PyramidCache {
    nb_levels: usize,
    window: usize,
    preprocessing: Preprocessing,
    current: Option<Arc<ImagePyramid>>,
    current_right: Option<Arc<ImagePyramid>>,
    previous: Option<Arc<ImagePyramid>>,
    last_keyframe: Option<Arc<ImagePyramid>>,
}

impl PyramidCache {
    pub fn new(params: &SlamParams) -> Self {
        Self {
            nb_levels: params.klt_pyramid_levels,
            window: params.klt_window,
            preprocessing: Preprocessing {
                mode: params.preprocess_mode,
                clip_limit: params.clahe_clip_limit,
                tiles: params.clahe_tiles,
            },
            current: None,
            current_right: None,
            previous: None,
            last_keyframe: None,
        }
    }

    fn build(&self, frame_id: FrameId, side: Side, image: &GrayImage) -> Arc<ImagePyramid> {
        let processed = self.preprocessing.apply(image);
        let pyramid = ImagePyramid::build(frame_id, side, processed, self.nb_levels, self.window);
        debug!("built {:?} pyramid for frame {frame_id} with {} levels", side, pyramid.nb_levels());
        Arc::new(pyramid)
    }

    /// Preprocesses `image` and stores its pyramid as the current one
    pub fn ingest(&mut self, frame_id: FrameId, image: &GrayImage) -> Arc<ImagePyramid> {
        let pyramid = self.build(frame_id, Side::Left, image);
        self.current = Some(pyramid.clone());
        self.current_right = None;
        pyramid
    }

    /// Right image of the current stereo pair
    pub fn ingest_right(&mut self, frame_id: FrameId, image: &GrayImage) -> Arc<ImagePyramid> {
        let pyramid = self.build(frame_id, Side::Right, image);
        self.current_right = Some(pyramid.clone());
        pyramid
    }

    pub fn current(&self) -> Option<&Arc<ImagePyramid>> {
        self.current.as_ref()
    }

    pub fn current_right(&self) -> Option<&Arc<ImagePyramid>> {
        self.current_right.as_ref()
    }

    pub fn previous(&self) -> Option<&Arc<ImagePyramid>> {
        self.previous.as_ref()
    }

    pub fn last_keyframe(&self) -> Option<&Arc<ImagePyramid>> {
        self.last_keyframe.as_ref()
    }

    /// Current becomes previous
    pub fn commit_frame(&mut self) {
        if let Some(current) = self.current.take() {
            self.previous = Some(current);
        }
        self.current_right = None;
    }

    /// Current is retained as the keyframe reference; call before [`commit_frame`](Self::commit_frame)
    pub fn commit_keyframe(&mut self) {
        if let Some(current) = &self.current {
            self.last_keyframe = Some(current.clone());
        }
    }

    /// Drops the current pyramid without committing it
    pub fn discard_current(&mut self) {
        self.current = None;
        self.current_right = None;
    }

    pub fn reset(&mut self) {
        self.current = None;
        self.current_right = None;
        self.previous = None;
        self.last_keyframe = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(width: u32, height: u32) -> GrayImage {
        ImageBuffer::from_fn(width, height, |x, y| Luma([((x + 2 * y) % 256) as u8]))
    }

    #[test]
    fn test_level_count_respects_window() {
        let pyramid = ImagePyramid::build(0, Side::Left, ramp(160, 120), 6, 9);
        // 160x120 -> 80x60 -> 40x30, the next level would be narrower than a window
        assert_eq!(pyramid.nb_levels(), 3);
        assert_eq!(pyramid.levels[2].image.dimensions(), (40, 30));
    }

    #[test]
    fn test_interpolation() {
        let level = PyramidLevel::new(ramp(32, 32));
        assert_eq!(level.intensity(4.0, 3.0), 10.0);
        assert!((level.intensity(4.5, 3.0) - 10.5).abs() < 1e-9);

        let (gx, gy) = level.gradient(10.0, 10.0);
        assert!((gx - 1.0).abs() < 1e-9);
        assert!((gy - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_rotation_policy() {
        let mut cache = PyramidCache::new(&SlamParams::default());
        let image = ramp(64, 48);

        cache.ingest(0, &image);
        cache.commit_keyframe();
        cache.commit_frame();
        assert!(cache.current().is_none());
        assert_eq!(cache.previous().map(|p| p.frame_id), Some(0));
        assert_eq!(cache.last_keyframe().map(|p| p.frame_id), Some(0));

        cache.ingest(1, &image);
        cache.commit_frame();
        assert_eq!(cache.previous().map(|p| p.frame_id), Some(1));
        assert_eq!(cache.last_keyframe().map(|p| p.frame_id), Some(0));

        cache.reset();
        assert!(cache.previous().is_none());
        assert!(cache.last_keyframe().is_none());
    }

    #[test]
    fn test_histogram_stretch_spans_range() {
        let dim = ImageBuffer::from_fn(64, 64, |x, _| Luma([100 + (x % 20) as u8]));
        let stretched = histogram_stretch(&dim);
        let max = stretched.pixels().map(|p| p.0[0]).max().unwrap();
        let min = stretched.pixels().map(|p| p.0[0]).min().unwrap();
        assert_eq!((min, max), (0, 255));
    }

    #[test]
    fn test_clahe_expands_low_contrast() {
        let image = ImageBuffer::from_fn(64, 64, |x, y| Luma([100 + ((x + y) % 8) as u8]));
        let equalized = clahe(&image, 40.0, 4);

        assert_eq!(equalized.dimensions(), image.dimensions());
        let max = equalized.pixels().map(|p| p.0[0]).max().unwrap();
        let min = equalized.pixels().map(|p| p.0[0]).min().unwrap();
        assert!(max - min > 100);

        let flat = ImageBuffer::from_pixel(32, 32, Luma([128u8]));
        let flat_out = clahe(&flat, 3.0, 4);
        let first = flat_out.get_pixel(0, 0).0[0];
        assert!(flat_out.pixels().all(|p| p.0[0] == first));
    }
}
