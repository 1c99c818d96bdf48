use image::GrayImage;
use imageproc::corners::{corners_fast9, Corner};
use nalgebra::Point2;

use crate::config::SlamParams;

/// Finds new keypoints to track, away from the ones already tracked
pub trait KeypointDetector: Send + Sync {
    fn detect(&self, image: &GrayImage, occupied: &[Point2<f64>]) -> Vec<Point2<f64>>;
}

/// Uses FAST (Features from Accelerated Segment Test) corners, keeping the
/// strongest corner of every free grid cell so keypoints spread over the image
#[derive(Clone, Debug)]
pub struct FastDetector {
    pub threshold: u8,
    pub cell_size: u32,
    pub max_keypoints: usize,
    /// Corners this close to the border cannot be tracked with a full window
    pub border: u32,
}

impl From<&SlamParams> for FastDetector {
    fn from(params: &SlamParams) -> Self {
        Self {
            threshold: params.fast_threshold,
            cell_size: params.cell_size.max(1),
            max_keypoints: params.max_keypoints,
            border: params.klt_window as u32 + 1,
        }
    }
}

impl KeypointDetector for FastDetector {
    fn detect(&self, image: &GrayImage, occupied: &[Point2<f64>]) -> Vec<Point2<f64>> {
        let (width, height) = image.dimensions();
        let cols = ((width + self.cell_size - 1) / self.cell_size) as usize;
        let rows = ((height + self.cell_size - 1) / self.cell_size) as usize;
        let cell_of = |x: f64, y: f64| {
            let col = (x.max(0.0) as u32 / self.cell_size) as usize;
            let row = (y.max(0.0) as u32 / self.cell_size) as usize;
            (col < cols && row < rows).then_some(row * cols + col)
        };

        let mut taken = vec![false; cols * rows];
        for px in occupied {
            if let Some(cell) = cell_of(px.x, px.y) {
                taken[cell] = true;
            }
        }
        let budget = self.max_keypoints.saturating_sub(occupied.len());

        let mut best: Vec<Option<Corner>> = vec![None; cols * rows];
        for corner in corners_fast9(image, self.threshold) {
            if corner.x < self.border
                || corner.y < self.border
                || corner.x + self.border >= width
                || corner.y + self.border >= height
            {
                continue;
            }

            let Some(cell) = cell_of(corner.x as f64, corner.y as f64) else {
                continue;
            };
            if taken[cell] {
                continue;
            }
            if best[cell].map_or(true, |current| corner.score > current.score) {
                best[cell] = Some(corner);
            }
        }

        let mut corners: Vec<Corner> = best.into_iter().flatten().collect();
        corners.sort_by(|a, b| b.score.total_cmp(&a.score));
        corners.truncate(budget);

        corners
            .into_iter()
            .map(|Corner { x, y, .. }| Point2::new(x as f64, y as f64))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Luma};

    /// Bright squares on a dark background, one every 40 pixels
    fn checker() -> GrayImage {
        ImageBuffer::from_fn(200, 160, |x, y| {
            let inside = (x % 40) >= 15 && (x % 40) < 25 && (y % 40) >= 15 && (y % 40) < 25;
            Luma([if inside { 220 } else { 30 }])
        })
    }

    fn detector() -> FastDetector {
        FastDetector {
            threshold: 20,
            cell_size: 40,
            max_keypoints: 100,
            border: 10,
        }
    }

    #[test]
    fn test_one_keypoint_per_cell() {
        let keypoints = detector().detect(&checker(), &[]);
        assert!(!keypoints.is_empty());

        let mut cells: Vec<_> = keypoints
            .iter()
            .map(|p| (p.x as u32 / 40, p.y as u32 / 40))
            .collect();
        let count = cells.len();
        cells.sort();
        cells.dedup();
        assert_eq!(cells.len(), count);
    }

    #[test]
    fn test_occupied_cells_are_skipped() {
        let all = detector().detect(&checker(), &[]);
        let occupied = [Point2::new(20.0, 20.0), Point2::new(60.0, 60.0)];
        let fresh = detector().detect(&checker(), &occupied);

        assert!(fresh.len() < all.len());
        assert!(fresh
            .iter()
            .all(|p| !(p.x < 40.0 && p.y < 40.0) && !((40.0..80.0).contains(&p.x) && (40.0..80.0).contains(&p.y))));
    }

    #[test]
    fn test_budget() {
        let limited = FastDetector {
            max_keypoints: 3,
            ..detector()
        };
        assert_eq!(limited.detect(&checker(), &[]).len(), 3);
        assert!(limited.detect(&checker(), &[Point2::new(1.0, 1.0); 3]).is_empty());
    }
}
