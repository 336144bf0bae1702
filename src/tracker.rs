use std::sync::Arc;

use anyhow::{bail, ensure, Result};
use rand::Rng;
use tracing::debug;

use crate::bbox::BoundingBox;
use crate::config::{Config, PointDistribution};
use crate::frame::PyramidFrame;
use crate::math::{compute_ncc, median};
use crate::my_types::*;
use crate::optical_flow::OpticalFlow;

/// Boxes with a side of at most this many pixels are considered lost.
const MIN_BBOX_SIDE: f64 = 5.;

/// Point pair that survived the optical flow in both directions.
struct Correspondence {
    previous: Vector2d,
    current: Vector2d,
    fb_error: f64,
}

/// Short-term tracker moving a box with the median motion of the points inside it.
pub struct MedianFlowTracker {
    config: Config,
    optical_flow: OpticalFlow,
    previous_frame: Arc<PyramidFrame>,
    previous_points: Vec<Vector2d>,
    previous_bbox: Option<BoundingBox>,
}

impl MedianFlowTracker {
    pub fn new(
        frame: Arc<PyramidFrame>,
        bbox: &BoundingBox,
        config: &Config,
        rng: &mut TldRng,
    ) -> MedianFlowTracker {
        let mut tracker = MedianFlowTracker {
            config: config.clone(),
            optical_flow: OpticalFlow::new(config),
            previous_frame: frame.clone(),
            previous_points: vec![],
            previous_bbox: None,
        };
        tracker.reinitialize(frame, Some(*bbox), rng);
        tracker
    }

    /// Restart from `bbox` on `frame`, or become lost when `bbox` is `None`.
    pub fn reinitialize(
        &mut self,
        frame: Arc<PyramidFrame>,
        bbox: Option<BoundingBox>,
        rng: &mut TldRng,
    ) {
        let bbox = bbox.filter(|b| !b.is_empty());
        self.previous_frame = frame;
        self.previous_points = match &bbox {
            Some(bbox) => generate_points(bbox, &self.config, rng),
            None => vec![],
        };
        self.previous_bbox = bbox;
    }

    pub fn is_tracking(&self) -> bool {
        self.previous_bbox.is_some()
    }

    pub fn previous_bbox(&self) -> Option<&BoundingBox> {
        self.previous_bbox.as_ref()
    }

    pub fn previous_points(&self) -> &[Vector2d] {
        &self.previous_points
    }

    /// Follow the box into `new_frame`. On failure the tracker becomes lost
    /// until it is reinitialized.
    pub fn track(&mut self, new_frame: Arc<PyramidFrame>, rng: &mut TldRng) -> Option<BoundingBox> {
        let bbox = match self.estimate(&new_frame) {
            Ok(bbox) => Some(bbox),
            Err(err) => {
                debug!("tracking failed: {}", err);
                None
            }
        };
        self.reinitialize(new_frame, bbox, rng);
        bbox
    }

    fn estimate(&mut self, new_frame: &PyramidFrame) -> Result<BoundingBox> {
        let bbox = match self.previous_bbox {
            Some(bbox) if !self.previous_points.is_empty() => bbox,
            _ => bail!("no object to track"),
        };

        let mut correspondences = self.flow_correspondences(new_frame);
        ensure!(
            !correspondences.is_empty(),
            "optical flow lost all {} points",
            self.previous_points.len()
        );
        self.check_fb(&mut correspondences)?;
        self.check_ncc(new_frame, &mut correspondences)?;
        ensure!(!correspondences.is_empty(), "no point passed the consistency checks");

        let dx: Vec<f64> = correspondences
            .iter()
            .map(|c| c.current[0] - c.previous[0])
            .collect();
        let dy: Vec<f64> = correspondences
            .iter()
            .map(|c| c.current[1] - c.previous[1])
            .collect();
        let median_dx = median(&dx);
        let median_dy = median(&dy);

        let dm = median_dx.hypot(median_dy);
        let residuals: Vec<f64> = dx
            .iter()
            .zip(dy.iter())
            .map(|(x, y)| (x.hypot(*y) - dm).abs())
            .collect();
        let median_residual = median(&residuals);
        ensure!(
            median_residual <= self.config.max_median_displacement,
            "median displacement residual {:.2} exceeds {}",
            median_residual,
            self.config.max_median_displacement
        );

        let scale = estimate_scale(&correspondences);
        let new_bbox = bbox.translate(median_dx, median_dy).scale(scale);
        let image = &new_frame.image;
        ensure!(
            new_bbox.is_within(image.width, image.height),
            "box {:?} left the {} x {} frame",
            new_bbox,
            image.width,
            image.height
        );
        ensure!(
            new_bbox.width > MIN_BBOX_SIDE && new_bbox.height > MIN_BBOX_SIDE,
            "box {:?} became too small",
            new_bbox
        );
        debug!(
            "tracked {} points, motion ({:.2}, {:.2}), scale {:.3}",
            correspondences.len(),
            median_dx,
            median_dy,
            scale
        );
        Ok(new_bbox)
    }

    /// Forward flow, then backward flow of every point that made it.
    fn flow_correspondences(&mut self, new_frame: &PyramidFrame) -> Vec<Correspondence> {
        let forward = self
            .optical_flow
            .process(&self.previous_frame, new_frame, &self.previous_points);
        let (previous, current): (Vec<Vector2d>, Vec<Vector2d>) = self
            .previous_points
            .iter()
            .zip(forward)
            .filter_map(|(p0, p1)| p1.map(|p1| (*p0, p1)))
            .unzip();
        let backward = self
            .optical_flow
            .process(new_frame, &self.previous_frame, &current);

        previous
            .into_iter()
            .zip(current)
            .zip(backward)
            .filter_map(|((previous, current), reprojected)| {
                reprojected.map(|reprojected| Correspondence {
                    previous,
                    current,
                    fb_error: (previous - reprojected).norm(),
                })
            })
            .collect()
    }

    /// Fail on a large median forward-backward error, otherwise keep the
    /// points at or below it.
    fn check_fb(&self, correspondences: &mut Vec<Correspondence>) -> Result<()> {
        let fb_errors: Vec<f64> = correspondences.iter().map(|c| c.fb_error).collect();
        let fb_median = median(&fb_errors);
        ensure!(
            fb_median <= self.config.fb_threshold,
            "median forward-backward error {:.2} exceeds {}",
            fb_median,
            self.config.fb_threshold
        );
        correspondences.retain(|c| c.fb_error <= fb_median);
        Ok(())
    }

    /// Keep the points whose surrounding patches correlate at least as well as the median.
    fn check_ncc(
        &self,
        new_frame: &PyramidFrame,
        correspondences: &mut Vec<Correspondence>,
    ) -> Result<()> {
        let size = self.config.ncc_patch_size;
        let nccs = correspondences
            .iter()
            .map(|c| {
                let patch0 = self.previous_frame.image.sample_patch(c.previous, size);
                let patch1 = new_frame.image.sample_patch(c.current, size);
                compute_ncc(&patch0, &patch1)
            })
            .collect::<Result<Vec<f64>>>()?;
        let ncc_median = median(&nccs);
        let mut keep = nccs.iter().map(|ncc| *ncc >= ncc_median);
        correspondences.retain(|_| keep.next().unwrap_or(false));
        Ok(())
    }
}

/// Median ratio of pairwise point distances after and before the motion.
fn estimate_scale(correspondences: &[Correspondence]) -> f64 {
    let mut ratios = vec![];
    for (i, a) in correspondences.iter().enumerate() {
        for b in &correspondences[i + 1..] {
            let before = (a.previous - b.previous).norm();
            let after = (a.current - b.current).norm();
            if before != 0. && after != 0. {
                ratios.push(after / before);
            }
        }
    }
    if ratios.is_empty() {
        1.
    } else {
        median(&ratios)
    }
}

/// Points to follow inside `bbox`, laid out on a grid or drawn uniformly.
fn generate_points(bbox: &BoundingBox, config: &Config, rng: &mut TldRng) -> Vec<Vector2d> {
    match config.point_distribution {
        PointDistribution::Random => (0..config.total_num_points)
            .map(|_| {
                Vector2d::new(
                    rng.gen_range(bbox.x..bbox.right()),
                    rng.gen_range(bbox.y..bbox.bottom()),
                )
            })
            .collect(),
        PointDistribution::Grid => {
            let n = config.len_points;
            let step_x = bbox.width / n as f64;
            let step_y = bbox.height / n as f64;
            (0..n)
                .flat_map(|i| {
                    (0..n).map(move |j| {
                        Vector2d::new(bbox.x + i as f64 * step_x, bbox.y + j as f64 * step_y)
                    })
                })
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::bilinear;
    use crate::synthetic::SyntheticScene;
    use rand::SeedableRng;

    fn pyramid_frame(scene: &SyntheticScene, index: usize, config: &Config) -> Arc<PyramidFrame> {
        Arc::new(PyramidFrame::new(scene.frame(index), config.max_pyr_level).unwrap())
    }

    #[test]
    fn test_generate_points() {
        let mut rng = TldRng::seed_from_u64(0);
        let bbox = BoundingBox::new(10., 20., 30., 40.);
        let config = Config {
            point_distribution: PointDistribution::Grid,
            ..Config::default()
        };
        let points = generate_points(&bbox, &config, &mut rng);
        assert_eq!(points.len(), config.len_points * config.len_points);
        assert_eq!(points[0], Vector2d::new(10., 20.));
        assert_eq!(points[1], Vector2d::new(10., 24.));
        assert_eq!(points[config.len_points], Vector2d::new(13., 20.));

        let config = Config::default();
        let points = generate_points(&bbox, &config, &mut rng);
        assert_eq!(points.len(), config.total_num_points);
        for p in points {
            assert!(p[0] >= 10. && p[0] < 40. && p[1] >= 20. && p[1] < 60.);
        }
    }

    #[test]
    fn test_estimate_scale() {
        let correspondence = |x: f64, y: f64, s: f64| Correspondence {
            previous: Vector2d::new(x, y),
            current: Vector2d::new(s * x + 3., s * y - 1.),
            fb_error: 0.,
        };
        let grown: Vec<_> = (0..6).map(|i| correspondence(i as f64, (i * i) as f64, 1.5)).collect();
        assert!((estimate_scale(&grown) - 1.5).abs() < 1e-12);
        assert_eq!(estimate_scale(&grown[..1]), 1.);
        // coincident points are skipped
        let same = vec![correspondence(1., 1., 2.), correspondence(1., 1., 2.)];
        assert_eq!(estimate_scale(&same), 1.);
    }

    #[test]
    fn test_identical_frames_keep_box() {
        let mut rng = TldRng::seed_from_u64(1);
        let config = Config::default();
        let scene = SyntheticScene::new(120, 90, 30, 5).unwrap();
        let bbox = scene.bbox(0);
        let mut tracker = MedianFlowTracker::new(pyramid_frame(&scene, 0, &config), &bbox, &config, &mut rng);
        let tracked = tracker.track(pyramid_frame(&scene, 0, &config), &mut rng).unwrap();
        assert!((tracked.x - bbox.x).abs() < 1e-9);
        assert!((tracked.y - bbox.y).abs() < 1e-9);
        assert!((tracked.width - bbox.width).abs() < 1e-9);
        assert!(tracker.is_tracking());
        assert_eq!(tracker.previous_points().len(), config.total_num_points);
    }

    #[test]
    fn test_follows_moving_object() {
        let mut rng = TldRng::seed_from_u64(2);
        let config = Config::default();
        let scene = SyntheticScene::new(120, 90, 30, 6).unwrap().with_motion((30, 20), (2, 1));
        let mut tracker = MedianFlowTracker::new(
            pyramid_frame(&scene, 0, &config),
            &scene.bbox(0),
            &config,
            &mut rng,
        );
        for index in 1..4 {
            let tracked = tracker
                .track(pyramid_frame(&scene, index, &config), &mut rng)
                .expect("object should be tracked");
            let truth = scene.bbox(index);
            assert!(tracked.iou(&truth) > 0.75, "frame {} iou {}", index, tracked.iou(&truth));
        }
    }

    #[test]
    fn test_lost_tracker_stays_lost() {
        let mut rng = TldRng::seed_from_u64(3);
        let config = Config::default();
        let scene = SyntheticScene::new(80, 60, 20, 7).unwrap();
        let mut tracker = MedianFlowTracker::new(pyramid_frame(&scene, 0, &config), &scene.bbox(0), &config, &mut rng);
        tracker.reinitialize(pyramid_frame(&scene, 0, &config), None, &mut rng);
        assert!(!tracker.is_tracking());
        assert!(tracker.previous_points().is_empty());
        assert_eq!(tracker.track(pyramid_frame(&scene, 1, &config), &mut rng), None);
        assert!(!tracker.is_tracking());

        tracker.reinitialize(pyramid_frame(&scene, 1, &config), Some(scene.bbox(1)), &mut rng);
        assert!(tracker.is_tracking());
    }

    #[test]
    fn test_box_leaving_frame_is_lost() {
        let mut rng = TldRng::seed_from_u64(4);
        let config = Config::default();
        let scene = SyntheticScene::new(100, 80, 30, 8).unwrap().with_motion((68, 20), (0, 0));
        let frame0 = scene.frame(0);
        // whole image content moves 6 px to the right
        let mut frame1 = frame0.clone();
        for y in 0..frame0.height {
            for x in 0..frame0.width {
                frame1.set_value(x, y, frame0.value(x.saturating_sub(6), y));
            }
        }
        let frame0 = Arc::new(PyramidFrame::new(frame0, config.max_pyr_level).unwrap());
        let frame1 = Arc::new(PyramidFrame::new(frame1, config.max_pyr_level).unwrap());
        let mut tracker = MedianFlowTracker::new(frame0, &scene.bbox(0), &config, &mut rng);
        assert_eq!(tracker.track(frame1, &mut rng), None);
        assert!(!tracker.is_tracking());
    }

    #[test]
    fn test_forward_backward_threshold() {
        let mut rng = TldRng::seed_from_u64(5);
        let config = Config {
            fb_threshold: 0.,
            ..Config::default()
        };
        let scene = SyntheticScene::new(120, 90, 30, 6).unwrap().with_motion((30, 20), (2, 1));
        let mut tracker = MedianFlowTracker::new(
            pyramid_frame(&scene, 0, &config),
            &scene.bbox(0),
            &config,
            &mut rng,
        );
        assert_eq!(tracker.track(pyramid_frame(&scene, 1, &config), &mut rng), None);
        assert!(!tracker.is_tracking());
        assert!(tracker.previous_points().is_empty());
    }

    #[test]
    fn test_ncc_check_keeps_best_correlated_points() {
        let mut rng = TldRng::seed_from_u64(6);
        let config = Config::default();
        let scene = SyntheticScene::new(120, 90, 30, 10).unwrap();
        let bbox = scene.bbox(0);
        let frame = pyramid_frame(&scene, 0, &config);
        let tracker = MedianFlowTracker::new(frame.clone(), &bbox, &config, &mut rng);

        let inside = |dx: f64, dy: f64| Vector2d::new(bbox.x + dx, bbox.y + dy);
        let matched = |p: Vector2d| Correspondence {
            previous: p,
            current: p,
            fb_error: 0.,
        };
        let mismatched = |p: Vector2d| Correspondence {
            previous: p,
            current: p + Vector2d::new(11., -7.),
            fb_error: 0.,
        };
        let mut correspondences = vec![
            matched(inside(10., 10.)),
            mismatched(inside(12., 15.)),
            matched(inside(20., 18.)),
            mismatched(inside(8., 22.)),
        ];
        tracker.check_ncc(&frame, &mut correspondences).unwrap();
        assert_eq!(correspondences.len(), 2);
        assert!(correspondences.iter().all(|c| c.current == c.previous));
    }

    #[test]
    fn test_median_displacement_threshold() {
        let scene = SyntheticScene::new(120, 90, 30, 9).unwrap();
        let bbox = scene.bbox(0);
        let frame0 = scene.frame(0);
        // zoom by 10 % about the object centre
        let centre = Vector2d::new(bbox.x + bbox.width / 2., bbox.y + bbox.height / 2.);
        let mut frame1 = frame0.clone();
        for y in 0..frame0.height {
            for x in 0..frame0.width {
                let p = centre + (Vector2d::new(x as f64, y as f64) - centre) / 1.1;
                frame1.set_value(x, y, bilinear(&frame0, p).round() as u8);
            }
        }

        let track = |config: &Config| {
            let mut rng = TldRng::seed_from_u64(7);
            let frame0 = Arc::new(PyramidFrame::new(frame0.clone(), config.max_pyr_level).unwrap());
            let frame1 = Arc::new(PyramidFrame::new(frame1.clone(), config.max_pyr_level).unwrap());
            let mut tracker = MedianFlowTracker::new(frame0, &bbox, config, &mut rng);
            let tracked = tracker.track(frame1, &mut rng);
            assert_eq!(tracker.is_tracking(), tracked.is_some());
            tracked
        };

        let grown = track(&Config::default()).expect("zoomed object should be tracked");
        assert!(grown.width > bbox.width);

        let strict = Config {
            max_median_displacement: 0.,
            ..Config::default()
        };
        assert_eq!(track(&strict), None);
    }
}
