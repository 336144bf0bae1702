use std::sync::Arc;

use anyhow::{ensure, Context as AnyhowContext, Result};
use rand::SeedableRng;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::bbox::BoundingBox;
use crate::config::Config;
use crate::detector::{CascadeClassifier, WindowId};
use crate::frame::PyramidFrame;
use crate::image::Image;
use crate::math::IntegralImage;
use crate::my_types::TldRng;
use crate::object_model::ObjectModel;
use crate::tracker::MedianFlowTracker;

/// Outcome of one frame.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct FrameResult {
    pub tracked: Option<BoundingBox>,
    pub detected: Vec<BoundingBox>,
    pub fused: Option<BoundingBox>,
    /// Whether the fused box is trusted. The next frame learns only when it is.
    pub valid: bool,
}

/// Training signal for one scanning window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Expert {
    /// Overlaps the object but the ensemble missed it.
    Positive,
    /// Away from the object but the ensemble fired.
    Negative,
}

/// A tracked box stays valid above `theta_minus` but has to exceed
/// `theta_plus` to become valid.
fn is_confident(confidence: f64, was_valid: bool, config: &Config) -> bool {
    confidence > config.theta_plus || (was_valid && confidence > config.theta_minus)
}

/// Tracking-learning-detection: a median-flow tracker and a cascade detector
/// correcting each other, with the detector trained online from the fused result.
pub struct Tld {
    config: Config,
    rng: TldRng,
    frame_size: (usize, usize),
    tracker: MedianFlowTracker,
    detector: CascadeClassifier,
    is_valid_prev_bbox: bool,
}

impl Tld {
    pub fn new(frame: &Image, bbox: &BoundingBox, config: Config) -> Result<Tld> {
        config.validate()?;
        frame.check().context("invalid initial frame")?;
        ensure!(
            !bbox.is_empty() && bbox.is_within(frame.width, frame.height),
            "initial box {:?} is not inside the {} x {} frame",
            bbox,
            frame.width,
            frame.height
        );

        let mut rng = TldRng::seed_from_u64(config.seed);
        let object_model = ObjectModel::new(frame, bbox, &config, &mut rng)?;
        let pyramid_frame = Arc::new(PyramidFrame::new(frame.clone(), config.max_pyr_level)?);
        let tracker = MedianFlowTracker::new(pyramid_frame, bbox, &config, &mut rng);
        let detector = CascadeClassifier::new(frame, bbox, object_model, &config, &mut rng)?;

        let mut tld = Tld {
            config,
            rng,
            frame_size: (frame.width, frame.height),
            tracker,
            detector,
            is_valid_prev_bbox: false,
        };
        tld.learn(frame, bbox)?;
        info!("tld initialized on {:?}", bbox);
        Ok(tld)
    }

    /// Track, detect, fuse and, when the previous box was trusted, learn.
    #[instrument(skip_all)]
    pub fn run(&mut self, frame: &Image) -> Result<FrameResult> {
        frame.check()?;
        ensure!(
            (frame.width, frame.height) == self.frame_size,
            "frame size {} x {} differs from the initial {} x {}",
            frame.width,
            frame.height,
            self.frame_size.0,
            self.frame_size.1
        );
        let pyramid_frame = Arc::new(PyramidFrame::new(frame.clone(), self.config.max_pyr_level)?);

        let tracked = self.tracker.track(pyramid_frame.clone(), &mut self.rng);
        let integral = IntegralImage::new(frame);
        let detected = self.detector.detect(frame, &integral)?;
        let fused = self.fuse_and_learn(pyramid_frame, tracked, &detected)?;

        debug!(
            "tracked {:?}, {} detections, fused {:?}, valid {}",
            tracked,
            detected.len(),
            fused,
            self.is_valid_prev_bbox
        );

        Ok(FrameResult {
            tracked,
            detected,
            fused,
            valid: self.is_valid_prev_bbox,
        })
    }

    /// Fuse, then learn from the fused box if the box of the previous frame
    /// was valid.
    fn fuse_and_learn(
        &mut self,
        frame: Arc<PyramidFrame>,
        tracked: Option<BoundingBox>,
        detected: &[BoundingBox],
    ) -> Result<Option<BoundingBox>> {
        let was_valid = self.is_valid_prev_bbox;
        let fused = self.fuse(frame.clone(), tracked, detected)?;
        if was_valid {
            if let Some(fused) = &fused {
                self.learn(&frame.image, fused)?;
            }
        }
        Ok(fused)
    }

    /// Combine the tracker and detector outputs into one box and update the
    /// validity flag. The tracker is restarted whenever a detection wins.
    fn fuse(
        &mut self,
        frame: Arc<PyramidFrame>,
        tracked: Option<BoundingBox>,
        detected: &[BoundingBox],
    ) -> Result<Option<BoundingBox>> {
        if tracked.is_none() && detected.is_empty() {
            self.is_valid_prev_bbox = false;
            self.tracker.reinitialize(frame, None, &mut self.rng);
            return Ok(None);
        }
        let image = &frame.image;

        let detection_confidence = match detected.first() {
            Some(first) => self.detector.confidence(image, first)?,
            None => 0.,
        };

        let mut valid = false;
        let fused = match tracked {
            Some(tracked) => {
                let tracked_confidence = self.detector.confidence(image, &tracked)?;
                if detected.len() == 1 && detection_confidence > tracked_confidence {
                    debug!(
                        "detection {:.3} beats track {:.3}",
                        detection_confidence, tracked_confidence
                    );
                    detected[0]
                } else {
                    valid = is_confident(tracked_confidence, self.is_valid_prev_bbox, &self.config);
                    tracked
                }
            }
            None if detected.len() == 1 => detected[0],
            None => {
                // several candidates without a track: take the most confident one
                let mut best = (detected[0], detection_confidence);
                for candidate in &detected[1..] {
                    let confidence = self.detector.confidence(image, candidate)?;
                    if confidence > best.1 {
                        best = (*candidate, confidence);
                    }
                }
                best.0
            }
        };
        if tracked != Some(fused) {
            self.tracker.reinitialize(frame.clone(), Some(fused), &mut self.rng);
        }

        self.is_valid_prev_bbox = valid;
        Ok(Some(fused))
    }

    /// P/N learning from the box `fused` on `frame`.
    fn learn(&mut self, frame: &Image, fused: &BoundingBox) -> Result<()> {
        let fused_confidence = self.detector.confidence(frame, fused)?;

        let decisions = self
            .detector
            .pool()
            .par_iter()
            .map(|(id, classifier)| -> Result<Option<(WindowId, Expert)>> {
                let overlap = classifier.bbox.iou(fused);
                if (0.2..=0.6).contains(&overlap) {
                    return Ok(None);
                }
                let confidence = classifier.classify_patch(frame)?;
                Ok(if overlap > 0.6 && confidence < 0.5 {
                    Some((id, Expert::Positive))
                } else if overlap < 0.2 && confidence > 0.5 {
                    Some((id, Expert::Negative))
                } else {
                    None
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let size = self.detector.object_model().template_size();
        let mut positives = 0;
        let mut negatives = 0;
        for (id, expert) in decisions.into_iter().flatten() {
            let classifier = match self.detector.pool_mut().get_mut(id) {
                Some(classifier) => classifier,
                None => continue,
            };
            match expert {
                Expert::Positive => {
                    classifier.update(frame, true)?;
                    positives += 1;
                }
                Expert::Negative => {
                    classifier.update(frame, false)?;
                    let template = frame.crop_resized(&classifier.bbox, size, size)?;
                    self.detector
                        .object_model_mut()
                        .add_negative_template(template, &mut self.rng);
                    negatives += 1;
                }
            }
        }

        let mut new_template = false;
        if fused_confidence < self.config.theta_plus {
            let template = frame.crop_resized(fused, size, size)?;
            self.detector
                .object_model_mut()
                .add_positive_template(template, &mut self.rng);
            new_template = true;
        }
        debug!(
            "learned from {:?}: {} positive and {} negative window updates, new template {}",
            fused, positives, negatives, new_template
        );
        Ok(())
    }

    /// Validity of the last fused box
    pub fn is_valid(&self) -> bool {
        self.is_valid_prev_bbox
    }

    pub fn tracker(&self) -> &MedianFlowTracker {
        &self.tracker
    }

    pub fn detector(&self) -> &CascadeClassifier {
        &self.detector
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}
