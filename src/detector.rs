use std::collections::VecDeque;

use anyhow::{ensure, Context as AnyhowContext, Result};
use rayon::prelude::*;
use tracing::{debug, info};

use crate::bbox::{nms, BoundingBox};
use crate::config::Config;
use crate::ensemble::EnsembleClassifier;
use crate::image::Image;
use crate::math::{compute_ncc, IntegralImage};
use crate::my_types::TldRng;
use crate::object_model::ObjectModel;

/// Stable index of a scanning window in the classifier pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WindowId(pub usize);

/// Scanning windows with their ensemble classifiers. The geometry never
/// changes after construction, only the fern histograms do.
#[derive(Debug, Default)]
pub struct ClassifierPool {
    classifiers: Vec<EnsembleClassifier>,
}

impl ClassifierPool {
    pub fn get(&self, id: WindowId) -> Option<&EnsembleClassifier> {
        self.classifiers.get(id.0)
    }

    pub fn get_mut(&mut self, id: WindowId) -> Option<&mut EnsembleClassifier> {
        self.classifiers.get_mut(id.0)
    }

    pub fn len(&self) -> usize {
        self.classifiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classifiers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (WindowId, &EnsembleClassifier)> {
        self.classifiers
            .iter()
            .enumerate()
            .map(|(i, c)| (WindowId(i), c))
    }

    pub fn par_iter(&self) -> impl IndexedParallelIterator<Item = (WindowId, &EnsembleClassifier)> {
        self.classifiers
            .par_iter()
            .enumerate()
            .map(|(i, c)| (WindowId(i), c))
    }
}

/// How far a window got through the cascade.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Stage {
    Variance,
    Ensemble,
    Template,
    Accepted,
}

/// Sliding-window detector: variance filter, fern ensemble, then template
/// matching against the object model.
#[derive(Debug)]
pub struct CascadeClassifier {
    config: Config,
    frame_size: (usize, usize),
    var_min: f64,
    pool: ClassifierPool,
    object_model: ObjectModel,
}

impl CascadeClassifier {
    pub fn new(
        frame: &Image,
        bbox: &BoundingBox,
        object_model: ObjectModel,
        config: &Config,
        rng: &mut TldRng,
    ) -> Result<CascadeClassifier> {
        frame.check()?;
        let integral = IntegralImage::new(frame);
        let var_min = config.variance_fraction
            * integral
                .patch_variance(bbox)
                .context("initial box must lie inside the first frame")?;

        let (width, height) = (frame.width as f64, frame.height as f64);
        let step_x = config.width_fraction * bbox.width;
        let step_y = config.height_fraction * bbox.height;
        ensure!(
            step_x > 0. && step_y > 0.,
            "window steps must be positive, got {} x {}",
            step_x,
            step_y
        );

        let mut classifiers = vec![];
        let scale_count = ((config.max_scale - config.min_scale) / config.scale_step + 1e-9).floor();
        for i in 0..=(scale_count.max(-1.) as i64) {
            let s = config.min_scale + i as f64 * config.scale_step;
            let w = s * bbox.width;
            let h = s * bbox.height;
            if w * h < config.min_area {
                continue;
            }
            let mut row = 0;
            loop {
                let y = row as f64 * step_y;
                if y + h > height {
                    break;
                }
                let mut col = 0;
                loop {
                    let x = col as f64 * step_x;
                    if x + w > width {
                        break;
                    }
                    classifiers.push(EnsembleClassifier::new(
                        config.num_ferns,
                        config.num_binary_features,
                        BoundingBox::new(x, y, w, h),
                        rng,
                    )?);
                    col += 1;
                }
                row += 1;
            }
        }
        ensure!(
            !classifiers.is_empty(),
            "no scanning window fits a {} x {} frame for box {:?}",
            frame.width,
            frame.height,
            bbox
        );
        info!(
            "cascade detector initialized with {} windows, minimum variance {:.1}",
            classifiers.len(),
            var_min
        );

        Ok(CascadeClassifier {
            config: config.clone(),
            frame_size: (frame.width, frame.height),
            var_min,
            pool: ClassifierPool { classifiers },
            object_model,
        })
    }

    /// Run the cascade over every window and cluster the survivors.
    pub fn detect(&self, frame: &Image, integral: &IntegralImage) -> Result<Vec<BoundingBox>> {
        ensure!(
            (frame.width, frame.height) == self.frame_size,
            "frame size {} x {} differs from the initial {} x {}",
            frame.width,
            frame.height,
            self.frame_size.0,
            self.frame_size.1
        );

        let stages = self
            .pool
            .par_iter()
            .map(|(_, classifier)| self.evaluate_window(frame, integral, classifier))
            .collect::<Result<Vec<Stage>>>()?;

        let detections: Vec<BoundingBox> = self
            .pool
            .iter()
            .zip(stages.iter())
            .filter(|(_, stage)| **stage == Stage::Accepted)
            .map(|((_, classifier), _)| classifier.bbox)
            .collect();

        let count = |stage: Stage| stages.iter().filter(|s| **s == stage).count();
        debug!(
            "windows {}: variance rejected {}, ensemble rejected {}, template rejected {}, accepted {}",
            stages.len(),
            count(Stage::Variance),
            count(Stage::Ensemble),
            count(Stage::Template),
            detections.len()
        );

        let clusters = nms(&detections, self.config.overlap_threshold);
        debug!("{} detections after clustering", clusters.len());
        Ok(clusters)
    }

    fn evaluate_window(
        &self,
        frame: &Image,
        integral: &IntegralImage,
        classifier: &EnsembleClassifier,
    ) -> Result<Stage> {
        if integral.patch_variance(&classifier.bbox)? <= self.var_min {
            return Ok(Stage::Variance);
        }
        if classifier.classify_patch(frame)? <= 0.5 {
            return Ok(Stage::Ensemble);
        }
        if self.template_matching(&frame.crop(&classifier.bbox)?)? <= self.config.theta_minus {
            return Ok(Stage::Template);
        }
        Ok(Stage::Accepted)
    }

    /// Relative similarity `dN / (dN + dP)` of `patch` to the object model,
    /// close to 1 when the patch looks more like a positive template than
    /// like any negative one.
    pub fn template_matching(&self, patch: &Image) -> Result<f64> {
        let size = self.object_model.template_size();
        let resized = patch.resize(size, size);

        let min_distance = |templates: &VecDeque<Image>, kind: &str| -> Result<f64> {
            ensure!(!templates.is_empty(), "no {} templates to match against", kind);
            let mut min = f64::INFINITY;
            for template in templates {
                let distance = 1. - 0.5 * (compute_ncc(&resized, template)? + 1.);
                min = min.min(distance);
            }
            Ok(min)
        };
        let positive = min_distance(self.object_model.positive_templates(), "positive")?;
        let negative = min_distance(self.object_model.negative_templates(), "negative")?;

        if positive + negative <= 0. {
            return Ok(0.5);
        }
        Ok(negative / (positive + negative))
    }

    /// Template matching confidence of the patch under `bbox`.
    pub fn confidence(&self, frame: &Image, bbox: &BoundingBox) -> Result<f64> {
        let patch = frame
            .crop(bbox)
            .with_context(|| format!("cannot score box {:?}", bbox))?;
        self.template_matching(&patch)
    }

    pub fn pool(&self) -> &ClassifierPool {
        &self.pool
    }

    pub fn pool_mut(&mut self) -> &mut ClassifierPool {
        &mut self.pool
    }

    pub fn object_model(&self) -> &ObjectModel {
        &self.object_model
    }

    pub fn object_model_mut(&mut self) -> &mut ObjectModel {
        &mut self.object_model
    }
}
