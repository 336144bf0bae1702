use std::collections::VecDeque;
use std::f64::consts::PI;

use anyhow::{ensure, Context as AnyhowContext, Result};
use rand::Rng;
use tracing::info;

use crate::bbox::BoundingBox;
use crate::config::{Config, ReplacementPolicy};
use crate::image::Image;
use crate::my_types::TldRng;

/// Bounded memory of positive and negative appearance templates.
#[derive(Debug)]
pub struct ObjectModel {
    positive_templates: VecDeque<Image>,
    negative_templates: VecDeque<Image>,
    max_size: usize,
    replacement_policy: ReplacementPolicy,
    template_size: usize,
}

impl ObjectModel {
    /// Seed the model from the first frame: jittered copies of the object
    /// as positives, boxes sampled around it as negatives.
    pub fn new(
        frame: &Image,
        bbox: &BoundingBox,
        config: &Config,
        rng: &mut TldRng,
    ) -> Result<ObjectModel> {
        ensure!(
            !bbox.is_empty() && bbox.is_within(frame.width, frame.height),
            "initial box {:?} is not inside the {} x {} frame",
            bbox,
            frame.width,
            frame.height
        );
        let size = config.template_size;
        let mut model = ObjectModel {
            positive_templates: VecDeque::with_capacity(config.max_obj_model_size),
            negative_templates: VecDeque::with_capacity(config.max_obj_model_size),
            max_size: config.max_obj_model_size,
            replacement_policy: config.replacement_policy,
            template_size: size,
        };

        let x_shift = 0.2 * bbox.width;
        let y_shift = 0.2 * bbox.height;
        for _ in 0..config.init_obj_model_size {
            let shifted = bbox.translate(
                rng.gen_range(-x_shift..=x_shift),
                rng.gen_range(-y_shift..=y_shift),
            );
            if let Some(clipped) = shifted.clip(frame.width, frame.height) {
                let template = frame
                    .crop_resized(&clipped, size, size)
                    .context("cannot build positive template")?;
                model.positive_templates.push_back(template);
            }
        }

        let r = bbox.width.hypot(bbox.height);
        let dr = 0.2 * r;
        let max_attempts = 10 * config.init_obj_model_size;
        let mut attempts = 0;
        while model.negative_templates.len() < config.init_obj_model_size && attempts < max_attempts
        {
            attempts += 1;
            let candidate = create_nearby_bbox(bbox, 0.2, r, dr, 0.3, rng);
            let clipped = match candidate.clip(frame.width, frame.height) {
                Some(clipped) if clipped.area() >= config.min_area => clipped,
                _ => continue,
            };
            if let Ok(template) = frame.crop_resized(&clipped, size, size) {
                model.negative_templates.push_back(template);
            }
        }

        ensure!(
            !model.positive_templates.is_empty(),
            "no positive template could be extracted around {:?}",
            bbox
        );
        ensure!(
            !model.negative_templates.is_empty(),
            "no negative template could be extracted around {:?} after {} attempts",
            bbox,
            attempts
        );
        info!(
            "object model initialized with {} positive and {} negative templates",
            model.positive_templates.len(),
            model.negative_templates.len()
        );
        Ok(model)
    }

    /// Build a model from ready-made templates, resized to the configured template size.
    pub fn from_templates(
        positive_templates: impl IntoIterator<Item = Image>,
        negative_templates: impl IntoIterator<Item = Image>,
        config: &Config,
    ) -> ObjectModel {
        let size = config.template_size;
        let bounded = |templates: VecDeque<Image>| -> VecDeque<Image> {
            let skip = templates.len().saturating_sub(config.max_obj_model_size);
            templates.into_iter().skip(skip).collect()
        };
        ObjectModel {
            positive_templates: bounded(
                positive_templates.into_iter().map(|t| t.resize(size, size)).collect(),
            ),
            negative_templates: bounded(
                negative_templates.into_iter().map(|t| t.resize(size, size)).collect(),
            ),
            max_size: config.max_obj_model_size,
            replacement_policy: config.replacement_policy,
            template_size: size,
        }
    }

    pub fn add_positive_template(&mut self, template: Image, rng: &mut TldRng) {
        debug_assert_eq!(template.width, self.template_size);
        push_bounded(
            &mut self.positive_templates,
            template,
            self.max_size,
            self.replacement_policy,
            rng,
        );
    }

    pub fn add_negative_template(&mut self, template: Image, rng: &mut TldRng) {
        debug_assert_eq!(template.width, self.template_size);
        push_bounded(
            &mut self.negative_templates,
            template,
            self.max_size,
            self.replacement_policy,
            rng,
        );
    }

    pub fn positive_templates(&self) -> &VecDeque<Image> {
        &self.positive_templates
    }

    pub fn negative_templates(&self) -> &VecDeque<Image> {
        &self.negative_templates
    }

    /// Side length of the square templates
    pub fn template_size(&self) -> usize {
        self.template_size
    }
}

fn push_bounded(
    templates: &mut VecDeque<Image>,
    template: Image,
    max_size: usize,
    policy: ReplacementPolicy,
    rng: &mut TldRng,
) {
    if templates.len() < max_size {
        templates.push_back(template);
        return;
    }
    match policy {
        ReplacementPolicy::Random => {
            let index = rng.gen_range(0..templates.len());
            templates[index] = template;
        }
        ReplacementPolicy::Fifo => {
            templates.pop_front();
            templates.push_back(template);
        }
    }
}

fn random_point_inside(bbox: &BoundingBox, rng: &mut TldRng) -> (f64, f64) {
    (
        rng.gen_range(bbox.x..=bbox.right()),
        rng.gen_range(bbox.y..=bbox.bottom()),
    )
}

/// Random box next to `bbox` with roughly its diagonal length `r` and aspect angle.
///
/// A start point is drawn from one of the eight border regions of width
/// `margin_frac` around the inner part of `bbox`; the second corner lies at
/// radius `r ± dr` in a direction pointing away from the box, jittered by
/// `± dtheta`. Image y grows downwards.
pub fn create_nearby_bbox(
    bbox: &BoundingBox,
    margin_frac: f64,
    r: f64,
    dr: f64,
    dtheta: f64,
    rng: &mut TldRng,
) -> BoundingBox {
    let BoundingBox {
        x,
        y,
        width: w,
        height: h,
    } = *bbox;
    let margin_x = w * margin_frac;
    let margin_y = h * margin_frac;
    let xc = x + margin_x;
    let yc = y + margin_y;
    let wc = w - 2. * margin_x;
    let hc = h - 2. * margin_y;
    let theta = h.atan2(w);

    let regions = [
        BoundingBox::new(x, y, margin_x, margin_y),
        BoundingBox::new(xc, y, wc, margin_y),
        BoundingBox::new(xc + wc, y, margin_x, margin_y),
        BoundingBox::new(x, yc, margin_x, hc),
        BoundingBox::new(xc + wc, yc, margin_x, hc),
        BoundingBox::new(x, yc + hc, margin_x, margin_y),
        BoundingBox::new(xc, yc + hc, wc, margin_y),
        BoundingBox::new(xc + wc, yc + hc, margin_x, margin_y),
    ];
    let directions: [&[f64]; 8] = [
        &[theta, PI - theta, PI + theta],
        &[theta, PI - theta],
        &[theta, PI - theta, -theta],
        &[PI - theta, PI + theta],
        &[theta, -theta],
        &[PI - theta, PI + theta, -theta],
        &[PI + theta, -theta],
        &[theta, -theta, PI + theta],
    ];

    let region = rng.gen_range(0..regions.len());
    let (x1, y1) = random_point_inside(&regions[region], rng);
    let dirs = directions[region];
    let dir = dirs[rng.gen_range(0..dirs.len())];

    let angle = rng.gen_range(dir - dtheta..=dir + dtheta);
    let radius = rng.gen_range(r - dr..=r + dr);
    let x2 = x1 + radius * angle.cos();
    let y2 = y1 - radius * angle.sin();

    BoundingBox::new(x1.min(x2), y1.min(y2), (x2 - x1).abs(), (y2 - y1).abs())
}
