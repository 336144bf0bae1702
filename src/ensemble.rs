use anyhow::{bail, ensure, Context as AnyhowContext, Result};
use rand::Rng;

use crate::bbox::BoundingBox;
use crate::image::Image;
use crate::my_types::TldRng;

/// A random binary-feature hash over pixel comparisons with per-code
/// positive and negative counts.
#[derive(Clone, Debug)]
pub struct Fern {
    /// Pixel pairs as offsets from the top-left corner of the box.
    pixel_pairs: Vec<[(usize, usize); 2]>,
    num_pos: Vec<u32>,
    num_neg: Vec<u32>,
}

impl Fern {
    pub fn new(num_binary_features: usize, bbox: &BoundingBox, rng: &mut TldRng) -> Result<Fern> {
        ensure!(
            (1..=16).contains(&num_binary_features),
            "fern needs 1..=16 binary features, got {}",
            num_binary_features
        );
        let rect = match bbox.pixel_rect() {
            Some(rect) => rect,
            None => bail!("cannot place fern features in box {:?}", bbox),
        };
        let mut offset = || (rng.gen_range(0..rect.width), rng.gen_range(0..rect.height));
        let pixel_pairs = (0..num_binary_features)
            .map(|_| [offset(), offset()])
            .collect();
        let posterior_size = 1 << num_binary_features;
        Ok(Fern {
            pixel_pairs,
            num_pos: vec![0; posterior_size],
            num_neg: vec![0; posterior_size],
        })
    }

    /// Binary code of the patch under `bbox`, first feature in the most significant bit.
    pub fn calc_fern(&self, frame: &Image, bbox: &BoundingBox) -> Result<usize> {
        let rect = frame.pixel_rect(bbox)?;
        let mut code = 0;
        for &[(x1, y1), (x2, y2)] in &self.pixel_pairs {
            ensure!(
                x1.max(x2) < rect.width && y1.max(y2) < rect.height,
                "fern features do not fit in {:?}",
                rect
            );
            let pix1 = frame.value(rect.x + x1, rect.y + y1);
            let pix2 = frame.value(rect.x + x2, rect.y + y2);
            code = (code << 1) | (pix1 > pix2) as usize;
        }
        Ok(code)
    }

    /// `numPos / (numPos + numNeg)` at `code`, 0 when never seen.
    pub fn posterior(&self, code: usize) -> f64 {
        let pos = self.num_pos[code] as f64;
        let neg = self.num_neg[code] as f64;
        if pos + neg == 0. {
            0.
        } else {
            pos / (pos + neg)
        }
    }

    pub fn num_pos(&self, code: usize) -> u32 {
        self.num_pos[code]
    }

    pub fn num_neg(&self, code: usize) -> u32 {
        self.num_neg[code]
    }

    pub fn posterior_size(&self) -> usize {
        self.num_pos.len()
    }
}

/// A bag of ferns bound to one fixed window.
#[derive(Clone, Debug)]
pub struct EnsembleClassifier {
    pub bbox: BoundingBox,
    ferns: Vec<Fern>,
}

impl EnsembleClassifier {
    pub fn new(
        num_ferns: usize,
        num_binary_features: usize,
        bbox: BoundingBox,
        rng: &mut TldRng,
    ) -> Result<EnsembleClassifier> {
        ensure!(num_ferns > 0, "ensemble needs at least one fern");
        let ferns = (0..num_ferns)
            .map(|_| Fern::new(num_binary_features, &bbox, rng))
            .collect::<Result<Vec<_>>>()?;
        Ok(EnsembleClassifier { bbox, ferns })
    }

    pub fn ferns(&self) -> &[Fern] {
        &self.ferns
    }

    /// Current code of every fern on `frame`
    pub fn codes(&self, frame: &Image) -> Result<Vec<usize>> {
        self.ferns
            .iter()
            .map(|fern| fern.calc_fern(frame, &self.bbox))
            .collect::<Result<Vec<_>>>()
            .with_context(|| format!("cannot classify window {:?}", self.bbox))
    }

    /// Mean fern posterior of the window on `frame`, in `[0, 1]`.
    pub fn classify_patch(&self, frame: &Image) -> Result<f64> {
        let codes = self.codes(frame)?;
        let sum: f64 = self
            .ferns
            .iter()
            .zip(codes)
            .map(|(fern, code)| fern.posterior(code))
            .sum();
        Ok(sum / self.ferns.len() as f64)
    }

    /// Count the window on `frame` as a positive or negative example.
    pub fn update(&mut self, frame: &Image, positive: bool) -> Result<()> {
        let codes = self.codes(frame)?;
        for (fern, code) in self.ferns.iter_mut().zip(codes) {
            if positive {
                fern.num_pos[code] += 1;
            } else {
                fern.num_neg[code] += 1;
            }
        }
        Ok(())
    }
}
