use anyhow::{bail, ensure, Result};
use ndarray as nd;
use num_traits::Float;

use crate::bbox::{BoundingBox, PixelRect};
use crate::image::Image;

/// Statistical median. Even-length inputs average the two middle values;
/// an empty input yields zero.
pub fn median<T: Float>(values: &[T]) -> T {
    if values.is_empty() {
        return T::zero();
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / (T::one() + T::one())
    } else {
        sorted[mid]
    }
}

/// Summed-area tables of pixel values and of squared pixel values.
///
/// Both tables carry one leading row and column of zeros, so entry
/// `(y, x)` holds the sum over all pixels above and left of `(x, y)`.
#[derive(Debug)]
pub struct IntegralImage {
    sum: nd::Array2<u64>,
    sum_sq: nd::Array2<u64>,
    width: usize,
    height: usize,
}

impl IntegralImage {
    pub fn new(image: &Image) -> Self {
        let (w, h) = (image.width, image.height);
        let mut sum = nd::Array2::<u64>::zeros((h + 1, w + 1));
        let mut sum_sq = nd::Array2::<u64>::zeros((h + 1, w + 1));
        for y in 1..=h {
            let mut row = 0u64;
            let mut row_sq = 0u64;
            for x in 1..=w {
                let v = image.value(x - 1, y - 1) as u64;
                row += v;
                row_sq += v * v;
                sum[(y, x)] = sum[(y - 1, x)] + row;
                sum_sq[(y, x)] = sum_sq[(y - 1, x)] + row_sq;
            }
        }
        Self {
            sum,
            sum_sq,
            width: w,
            height: h,
        }
    }

    fn rect(&self, bbox: &BoundingBox) -> Result<PixelRect> {
        match bbox.pixel_rect() {
            Some(r) if r.x + r.width <= self.width && r.y + r.height <= self.height => Ok(r),
            _ => bail!(
                "box {:?} outside integral image {} x {}",
                bbox,
                self.width,
                self.height
            ),
        }
    }

    fn corners(table: &nd::Array2<u64>, r: &PixelRect) -> u64 {
        let (x0, y0, x1, y1) = (r.x, r.y, r.x + r.width, r.y + r.height);
        table[(y1, x1)] + table[(y0, x0)] - table[(y0, x1)] - table[(y1, x0)]
    }

    /// Sum of the pixels under `bbox`
    pub fn sum_patch(&self, bbox: &BoundingBox) -> Result<u64> {
        let rect = self.rect(bbox)?;
        Ok(Self::corners(&self.sum, &rect))
    }

    /// Sum of the squared pixels under `bbox`
    pub fn sum_sq_patch(&self, bbox: &BoundingBox) -> Result<u64> {
        let rect = self.rect(bbox)?;
        Ok(Self::corners(&self.sum_sq, &rect))
    }

    /// `E[x²] - E[x]²` over the pixels under `bbox`
    pub fn patch_variance(&self, bbox: &BoundingBox) -> Result<f64> {
        let rect = self.rect(bbox)?;
        let n = rect.area() as f64;
        let mean = Self::corners(&self.sum, &rect) as f64 / n;
        let mean_sq = Self::corners(&self.sum_sq, &rect) as f64 / n;
        Ok(mean_sq - mean * mean)
    }
}

/// Normalized cross-correlation coefficient of two equally sized patches.
///
/// A patch without variance correlates with nothing and yields 0.
pub fn compute_ncc(patch0: &Image, patch1: &Image) -> Result<f64> {
    ensure!(
        patch0.width == patch1.width && patch0.height == patch1.height,
        "cannot correlate {} x {} patch with {} x {} patch",
        patch0.width,
        patch0.height,
        patch1.width,
        patch1.height
    );
    let n = patch0.data.len() as f64;
    ensure!(n > 0., "cannot correlate empty patches");

    let mean0 = patch0.data.iter().map(|&v| v as f64).sum::<f64>() / n;
    let mean1 = patch1.data.iter().map(|&v| v as f64).sum::<f64>() / n;

    let mut cov = 0.;
    let mut var0 = 0.;
    let mut var1 = 0.;
    for (&a, &b) in patch0.data.iter().zip(patch1.data.iter()) {
        let a = a as f64 - mean0;
        let b = b as f64 - mean1;
        cov += a * b;
        var0 += a * a;
        var1 += b * b;
    }
    let denominator = (var0 * var1).sqrt();
    if denominator <= f64::EPSILON {
        return Ok(0.);
    }
    Ok((cov / denominator).clamp(-1., 1.))
}
