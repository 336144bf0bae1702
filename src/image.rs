use anyhow::{bail, ensure, Context as AnyhowContext, Result};

use crate::bbox::{BoundingBox, PixelRect};
use crate::my_types::*;

/// Row-major grayscale image storage
#[derive(Clone, Debug, PartialEq)]
pub struct Image {
    pub data: Vec<u8>,
    pub width: usize,
    pub height: usize,
}

impl Image {
    /// Create an empty image
    pub fn empty() -> Image {
        Image {
            data: vec![],
            width: 0,
            height: 0,
        }
    }

    /// Create an image filled with a single value
    pub fn new(width: usize, height: usize, value: u8) -> Image {
        Image {
            data: vec![value; width * height],
            width,
            height,
        }
    }

    /// Wrap an existing buffer, checking its length
    pub fn from_vec(width: usize, height: usize, data: Vec<u8>) -> Result<Image> {
        let image = Image {
            data,
            width,
            height,
        };
        image.check()?;
        Ok(image)
    }

    /// Verify the buffer holds exactly `width * height` pixels
    pub fn check(&self) -> Result<()> {
        ensure!(
            self.width > 0 && self.height > 0,
            "image has zero size {} x {}",
            self.width,
            self.height
        );
        ensure!(
            self.data.len() == self.width * self.height,
            "image buffer holds {} bytes, expected {} x {}",
            self.data.len(),
            self.width,
            self.height
        );
        Ok(())
    }

    #[inline(always)]
    pub fn value(&self, x: usize, y: usize) -> u8 {
        self.data[y * self.width + x]
    }

    #[inline(always)]
    pub fn value_i32(&self, x: i32, y: i32) -> u8 {
        self.data[y as usize * self.width + x as usize]
    }

    #[inline(always)]
    pub fn set_value(&mut self, x: usize, y: usize, value: u8) {
        self.data[y * self.width + x] = value;
    }

    /// Paste `patch` with its top-left corner at (x, y), clipping at the borders
    pub fn set_sub_image(&mut self, x: i32, y: i32, patch: &Image) {
        for py in 0..patch.height as i32 {
            for px in 0..patch.width as i32 {
                let (tx, ty) = (x + px, y + py);
                if tx < 0 || ty < 0 || tx >= self.width as i32 || ty >= self.height as i32 {
                    continue;
                }
                self.set_value(tx as usize, ty as usize, patch.value_i32(px, py));
            }
        }
    }

    /// Pixel rectangle of `bbox`, which must lie inside the image
    pub fn pixel_rect(&self, bbox: &BoundingBox) -> Result<PixelRect> {
        let rect = match bbox.pixel_rect() {
            Some(rect) => rect,
            None => bail!("degenerate box {:?}", bbox),
        };
        if rect.x + rect.width > self.width || rect.y + rect.height > self.height {
            bail!(
                "box {:?} exceeds image bounds {} x {}",
                bbox,
                self.width,
                self.height
            );
        }
        Ok(rect)
    }

    /// Copy the pixels under `bbox`
    pub fn crop(&self, bbox: &BoundingBox) -> Result<Image> {
        let rect = self.pixel_rect(bbox)?;
        let mut data = Vec::with_capacity(rect.area());
        for y in rect.y..rect.y + rect.height {
            let row = y * self.width;
            data.extend_from_slice(&self.data[row + rect.x..row + rect.x + rect.width]);
        }
        Ok(Image {
            data,
            width: rect.width,
            height: rect.height,
        })
    }

    /// Crop `bbox` and resample it to `width × height`
    pub fn crop_resized(&self, bbox: &BoundingBox, width: usize, height: usize) -> Result<Image> {
        let patch = self
            .crop(bbox)
            .with_context(|| format!("cannot extract template at {:?}", bbox))?;
        Ok(patch.resize(width, height))
    }

    /// Bilinear resampling to a new size, pixel centers aligned
    pub fn resize(&self, width: usize, height: usize) -> Image {
        if width == self.width && height == self.height {
            return self.clone();
        }
        let sx = self.width as f64 / width as f64;
        let sy = self.height as f64 / height as f64;
        let mut data = Vec::with_capacity(width * height);
        for y in 0..height {
            let v = (y as f64 + 0.5) * sy - 0.5;
            for x in 0..width {
                let u = (x as f64 + 0.5) * sx - 0.5;
                data.push(bilinear(self, Vector2d::new(u, v)).round() as u8);
            }
        }
        Image {
            data,
            width,
            height,
        }
    }

    /// Sample a `size × size` patch centred on `center` with bilinear interpolation
    pub fn sample_patch(&self, center: Vector2d, size: usize) -> Image {
        let half = (size as f64 - 1.) / 2.;
        let mut data = Vec::with_capacity(size * size);
        for y in 0..size {
            for x in 0..size {
                let p = center + Vector2d::new(x as f64 - half, y as f64 - half);
                data.push(bilinear(self, p).round() as u8);
            }
        }
        Image {
            data,
            width: size,
            height: size,
        }
    }
}

/// Bilinear interpolation, coordinates clamped to the image borders
pub fn bilinear(image: &Image, point: Vector2d) -> f64 {
    debug_assert!(image.width > 0 && image.height > 0);
    let x = point[0].clamp(0., (image.width - 1) as f64);
    let y = point[1].clamp(0., (image.height - 1) as f64);
    let x0 = x.floor() as usize;
    let y0 = y.floor() as usize;
    let x1 = usize::min(x0 + 1, image.width - 1);
    let y1 = usize::min(y0 + 1, image.height - 1);
    let fx = x - x0 as f64;
    let fy = y - y0 as f64;

    let v00 = image.value(x0, y0) as f64;
    let v10 = image.value(x1, y0) as f64;
    let v01 = image.value(x0, y1) as f64;
    let v11 = image.value(x1, y1) as f64;

    (1. - fy) * ((1. - fx) * v00 + fx * v10) + fy * ((1. - fx) * v01 + fx * v11)
}
