use anyhow::Result;

use crate::image::Image;
use crate::pyramid::Pyramid;

/// A frame together with the downscaled levels used by optical flow.
#[derive(Debug)]
pub struct PyramidFrame {
    /// original image
    pub image: Image,
    /// downsized images
    pub pyramid: Pyramid,
}

impl PyramidFrame {
    pub fn new(image: Image, lk_levels: usize) -> Result<PyramidFrame> {
        image.check()?;
        let mut pyramid = Pyramid::empty();
        pyramid.compute(&image, lk_levels)?;
        Ok(PyramidFrame { image, pyramid })
    }

    /// Number of levels including the original image
    pub fn level_count(&self) -> usize {
        self.pyramid.levels.len() + 1
    }

    pub fn get_image_at_level(&self, level: usize) -> &Image {
        if level == 0 {
            &self.image
        } else {
            &self.pyramid.levels[level - 1]
        }
    }
}
