use anyhow::{bail, Result};

use crate::image::Image;

/// Levels smaller than this on either side are not built.
const MIN_LEVEL_SIZE: usize = 8;

#[derive(Debug)]
pub struct Pyramid {
    pub levels: Vec<Image>,
    pub parent_size: [usize; 2],
}

impl Pyramid {
    pub fn empty() -> Self {
        Self {
            levels: vec![],
            parent_size: [0; 2],
        }
    }

    /// Build up to `level_count` downscaled levels of `frame`. Fewer levels
    /// are kept when the image becomes too small to halve again.
    pub fn compute(&mut self, frame: &Image, level_count: usize) -> Result<()> {
        self.compute_levels(frame, level_count)?;
        self.parent_size = [frame.width, frame.height];
        Ok(())
    }

    fn compute_levels(&mut self, frame: &Image, level_count: usize) -> Result<()> {
        let mut size = [frame.width, frame.height];
        let mut usable = 0;
        while usable < level_count {
            size = [(size[0] + 1) / 2, (size[1] + 1) / 2];
            if size[0] < MIN_LEVEL_SIZE || size[1] < MIN_LEVEL_SIZE {
                break;
            }
            usable += 1;
        }

        while self.levels.len() < usable {
            self.levels.push(Image::empty())
        }
        self.levels.truncate(usable);
        if usable == 0 {
            return Ok(());
        }
        downscale(frame, &mut self.levels[0])?;
        for i in 0..(usable - 1) {
            let rest = &mut self.levels[i..];
            // split_first_mut Returns the first and all the rest of the elements of the slice, or None if it is empty
            if let Some((parent, rest)) = rest.split_first_mut() {
                downscale(parent, &mut rest[0])?;
            }
        }
        Ok(())
    }
}

/// downscale the parent image and store the result in child
fn downscale(parent: &Image, child: &mut Image) -> Result<()> {
    let w = parent.width as i32;
    let h = parent.height as i32;
    if w == 0 || h == 0 {
        bail!("cannot downscale image with shape {w} x {h}");
    }

    let w_half = (w + 1) / 2;
    let h_half = (h + 1) / 2;
    child.data.clear();
    child.width = w_half as usize;
    child.height = h_half as usize;

    let v = |x: i32, y: i32| -> u16 {
        // prevent pixel out of bounds
        parent.value_i32(x.clamp(0, w - 1), y.clamp(0, h - 1)) as u16
    };

    for y in 0..h_half {
        let y2 = 2 * y;
        for x in 0..w_half {
            let x2 = 2 * x;
            // 3x3 binomial kernel
            let value = (4 * v(x2, y2)
                + 2 * (v(x2 + 1, y2) + v(x2 - 1, y2) + v(x2, y2 + 1) + v(x2, y2 - 1))
                + (v(x2 + 1, y2 + 1) + v(x2 - 1, y2 - 1) + v(x2 - 1, y2 + 1) + v(x2 + 1, y2 - 1))
                + 8)
                / 16;
            child.data.push(value as u8);
        }
    }
    Ok(())
}
