use anyhow::{ensure, Result};
use rand::{Rng, SeedableRng};

use crate::bbox::BoundingBox;
use crate::image::Image;
use crate::my_types::TldRng;

/// A textured square sliding over a weaker textured background, bouncing
/// off the frame borders. Deterministic for a given seed.
#[derive(Clone, Debug)]
pub struct SyntheticScene {
    pub width: usize,
    pub height: usize,
    background: Image,
    object: Image,
    start: (i32, i32),
    velocity: (i32, i32),
}

impl SyntheticScene {
    pub fn new(width: usize, height: usize, object_size: usize, seed: u64) -> Result<SyntheticScene> {
        ensure!(
            object_size > 0 && object_size <= width.min(height),
            "object of size {} does not fit a {} x {} frame",
            object_size,
            width,
            height
        );
        let mut rng = TldRng::seed_from_u64(seed);
        let background = texture(width, height, 12., (18., 40.), &mut rng);
        let object = texture(object_size, object_size, 45., (7., 16.), &mut rng);
        Ok(SyntheticScene {
            width,
            height,
            background,
            object,
            start: (
                (width - object_size) as i32 / 2,
                (height - object_size) as i32 / 2,
            ),
            velocity: (1, 1),
        })
    }

    /// Replace the start corner and the per-frame displacement of the object.
    pub fn with_motion(mut self, start: (i32, i32), velocity: (i32, i32)) -> SyntheticScene {
        self.start = start;
        self.velocity = velocity;
        self
    }

    pub fn object_size(&self) -> usize {
        self.object.width
    }

    fn position(&self, index: usize) -> (i32, i32) {
        let bounce = |start: i32, velocity: i32, range: i32| -> i32 {
            if range <= 0 {
                return 0;
            }
            let p = (start + index as i32 * velocity).rem_euclid(2 * range);
            if p > range {
                2 * range - p
            } else {
                p
            }
        };
        let size = self.object_size() as i32;
        (
            bounce(self.start.0, self.velocity.0, self.width as i32 - size),
            bounce(self.start.1, self.velocity.1, self.height as i32 - size),
        )
    }

    /// Ground truth box of the object in frame `index`
    pub fn bbox(&self, index: usize) -> BoundingBox {
        let (x, y) = self.position(index);
        let size = self.object_size() as f64;
        BoundingBox::new(x as f64, y as f64, size, size)
    }

    pub fn frame(&self, index: usize) -> Image {
        let (x, y) = self.position(index);
        let mut frame = self.background.clone();
        frame.set_sub_image(x, y, &self.object);
        frame
    }
}

/// Sum of four plane waves with random direction, phase and wavelength.
fn texture(
    width: usize,
    height: usize,
    amplitude: f64,
    wavelengths: (f64, f64),
    rng: &mut TldRng,
) -> Image {
    let waves: Vec<(f64, f64, f64)> = (0..4)
        .map(|_| {
            let angle = rng.gen_range(0. ..std::f64::consts::PI);
            let k = 2. * std::f64::consts::PI / rng.gen_range(wavelengths.0..wavelengths.1);
            (k * angle.cos(), k * angle.sin(), rng.gen_range(0. ..6.3))
        })
        .collect();
    let mut image = Image::new(width, height, 0);
    for y in 0..height {
        for x in 0..width {
            let v: f64 = waves
                .iter()
                .map(|(kx, ky, phase)| (kx * x as f64 + ky * y as f64 + phase).sin())
                .sum();
            image.set_value(x, y, (128. + amplitude * v).round().clamp(0., 255.) as u8);
        }
    }
    image
}
