use nalgebra as na;

use crate::config::Config;
use crate::frame::PyramidFrame;
use crate::image::*;
use crate::my_types::*;

/// Pyramidal Lucas-Kanade point tracker.
pub struct OpticalFlow {
    lk_iters: usize,
    lk_levels: usize,
    lk_win_size: usize,
    lk_term: f64,
    lk_min_eig: f64,
    ix: Matrixd,
    iy: Matrixd,
    it: Matrixd,
    grid: Matrixd,
}

impl OpticalFlow {
    pub fn new(config: &Config) -> OpticalFlow {
        let lk_win_size = config.lk_win_size;
        OpticalFlow {
            lk_iters: config.lk_max_iterations,
            lk_levels: config.max_pyr_level,
            lk_win_size,
            lk_term: config.lk_epsilon,
            lk_min_eig: config.lk_min_eigenvalue,
            ix: na::DMatrix::zeros(lk_win_size, lk_win_size),
            iy: na::DMatrix::zeros(lk_win_size, lk_win_size),
            it: na::DMatrix::zeros(lk_win_size, lk_win_size),
            grid: na::DMatrix::zeros(lk_win_size, lk_win_size),
        }
    }

    /// Track `points0` from `pyramid_frame0` into `pyramid_frame1`.
    /// Lost points are `None`.
    pub fn process(
        &mut self,
        pyramid_frame0: &PyramidFrame,
        pyramid_frame1: &PyramidFrame,
        points0: &[Vector2d],
    ) -> Vec<Option<Vector2d>> {
        points0
            .iter()
            .map(|&point0| self.process_feature(pyramid_frame0, pyramid_frame1, point0))
            .collect()
    }

    /// ref http://robots.stanford.edu/cs223b04/algo_tracking.pdf
    fn process_feature(
        &mut self,
        pyramid_frame0: &PyramidFrame,
        pyramid_frame1: &PyramidFrame,
        point0: Vector2d,
    ) -> Option<Vector2d> {
        let lk_term2 = self.lk_term.powi(2);
        let r = (self.lk_win_size / 2) as i32;
        let levels = self
            .lk_levels
            .min(pyramid_frame0.level_count() - 1)
            .min(pyramid_frame1.level_count() - 1);

        let mut g = Vector2d::zeros();
        let mut d = Vector2d::zeros();
        for level in (0..levels + 1).rev() {
            let level0 = pyramid_frame0.get_image_at_level(level);
            let level1 = pyramid_frame1.get_image_at_level(level);
            let u = point0 / u32::pow(2, level as u32) as f64;
            // compute the derivative
            scharr(level0, u, r, &mut self.ix, &mut self.iy, &mut self.grid);
            let gradient = spatial_gradient(&self.ix, &self.iy);
            let area = (self.ix.nrows() * self.ix.ncols()) as f64;
            let inv_gradient = if min_eigenvalue(&(gradient / area)) < self.lk_min_eig {
                None
            } else {
                gradient.try_inverse()
            };
            let inv_gradient = match inv_gradient {
                Some(inv_gradient) => inv_gradient,
                // too little texture: keep the guess on coarse levels, give up at full resolution
                None if level > 0 => {
                    g *= 2.;
                    continue;
                }
                None => return None,
            };

            let mut nu = Vector2d::zeros();
            for _ in 0..self.lk_iters {
                image_difference(r, &self.grid, &mut self.it, level1, u + g + nu);
                let eta = flow_vector(&inv_gradient, &self.ix, &self.iy, &self.it);
                nu += eta;
                if eta.norm_squared() < lk_term2 {
                    break;
                }
            }

            d = nu;
            if level > 0 {
                g = 2. * (g + d)
            }
        }

        let point1 = point0 + g + d;
        let image1 = &pyramid_frame1.image;
        if !point1.iter().all(|c| c.is_finite())
            || point1[0] < 0.
            || point1[1] < 0.
            || point1[0] > (image1.width - 1) as f64
            || point1[1] > (image1.height - 1) as f64
        {
            return None;
        }
        Some(point1)
    }
}

/// Smaller eigenvalue of a symmetric 2x2 matrix
fn min_eigenvalue(m: &Matrix2d) -> f64 {
    let half_trace = 0.5 * (m[(0, 0)] + m[(1, 1)]);
    let half_diff = 0.5 * (m[(0, 0)] - m[(1, 1)]);
    half_trace - (half_diff * half_diff + m[(0, 1)] * m[(1, 0)]).sqrt()
}

fn flow_vector(inv_gradient: &Matrix2d, ix: &Matrixd, iy: &Matrixd, it: &Matrixd) -> Vector2d {
    let mut b = Vector2d::zeros();

    for y in 0..iy.nrows() {
        for x in 0..ix.ncols() {
            b[0] += it[(y, x)] * ix[(y, x)];
            b[1] += it[(y, x)] * iy[(y, x)];
        }
    }

    inv_gradient * b
}

/// Template minus warped window, template taken from the inner part of the padded grid
fn image_difference(r: i32, i0: &Matrixd, it: &mut Matrixd, level: &Image, center: Vector2d) {
    fill_grid(level, center, r, it);
    *it *= -1.;
    *it += i0.view((1, 1), (it.nrows(), it.ncols()));
}

fn spatial_gradient(ix: &Matrixd, iy: &Matrixd) -> Matrix2d {
    assert_eq!(ix.nrows(), iy.nrows());
    assert_eq!(ix.ncols(), iy.ncols());

    let mut x2 = 0.;
    let mut y2 = 0.;
    let mut xy = 0.;

    for y in 0..iy.nrows() {
        for x in 0..ix.ncols() {
            x2 += ix[(y, x)] * ix[(y, x)];
            y2 += iy[(y, x)] * iy[(y, x)];
            xy += ix[(y, x)] * iy[(y, x)];
        }
    }

    Matrix2d::new(x2, xy, xy, y2)
}

/// ref https://theailearner.com/tag/scharr-operator/
fn scharr(
    level: &Image,
    center: Vector2d,
    r: i32,
    out_x: &mut Matrixd,
    out_y: &mut Matrixd,
    grid: &mut Matrixd,
) {
    fill_grid(level, center, r + 1, grid);

    *out_x = Matrixd::zeros(grid.nrows() - 2, grid.ncols() - 2);
    *out_y = Matrixd::zeros(grid.nrows() - 2, grid.ncols() - 2);
    for y in 1..(grid.nrows() - 1) {
        for x in 1..(grid.ncols() - 1) {
            out_x[(y - 1, x - 1)] =
                (10. * grid[(y, x + 1)] + 3. * grid[(y + 1, x + 1)] + 3. * grid[(y - 1, x + 1)]
                    - 10. * grid[(y, x - 1)]
                    - 3. * grid[(y + 1, x - 1)]
                    - 3. * grid[(y - 1, x - 1)])
                    / 32.;
            out_y[(y - 1, x - 1)] =
                (10. * grid[(y + 1, x)] + 3. * grid[(y + 1, x + 1)] + 3. * grid[(y + 1, x - 1)]
                    - 10. * grid[(y - 1, x)]
                    - 3. * grid[(y - 1, x + 1)]
                    - 3. * grid[(y - 1, x - 1)])
                    / 32.;
        }
    }
}

/// Sample the `(2r + 1)²` window around `center`; samples outside the level repeat the border.
fn fill_grid(level: &Image, center: Vector2d, r: i32, grid: &mut Matrixd) {
    let side = (2 * r + 1) as usize;
    if grid.nrows() != side || grid.ncols() != side {
        *grid = na::DMatrix::zeros(side, side);
    }

    for (y_ind, y) in (-r..=r).enumerate() {
        for (x_ind, x) in (-r..=r).enumerate() {
            grid[(y_ind, x_ind)] = bilinear(level, center + Vector2d::new(x as f64, y as f64));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_pyramid_frame(image: Image, lk_levels: usize) -> PyramidFrame {
        PyramidFrame::new(image, lk_levels).unwrap()
    }

    fn smooth_scene(width: usize, height: usize, shift: (f64, f64)) -> Image {
        let mut image = Image::new(width, height, 0);
        for y in 0..height {
            for x in 0..width {
                let u = x as f64 - shift.0;
                let v = y as f64 - shift.1;
                let value = 128. + 60. * (u / 5.).sin() + 50. * (v / 7.).cos() + 10. * ((u + v) / 3.).sin();
                image.set_value(x, y, value.round().clamp(0., 255.) as u8);
            }
        }
        image
    }

    #[test]
    fn test_flow() {
        let image_size: usize = 128;
        let mut image0 = Image::new(image_size, image_size, 0);
        let mut image1 = image0.clone();

        let patch = Image {
            data: vec![
                44, 44, 44, 44, 44, 44, 44, 44, 44, 44, 55, 55, 55, 55, 55, 55, 55, 44, 44, 55, 77,
                77, 77, 77, 77, 55, 44, 44, 55, 77, 88, 88, 88, 77, 55, 44, 44, 55, 77, 88, 99, 88,
                77, 55, 44, 44, 55, 77, 88, 88, 88, 77, 55, 44, 44, 55, 77, 77, 77, 77, 77, 55, 44,
                44, 55, 55, 55, 55, 55, 55, 55, 44, 44, 44, 44, 44, 44, 44, 44, 44, 44,
            ],
            width: 9,
            height: 9,
        };

        // Place the patch at different positions in the two images.
        let x: i32 = 60;
        let y: i32 = 60;
        let dx: i32 = -4;
        let dy: i32 = 3;
        image0.set_sub_image(x, y, &patch);
        image1.set_sub_image(x + dx, y + dy, &patch);

        let config = Config::default();
        let pyramid_frame0 = make_pyramid_frame(image0, config.max_pyr_level);
        let pyramid_frame1 = make_pyramid_frame(image1, config.max_pyr_level);

        // Place feature at center of the first patch.
        let r = (patch.width - 1) as i32 / 2;
        let point0 = Vector2d::new((x + r) as f64, (y + r) as f64);

        let mut flow = OpticalFlow::new(&config);
        let point1 = flow
            .process_feature(&pyramid_frame0, &pyramid_frame1, point0)
            .expect("patch centre should be tracked");
        let err = (point1 - point0) - Vector2d::new(dx as f64, dy as f64);
        assert!(err.norm() < 1.0, "optical flow err {}", err.norm());
    }

    #[test]
    fn test_flow_smooth_shift() {
        let config = Config::default();
        let frame0 = make_pyramid_frame(smooth_scene(128, 128, (0., 0.)), config.max_pyr_level);
        let frame1 = make_pyramid_frame(smooth_scene(128, 128, (3., -2.)), config.max_pyr_level);
        let points = vec![
            Vector2d::new(50., 50.),
            Vector2d::new(64., 70.),
            Vector2d::new(80., 45.5),
        ];
        let mut flow = OpticalFlow::new(&config);
        let tracked = flow.process(&frame0, &frame1, &points);
        for (p0, p1) in points.iter().zip(tracked.iter()) {
            let p1 = p1.expect("textured point should be tracked");
            let err = (p1 - p0) - Vector2d::new(3., -2.);
            assert!(err.norm() < 0.5, "optical flow err {}", err.norm());
        }
    }

    #[test]
    fn test_flow_identical_frames() {
        let config = Config::default();
        let frame0 = make_pyramid_frame(smooth_scene(64, 64, (0., 0.)), config.max_pyr_level);
        let frame1 = make_pyramid_frame(smooth_scene(64, 64, (0., 0.)), config.max_pyr_level);
        let points = vec![Vector2d::new(20.3, 31.7), Vector2d::new(40., 12.)];
        let mut flow = OpticalFlow::new(&config);
        for (p0, p1) in points.iter().zip(flow.process(&frame0, &frame1, &points)) {
            assert!((p1.unwrap() - p0).norm() < 1e-9);
        }
    }

    #[test]
    fn test_flow_flat_image_is_lost() {
        let config = Config::default();
        let frame0 = make_pyramid_frame(Image::new(64, 64, 90), config.max_pyr_level);
        let frame1 = make_pyramid_frame(Image::new(64, 64, 90), config.max_pyr_level);
        let mut flow = OpticalFlow::new(&config);
        let tracked = flow.process(&frame0, &frame1, &[Vector2d::new(30., 30.)]);
        assert_eq!(tracked, vec![None]);
    }

    #[test]
    fn test_min_eigenvalue() {
        let m = Matrix2d::new(2., 0., 0., 5.);
        assert!((min_eigenvalue(&m) - 2.).abs() < 1e-12);
        let m = Matrix2d::new(2., 1., 1., 2.);
        assert!((min_eigenvalue(&m) - 1.).abs() < 1e-12);
        let m = Matrix2d::new(4., 2., 2., 1.);
        assert!(min_eigenvalue(&m).abs() < 1e-12);
    }

    #[test]
    fn test_scharr() {
        let mut image = Image {
            data: vec![
                0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
            ],
            width: 5,
            height: 5,
        };

        let mut out_x = na::dmatrix!();
        let mut out_y = na::dmatrix!();
        let mut grid = na::dmatrix!();

        let center = Vector2d::new(2.0, 2.0);
        scharr(&image, center, 1, &mut out_x, &mut out_y, &mut grid);
        assert_eq!(out_x, na::DMatrix::zeros(3, 3));
        assert_eq!(out_y, na::DMatrix::zeros(3, 3));

        image.data = vec![
            0, 1, 2, 3, 4, 0, 1, 2, 3, 4, 0, 1, 2, 3, 4, 0, 1, 2, 3, 4, 0, 1, 2, 3, 4,
        ];
        scharr(&image, center, 1, &mut out_x, &mut out_y, &mut grid);
        assert_eq!(out_x, na::DMatrix::repeat(3, 3, 1.));
        assert_eq!(out_y, na::DMatrix::zeros(3, 3));

        image.data = vec![
            0, 1, 2, 3, 4, 1, 2, 3, 4, 5, 2, 3, 4, 5, 6, 3, 4, 5, 6, 7, 4, 5, 6, 7, 8,
        ];
        scharr(&image, center, 1, &mut out_x, &mut out_y, &mut grid);
        assert_eq!(out_x, na::DMatrix::repeat(3, 3, 1.));
        assert_eq!(out_y, na::DMatrix::repeat(3, 3, 1.));

        image.data = vec![
            0, 0, 5, 0, 0,
            0, 0, 5, 0, 0,
            0, 0, 5, 0, 0,
            0, 0, 5, 0, 0,
            0, 0, 5, 0, 0,
        ];
        scharr(&image, center, 1, &mut out_x, &mut out_y, &mut grid);
        let answer_x = na::dmatrix!(
            2.5, 0., -2.5;
            2.5, 0., -2.5;
            2.5, 0., -2.5;
        );
        assert_eq!(out_x, answer_x);
        assert_eq!(out_y, na::DMatrix::zeros(3, 3));
    }

    #[test]
    fn test_fill_grid_clamps_at_border() {
        let image = Image {
            data: vec![1, 2, 3, 4],
            width: 2,
            height: 2,
        };
        let mut grid = na::dmatrix!();
        fill_grid(&image, Vector2d::new(0., 0.), 1, &mut grid);
        let expected = na::dmatrix!(
            1., 1., 2.;
            1., 1., 2.;
            3., 3., 4.;
        );
        assert_eq!(grid, expected);
    }
}
