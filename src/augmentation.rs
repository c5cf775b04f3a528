//! Random geometric augmentation for training images.
//!
//! Every draw produces one [`AffineTransform`] (rotation, shift, shear and
//! zoom composed around the image centre, plus an optional horizontal flip)
//! which is then resampled bilinearly. Coordinates that land outside the
//! source image are resolved by the configured [`FillMode`].

use burn::config::Config;
use image::{Rgb, RgbImage};
use rand::Rng;

/// How samples outside the source image are filled.
#[derive(Config, Debug, PartialEq, Eq)]
pub enum FillMode {
    /// Repeat the closest edge pixel (`aaaa|abcd|dddd`).
    Nearest,
    /// Use the constant `cval` (`kkkk|abcd|kkkk`).
    Constant,
    /// Mirror around the edge (`dcba|abcd|dcba`).
    Reflect,
    /// Tile the image (`abcd|abcd|abcd`).
    Wrap,
}

#[derive(Config, Debug)]
pub struct AugmentationConfig {
    /// Maximum rotation in degrees, drawn from `[-r, r]`.
    #[config(default = 30.0)]
    pub rotation_range: f64,
    /// Maximum horizontal shift as a fraction of the width.
    #[config(default = 0.2)]
    pub width_shift_range: f64,
    /// Maximum vertical shift as a fraction of the height.
    #[config(default = 0.2)]
    pub height_shift_range: f64,
    /// Shear intensity, counter-clockwise angle in degrees.
    #[config(default = 0.2)]
    pub shear_range: f64,
    /// Zoom factors are drawn per axis from `[1 - z, 1 + z]`.
    #[config(default = 0.3)]
    pub zoom_range: f64,
    #[config(default = true)]
    pub horizontal_flip: bool,
    #[config(default = "FillMode::Nearest")]
    pub fill_mode: FillMode,
    /// Fill value for [`FillMode::Constant`], in pixel units.
    #[config(default = 0.0)]
    pub cval: f64,
}

/// Parameters of one random draw. Angles are in radians, shifts in pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct AffineTransform {
    pub theta: f64,
    pub shift_rows: f64,
    pub shift_cols: f64,
    pub shear: f64,
    pub zoom_rows: f64,
    pub zoom_cols: f64,
    pub flip_horizontal: bool,
}

type Matrix = [[f64; 3]; 3];

fn matmul(a: &Matrix, b: &Matrix) -> Matrix {
    let mut out = [[0.0; 3]; 3];
    for (i, row) in out.iter_mut().enumerate() {
        for (j, cell) in row.iter_mut().enumerate() {
            *cell = (0..3).map(|k| a[i][k] * b[k][j]).sum();
        }
    }
    out
}

impl AffineTransform {
    pub fn identity() -> Self {
        Self {
            theta: 0.0,
            shift_rows: 0.0,
            shift_cols: 0.0,
            shear: 0.0,
            zoom_rows: 1.0,
            zoom_cols: 1.0,
            flip_horizontal: false,
        }
    }

    /// Maps output `(row, col, 1)` coordinates to input coordinates.
    fn matrix(&self, height: u32, width: u32) -> Matrix {
        let (sin, cos) = self.theta.sin_cos();
        let rotation = [[cos, -sin, 0.0], [sin, cos, 0.0], [0.0, 0.0, 1.0]];
        let shift = [
            [1.0, 0.0, self.shift_rows],
            [0.0, 1.0, self.shift_cols],
            [0.0, 0.0, 1.0],
        ];
        let shear = [
            [1.0, -self.shear.sin(), 0.0],
            [0.0, self.shear.cos(), 0.0],
            [0.0, 0.0, 1.0],
        ];
        let zoom = [
            [self.zoom_rows, 0.0, 0.0],
            [0.0, self.zoom_cols, 0.0],
            [0.0, 0.0, 1.0],
        ];

        let transform = matmul(&matmul(&matmul(&rotation, &shift), &shear), &zoom);

        let center_row = height as f64 / 2.0 - 0.5;
        let center_col = width as f64 / 2.0 - 0.5;
        let offset = [
            [1.0, 0.0, center_row],
            [0.0, 1.0, center_col],
            [0.0, 0.0, 1.0],
        ];
        let reset = [
            [1.0, 0.0, -center_row],
            [0.0, 1.0, -center_col],
            [0.0, 0.0, 1.0],
        ];

        matmul(&matmul(&offset, &transform), &reset)
    }

    pub fn apply(&self, image: &RgbImage, fill_mode: &FillMode, cval: f64) -> RgbImage {
        let (width, height) = image.dimensions();
        let m = self.matrix(height, width);

        let mut output = RgbImage::from_fn(width, height, |col, row| {
            let (r, c) = (row as f64, col as f64);
            let src_row = m[0][0] * r + m[0][1] * c + m[0][2];
            let src_col = m[1][0] * r + m[1][1] * c + m[1][2];
            sample_bilinear(image, src_row, src_col, fill_mode, cval)
        });

        if self.flip_horizontal {
            image::imageops::flip_horizontal_in_place(&mut output);
        }
        output
    }
}

/// Resolves a possibly out-of-range index; `None` means "use cval".
fn resolve_index(index: i64, len: u32, fill_mode: &FillMode) -> Option<u32> {
    let len = len as i64;
    if (0..len).contains(&index) {
        return Some(index as u32);
    }
    match fill_mode {
        FillMode::Constant => None,
        FillMode::Nearest => Some(index.clamp(0, len - 1) as u32),
        FillMode::Wrap => Some(index.rem_euclid(len) as u32),
        FillMode::Reflect => {
            let period = 2 * len;
            let folded = index.rem_euclid(period);
            let reflected = if folded < len { folded } else { period - 1 - folded };
            Some(reflected as u32)
        }
    }
}

fn sample_bilinear(
    image: &RgbImage,
    row: f64,
    col: f64,
    fill_mode: &FillMode,
    cval: f64,
) -> Rgb<u8> {
    let (width, height) = image.dimensions();

    let row0 = row.floor();
    let col0 = col.floor();
    let dr = row - row0;
    let dc = col - col0;

    let mut acc = [0.0f64; 3];
    for (offset_r, weight_r) in [(0i64, 1.0 - dr), (1, dr)] {
        for (offset_c, weight_c) in [(0i64, 1.0 - dc), (1, dc)] {
            let weight = weight_r * weight_c;
            if weight == 0.0 {
                continue;
            }
            let r = resolve_index(row0 as i64 + offset_r, height, fill_mode);
            let c = resolve_index(col0 as i64 + offset_c, width, fill_mode);
            match (r, c) {
                (Some(r), Some(c)) => {
                    let pixel = image.get_pixel(c, r);
                    for (channel, value) in acc.iter_mut().enumerate() {
                        *value += weight * pixel[channel] as f64;
                    }
                }
                _ => acc.iter_mut().for_each(|value| *value += weight * cval),
            }
        }
    }

    Rgb(acc.map(|value| value.round().clamp(0.0, 255.0) as u8))
}

/// Draws random transforms according to an [`AugmentationConfig`].
#[derive(Debug, Clone)]
pub struct Augmenter {
    config: AugmentationConfig,
}

impl Augmenter {
    pub fn new(config: AugmentationConfig) -> Self {
        Self { config }
    }

    pub fn random_transform<R: Rng>(
        &self,
        height: u32,
        width: u32,
        rng: &mut R,
    ) -> AffineTransform {
        let config = &self.config;
        let symmetric = |rng: &mut R, range: f64| {
            if range > 0.0 {
                rng.gen_range(-range..=range)
            } else {
                0.0
            }
        };

        let theta = symmetric(rng, config.rotation_range).to_radians();
        let shift_rows = symmetric(rng, config.height_shift_range) * height as f64;
        let shift_cols = symmetric(rng, config.width_shift_range) * width as f64;
        let shear = symmetric(rng, config.shear_range).to_radians();

        let (zoom_rows, zoom_cols) = if config.zoom_range > 0.0 {
            let low = 1.0 - config.zoom_range;
            let high = 1.0 + config.zoom_range;
            (rng.gen_range(low..=high), rng.gen_range(low..=high))
        } else {
            (1.0, 1.0)
        };

        let flip_horizontal = config.horizontal_flip && rng.gen_bool(0.5);

        AffineTransform {
            theta,
            shift_rows,
            shift_cols,
            shear,
            zoom_rows,
            zoom_cols,
            flip_horizontal,
        }
    }

    pub fn augment<R: Rng>(&self, image: &RgbImage, rng: &mut R) -> RgbImage {
        let (width, height) = image.dimensions();
        let transform = self.random_transform(height, width, rng);
        transform.apply(image, &self.config.fill_mode, self.config.cval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn gradient_image(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x * 10) as u8, (y * 10) as u8, ((x + y) * 5) as u8])
        })
    }

    #[test]
    fn identity_transform_keeps_pixels() {
        let image = gradient_image(8, 6);
        let output = AffineTransform::identity().apply(&image, &FillMode::Nearest, 0.0);
        assert_eq!(output, image);
    }

    #[test]
    fn flip_mirrors_columns() {
        let image = gradient_image(5, 3);
        let transform = AffineTransform {
            flip_horizontal: true,
            ..AffineTransform::identity()
        };
        let output = transform.apply(&image, &FillMode::Nearest, 0.0);
        for y in 0..3 {
            for x in 0..5 {
                assert_eq!(output.get_pixel(x, y), image.get_pixel(4 - x, y));
            }
        }
    }

    #[test]
    fn shift_fills_borders() {
        let image = gradient_image(6, 4);
        // Sampling two columns to the right moves content left.
        let transform = AffineTransform {
            shift_cols: 2.0,
            ..AffineTransform::identity()
        };

        let nearest = transform.apply(&image, &FillMode::Nearest, 0.0);
        assert_eq!(nearest.get_pixel(0, 1), image.get_pixel(2, 1));
        assert_eq!(nearest.get_pixel(5, 1), image.get_pixel(5, 1));
        assert_eq!(nearest.get_pixel(4, 1), image.get_pixel(5, 1));

        let constant = transform.apply(&image, &FillMode::Constant, 7.0);
        assert_eq!(constant.get_pixel(5, 1), &Rgb([7, 7, 7]));

        let wrap = transform.apply(&image, &FillMode::Wrap, 0.0);
        assert_eq!(wrap.get_pixel(5, 1), image.get_pixel(1, 1));

        let reflect = transform.apply(&image, &FillMode::Reflect, 0.0);
        assert_eq!(reflect.get_pixel(5, 1), image.get_pixel(4, 1));
    }

    #[test]
    fn random_draws_stay_in_range() {
        let augmenter = Augmenter::new(AugmentationConfig::new());
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let t = augmenter.random_transform(224, 224, &mut rng);
            assert!(t.theta.abs() <= 30f64.to_radians() + 1e-12);
            assert!(t.shift_rows.abs() <= 0.2 * 224.0 + 1e-9);
            assert!(t.shift_cols.abs() <= 0.2 * 224.0 + 1e-9);
            assert!(t.shear.abs() <= 0.2f64.to_radians() + 1e-12);
            assert!((0.7..=1.3).contains(&t.zoom_rows));
            assert!((0.7..=1.3).contains(&t.zoom_cols));
        }
    }

    #[test]
    fn disabled_augmentation_is_identity() {
        let config = AugmentationConfig::new()
            .with_rotation_range(0.0)
            .with_width_shift_range(0.0)
            .with_height_shift_range(0.0)
            .with_shear_range(0.0)
            .with_zoom_range(0.0)
            .with_horizontal_flip(false);
        let augmenter = Augmenter::new(config);
        let image = gradient_image(10, 10);
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(augmenter.augment(&image, &mut rng), image);
    }

    #[test]
    fn augment_preserves_dimensions() {
        let augmenter = Augmenter::new(AugmentationConfig::new());
        let image = gradient_image(32, 24);
        let mut rng = StdRng::seed_from_u64(3);
        let output = augmenter.augment(&image, &mut rng);
        assert_eq!(output.dimensions(), (32, 24));
    }
}
