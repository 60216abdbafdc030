//! Photometric distortions of RGB images with values in `[0, 1]`.

use ndarray::{Array3, ArrayView3, Axis, Zip};
use rand::Rng;

/// Maximum brightness change.
pub const MAX_BRIGHTNESS_DELTA: f32 = 32.0 / 255.0;
/// Range of the saturation and contrast factors.
pub const FACTOR_RANGE: (f32, f32) = (0.5, 1.5);
/// Maximum hue rotation, as a fraction of a full turn.
pub const MAX_HUE_DELTA: f32 = 0.2;

/// A single photometric distortion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorOp {
    Brightness,
    Saturation,
    Hue,
    Contrast,
}

impl ColorOp {
    /// Apply this distortion with a randomly drawn strength.
    pub fn apply_random<R: Rng>(self, rng: &mut R, image: ArrayView3<f32>) -> Array3<f32> {
        let (lower, upper) = FACTOR_RANGE;

        match self {
            ColorOp::Brightness => adjust_brightness(
                image,
                rng.random_range(-MAX_BRIGHTNESS_DELTA..=MAX_BRIGHTNESS_DELTA),
            ),
            ColorOp::Saturation => adjust_saturation(image, rng.random_range(lower..=upper)),
            ColorOp::Hue => adjust_hue(image, rng.random_range(-MAX_HUE_DELTA..=MAX_HUE_DELTA)),
            ColorOp::Contrast => adjust_contrast(image, rng.random_range(lower..=upper)),
        }
    }
}

/// The fixed orders in which the distortions can be applied.
///
/// The distortions do not commute, so every training image draws one of these orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorOrdering {
    BrightnessFirst,
    SaturationFirst,
    ContrastFirst,
    HueFirst,
}

impl ColorOrdering {
    pub const ALL: [ColorOrdering; 4] = [
        ColorOrdering::BrightnessFirst,
        ColorOrdering::SaturationFirst,
        ColorOrdering::ContrastFirst,
        ColorOrdering::HueFirst,
    ];

    /// Draw one of the orderings uniformly.
    pub fn random<R: Rng>(rng: &mut R) -> Self {
        Self::ALL[rng.random_range(0..Self::ALL.len())]
    }

    /// The distortions of this ordering.
    ///
    /// In fast mode, only brightness and saturation are used.
    #[must_use]
    pub fn ops(self, fast_mode: bool) -> &'static [ColorOp] {
        use ColorOp::{Brightness, Contrast, Hue, Saturation};

        match (self, fast_mode) {
            (ColorOrdering::BrightnessFirst, true) => &[Brightness, Saturation],
            (_, true) => &[Saturation, Brightness],
            (ColorOrdering::BrightnessFirst, false) => &[Brightness, Saturation, Hue, Contrast],
            (ColorOrdering::SaturationFirst, false) => &[Saturation, Brightness, Contrast, Hue],
            (ColorOrdering::ContrastFirst, false) => &[Contrast, Hue, Brightness, Saturation],
            (ColorOrdering::HueFirst, false) => &[Hue, Saturation, Contrast, Brightness],
        }
    }
}

/// Apply the distortions of `ordering` and clip the result to `[0, 1]`.
pub fn distort_color<R: Rng>(
    rng: &mut R,
    image: ArrayView3<f32>,
    ordering: ColorOrdering,
    fast_mode: bool,
) -> Array3<f32> {
    let mut image = image.to_owned();
    for op in ordering.ops(fast_mode) {
        image = op.apply_random(rng, image.view());
    }

    image.mapv_inplace(|v| v.clamp(0.0, 1.0));
    image
}

/// Like [`distort_color`], with a uniformly drawn ordering.
pub fn random_distort_color<R: Rng>(
    rng: &mut R,
    image: ArrayView3<f32>,
    fast_mode: bool,
) -> Array3<f32> {
    let ordering = ColorOrdering::random(rng);
    tracing::trace!(?ordering, fast_mode, "distorting colors");

    distort_color(rng, image, ordering, fast_mode)
}

#[must_use]
pub fn adjust_brightness(image: ArrayView3<f32>, delta: f32) -> Array3<f32> {
    image.mapv(|v| v + delta)
}

/// Scale the distance of every value to its channel mean by `factor`.
#[must_use]
pub fn adjust_contrast(image: ArrayView3<f32>, factor: f32) -> Array3<f32> {
    let Some(means) = image
        .mean_axis(Axis(0))
        .and_then(|rows| rows.mean_axis(Axis(0)))
    else {
        return image.to_owned();
    };

    let mut adjusted = image.to_owned();
    for mut pixel in adjusted.lanes_mut(Axis(2)) {
        Zip::from(&mut pixel)
            .and(&means)
            .for_each(|v, &mean| *v = (*v - mean) * factor + mean);
    }

    adjusted
}

/// Scale the saturation of every pixel by `factor`.
#[must_use]
pub fn adjust_saturation(image: ArrayView3<f32>, factor: f32) -> Array3<f32> {
    map_hsv(image, |h, s, v| (h, (s * factor).clamp(0.0, 1.0), v))
}

/// Rotate the hue of every pixel by `delta` turns.
#[must_use]
pub fn adjust_hue(image: ArrayView3<f32>, delta: f32) -> Array3<f32> {
    map_hsv(image, |h, s, v| ((h + delta).rem_euclid(1.0), s, v))
}

fn map_hsv(image: ArrayView3<f32>, f: impl Fn(f32, f32, f32) -> (f32, f32, f32)) -> Array3<f32> {
    let mut adjusted = image.to_owned();
    for mut pixel in adjusted.lanes_mut(Axis(2)) {
        if pixel.len() < 3 {
            continue;
        }

        let (h, s, v) = rgb_to_hsv(pixel[0], pixel[1], pixel[2]);
        let (h, s, v) = f(h, s, v);
        let (r, g, b) = hsv_to_rgb(h, s, v);

        pixel[0] = r;
        pixel[1] = g;
        pixel[2] = b;
    }

    adjusted
}

/// Convert an RGB pixel to hue, saturation and value, all in `[0, 1]`.
#[must_use]
pub fn rgb_to_hsv(r: f32, g: f32, b: f32) -> (f32, f32, f32) {
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let range = max - min;

    let s = if max > 0.0 { range / max } else { 0.0 };
    if range <= 0.0 {
        return (0.0, s, max);
    }

    let h = if max == r {
        (g - b) / range
    } else if max == g {
        2.0 + (b - r) / range
    } else {
        4.0 + (r - g) / range
    };

    ((h / 6.0).rem_euclid(1.0), s, max)
}

/// Convert hue, saturation and value in `[0, 1]` back to an RGB pixel.
#[must_use]
pub fn hsv_to_rgb(h: f32, s: f32, v: f32) -> (f32, f32, f32) {
    let h = h.rem_euclid(1.0) * 6.0;
    let c = v * s;
    let x = c * (1.0 - ((h % 2.0) - 1.0).abs());
    let m = v - c;

    let (r, g, b) = match h.floor() as u32 {
        0 => (c, x, 0.0),
        1 => (x, c, 0.0),
        2 => (0.0, c, x),
        3 => (0.0, x, c),
        4 => (x, 0.0, c),
        _ => (c, 0.0, x),
    };

    (r + m, g + m, b + m)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::{SeedableRng, rngs::StdRng};

    fn close(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-5
    }

    fn image() -> Array3<f32> {
        array![
            [[0.2, 0.4, 0.6], [0.9, 0.1, 0.3]],
            [[0.5, 0.5, 0.5], [0.0, 0.8, 0.2]]
        ]
    }

    #[test]
    fn hsv_round_trip() {
        for pixel in image().lanes(Axis(2)) {
            let (h, s, v) = rgb_to_hsv(pixel[0], pixel[1], pixel[2]);
            let (r, g, b) = hsv_to_rgb(h, s, v);

            assert!(close(r, pixel[0]) && close(g, pixel[1]) && close(b, pixel[2]));
        }
    }

    #[test]
    fn known_hsv_values() {
        assert_eq!(rgb_to_hsv(1.0, 0.0, 0.0), (0.0, 1.0, 1.0));

        let (h, s, v) = rgb_to_hsv(0.0, 0.0, 1.0);
        assert!(close(h, 2.0 / 3.0) && close(s, 1.0) && close(v, 1.0));

        assert_eq!(rgb_to_hsv(0.5, 0.5, 0.5), (0.0, 0.0, 0.5));
    }

    #[test]
    fn neutral_adjustments_are_identity() {
        let image = image();

        for adjusted in [
            adjust_brightness(image.view(), 0.0),
            adjust_contrast(image.view(), 1.0),
            adjust_saturation(image.view(), 1.0),
            adjust_hue(image.view(), 0.0),
        ] {
            for (a, b) in adjusted.iter().zip(image.iter()) {
                assert!(close(*a, *b));
            }
        }
    }

    #[test]
    fn zero_contrast_gives_channel_means() {
        let adjusted = adjust_contrast(image().view(), 0.0);

        assert!(close(adjusted[[0, 0, 0]], 0.4));
        assert!(close(adjusted[[1, 1, 1]], 0.45));
    }

    #[test]
    fn zero_saturation_is_gray() {
        let adjusted = adjust_saturation(image().view(), 0.0);

        for pixel in adjusted.lanes(Axis(2)) {
            assert!(close(pixel[0], pixel[1]) && close(pixel[1], pixel[2]));
        }
    }

    #[test]
    fn full_hue_turn_is_identity() {
        let image = image();
        let adjusted = adjust_hue(image.view(), 1.0);

        for (a, b) in adjusted.iter().zip(image.iter()) {
            assert!(close(*a, *b));
        }
    }

    #[test]
    fn fast_mode_uses_two_ops() {
        for ordering in ColorOrdering::ALL {
            assert_eq!(ordering.ops(true).len(), 2);
            assert_eq!(ordering.ops(false).len(), 4);
        }
    }

    #[test]
    fn distortion_is_clipped_and_seeded() {
        let image = image();

        let mut rng = StdRng::seed_from_u64(5);
        let a = random_distort_color(&mut rng, image.view(), false);
        let mut rng = StdRng::seed_from_u64(5);
        let b = random_distort_color(&mut rng, image.view(), false);

        assert_eq!(a, b);
        assert!(a.iter().all(|v| (0.0..=1.0).contains(v)));
    }
}
