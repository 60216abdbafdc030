//! Box-aware image preprocessing.
//!
//! Images are `(H, W, 3)` RGB arrays and boxes are `(K, 4)` arrays of relative
//! `(ymin, xmin, ymax, xmax)` rows. Every transform keeps the boxes relative and in corner form.

pub mod color;
pub mod geometry;

use ndarray::{Array1, Array2, Array3, ArrayView2, ArrayView3};
use rand::Rng;

use crate::{
    config::TextboxParams,
    error::{Error, Result},
};

pub use color::{ColorOrdering, distort_color, random_distort_color};
pub use geometry::{
    bboxes_crop_or_pad, flip_left_right, random_flip_left_right, resize_bilinear,
    resize_with_crop_or_pad,
};

/// Per-channel RGB means of the training images.
pub const DEFAULT_MEANS: [f32; 3] = [123.0, 117.0, 104.0];

/// Subtract `means` from every channel.
pub fn whiten(image: ArrayView3<f32>, means: &[f32]) -> Result<Array3<f32>> {
    Ok(&image - &channel_means(image, means)?)
}

/// Add `means` back to every channel.
pub fn unwhiten(image: ArrayView3<f32>, means: &[f32]) -> Result<Array3<f32>> {
    Ok(&image + &channel_means(image, means)?)
}

fn channel_means(image: ArrayView3<f32>, means: &[f32]) -> Result<Array1<f32>> {
    let (height, width, channels) = image.dim();
    if channels != means.len() {
        return Err(Error::Shape {
            what: "image",
            expected: vec![height, width, means.len()],
            found: image.shape().to_vec(),
        });
    }

    Ok(Array1::from_vec(means.to_vec()))
}

/// The transforms applied to an image and its boxes before they are fed to the network.
#[derive(Debug, Clone, PartialEq)]
pub struct Preprocessor {
    /// `(height, width)` of the network input.
    pub out_shape: (usize, usize),
    pub means: [f32; 3],
    /// Only distort brightness and saturation.
    pub fast_mode: bool,
}

impl Preprocessor {
    #[must_use]
    pub fn new(out_shape: (usize, usize)) -> Self {
        Self {
            out_shape,
            means: DEFAULT_MEANS,
            fast_mode: true,
        }
    }

    /// A preprocessor producing inputs of the configured image shape.
    #[must_use]
    pub fn from_params(params: &TextboxParams) -> Self {
        Self::new(params.image_shape)
    }

    /// Training transforms: resize, random flip, random color distortion and whitening.
    ///
    /// `image` holds values in `[0, 255]`.
    pub fn train<R: Rng>(
        &self,
        rng: &mut R,
        image: ArrayView3<f32>,
        boxes: ArrayView2<f32>,
    ) -> Result<(Array3<f32>, Array2<f32>)> {
        let image = resize_bilinear(image, self.out_shape)? / 255.0;
        let (image, boxes) = random_flip_left_right(rng, image.view(), boxes);
        let image = random_distort_color(rng, image.view(), self.fast_mode) * 255.0;

        Ok((whiten(image.view(), &self.means)?, boxes))
    }

    /// Evaluation transforms: whitening and resizing only.
    pub fn eval(
        &self,
        image: ArrayView3<f32>,
        boxes: ArrayView2<f32>,
    ) -> Result<(Array3<f32>, Array2<f32>)> {
        let image = whiten(image, &self.means)?;
        let image = resize_bilinear(image.view(), self.out_shape)?;

        Ok((image, boxes.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::{SeedableRng, rngs::StdRng};

    #[test]
    fn whiten_round_trip() {
        let image = Array3::from_elem((2, 2, 3), 128.0);

        let whitened = whiten(image.view(), &DEFAULT_MEANS).unwrap();
        assert_eq!(whitened[[1, 1, 0]], 5.0);
        assert_eq!(whitened[[0, 1, 2]], 24.0);

        let restored = unwhiten(whitened.view(), &DEFAULT_MEANS).unwrap();
        assert_eq!(restored, image);
    }

    #[test]
    fn channel_mismatch_is_rejected() {
        let image = Array3::<f32>::zeros((2, 2, 4));

        assert!(matches!(
            whiten(image.view(), &DEFAULT_MEANS),
            Err(Error::Shape { what: "image", .. })
        ));
    }

    #[test]
    fn train_produces_network_input() {
        let mut rng = StdRng::seed_from_u64(1);
        let image = Array3::from_elem((60, 40, 3), 100.0);
        let boxes = array![[0.1, 0.2, 0.5, 0.6]];

        let preprocessor = Preprocessor::new((30, 30));
        let (input, out_boxes) = preprocessor
            .train(&mut rng, image.view(), boxes.view())
            .unwrap();

        assert_eq!(input.dim(), (30, 30, 3));
        assert_eq!(out_boxes.dim(), (1, 4));
        // boxes are either untouched or mirrored
        assert!(out_boxes == boxes || (out_boxes[[0, 1]] - 0.4).abs() < 1e-6);
        // whitened values stay within the shifted [0, 255] range
        assert!(input.iter().all(|v| (-123.0..=151.0).contains(v)));
    }

    #[test]
    fn eval_keeps_boxes() {
        let image = Array3::from_elem((10, 10, 3), 123.0);
        let boxes = array![[0.1, 0.2, 0.5, 0.6]];

        let (input, out_boxes) = Preprocessor::new((5, 5))
            .eval(image.view(), boxes.view())
            .unwrap();

        assert_eq!(input.dim(), (5, 5, 3));
        assert_eq!(input[[0, 0, 0]], 0.0);
        assert_eq!(out_boxes, boxes);
    }
}
