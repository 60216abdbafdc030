//! Layout of the per-layer outputs of the multibox heads.

use ndarray::{Array2, Array3, Array5, ArrayView3, Axis, concatenate};

use crate::{
    anchor::{Anchors, NUM_VARIANTS},
    config::NUM_CLASSES,
    error::{Error, Result},
};

/// Number of box coordinates regressed per anchor.
pub const NUM_COORDINATES: usize = 4;

/// The class logits and box offsets predicted for every anchor of one feature layer.
///
/// Both arrays are laid out as `(H, W, 2, R, C)`: the feature grid, the height variant, the
/// aspect ratio and finally the class or coordinate.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerPredictions {
    pub logits: Array5<f32>,
    pub localizations: Array5<f32>,
}

impl LayerPredictions {
    /// Wrap already shaped predictions, checking that both arrays describe the same anchors.
    pub fn new(logits: Array5<f32>, localizations: Array5<f32>) -> Result<Self> {
        let (h, w, variants, num_box, classes) = logits.dim();
        let expected = (h, w, NUM_VARIANTS, num_box, NUM_COORDINATES);

        if variants != NUM_VARIANTS || classes != NUM_CLASSES {
            return Err(Error::Shape {
                what: "logits",
                expected: vec![h, w, NUM_VARIANTS, num_box, NUM_CLASSES],
                found: logits.shape().to_vec(),
            });
        }

        if localizations.dim() != expected {
            return Err(Error::Shape {
                what: "localizations",
                expected: vec![h, w, NUM_VARIANTS, num_box, NUM_COORDINATES],
                found: localizations.shape().to_vec(),
            });
        }

        Ok(Self {
            logits,
            localizations,
        })
    }

    /// Reshape the channel-last outputs of the class and box heads.
    ///
    /// `cls` has `2 * num_box * 2` channels and `loc` has `2 * num_box * 4` channels.
    pub fn from_head_outputs(
        cls: ArrayView3<f32>,
        loc: ArrayView3<f32>,
        num_box: usize,
    ) -> Result<Self> {
        let (h, w, cls_channels) = cls.dim();

        if cls_channels != NUM_VARIANTS * num_box * NUM_CLASSES {
            return Err(Error::Shape {
                what: "class head output",
                expected: vec![h, w, NUM_VARIANTS * num_box * NUM_CLASSES],
                found: cls.shape().to_vec(),
            });
        }

        if loc.dim() != (h, w, NUM_VARIANTS * num_box * NUM_COORDINATES) {
            return Err(Error::Shape {
                what: "box head output",
                expected: vec![h, w, NUM_VARIANTS * num_box * NUM_COORDINATES],
                found: loc.shape().to_vec(),
            });
        }

        let logits = cls
            .to_shape((h, w, NUM_VARIANTS, num_box, NUM_CLASSES))?
            .into_owned();
        let localizations = loc
            .to_shape((h, w, NUM_VARIANTS, num_box, NUM_COORDINATES))?
            .into_owned();

        Ok(Self {
            logits,
            localizations,
        })
    }

    /// Shape of the feature grid, `(H, W)`.
    #[must_use]
    pub fn grid_shape(&self) -> (usize, usize) {
        let shape = self.logits.shape();
        (shape[0], shape[1])
    }

    /// Number of boxes per height variant.
    #[must_use]
    pub fn num_box(&self) -> usize {
        self.logits.shape()[3]
    }

    /// Number of anchors covered by this layer.
    #[must_use]
    pub fn len(&self) -> usize {
        self.logits.len() / NUM_CLASSES
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The logits as an `(N, 2)` array, in anchor order.
    pub fn flat_logits(&self) -> Result<Array2<f32>> {
        Ok(self
            .logits
            .to_shape((self.len(), NUM_CLASSES))?
            .into_owned())
    }

    /// The box offsets as an `(N, 4)` array, in anchor order.
    pub fn flat_localizations(&self) -> Result<Array2<f32>> {
        Ok(self
            .localizations
            .to_shape((self.len(), NUM_COORDINATES))?
            .into_owned())
    }
}

/// Flatten and concatenate the predictions of every layer.
///
/// Returns the `(N, 2)` logits and `(N, 4)` offsets, with rows in the same order as
/// [`Anchors::boxes`].
pub fn flatten_layers(layers: &[LayerPredictions]) -> Result<(Array2<f32>, Array2<f32>)> {
    let logits = layers
        .iter()
        .map(LayerPredictions::flat_logits)
        .collect::<Result<Vec<_>>>()?;
    let localizations = layers
        .iter()
        .map(LayerPredictions::flat_localizations)
        .collect::<Result<Vec<_>>>()?;

    if layers.is_empty() {
        return Ok((
            Array2::zeros((0, NUM_CLASSES)),
            Array2::zeros((0, NUM_COORDINATES)),
        ));
    }

    let logits = concatenate(
        Axis(0),
        &logits.iter().map(Array2::view).collect::<Vec<_>>(),
    )?;
    let localizations = concatenate(
        Axis(0),
        &localizations.iter().map(Array2::view).collect::<Vec<_>>(),
    )?;

    Ok((logits, localizations))
}

/// Check that there is one prediction per anchor, layer by layer.
pub fn validate_against(layers: &[LayerPredictions], anchors: &Anchors) -> Result<()> {
    let expected = anchors.layers().len();
    if layers.len() != expected {
        return Err(Error::LengthMismatch {
            field: "predictions",
            expected,
            found: layers.len(),
        });
    }

    for (predictions, (name, layer_anchors)) in layers.iter().zip(anchors.iter()) {
        if predictions.grid_shape() != layer_anchors.grid_shape() {
            return Err(Error::FeatureShape {
                layer: name.to_owned(),
                expected: layer_anchors.grid_shape(),
                found: predictions.grid_shape(),
            });
        }

        if predictions.num_box() != layer_anchors.num_box() {
            let (h, w) = layer_anchors.grid_shape();
            return Err(Error::Shape {
                what: "layer predictions",
                expected: vec![h, w, NUM_VARIANTS, layer_anchors.num_box(), NUM_CLASSES],
                found: predictions.logits.shape().to_vec(),
            });
        }
    }

    Ok(())
}

/// L2-normalize every feature vector of a `(H, W, C)` map along its channels and multiply by
/// `scale`.
///
/// Used on feature layers with a positive entry in `normalizations`.
#[must_use]
pub fn l2_normalize(features: ArrayView3<f32>, scale: f32) -> Array3<f32> {
    const EPSILON: f32 = 1e-12;

    let mut normalized = features.to_owned();
    for mut lane in normalized.lanes_mut(Axis(2)) {
        let norm = lane.mapv(|v| v * v).sum().max(EPSILON).sqrt();
        lane.mapv_inplace(|v| v / norm * scale);
    }

    normalized
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{anchor::AnchorGenerator, config::TextboxParams};
    use ndarray::{Array, Array3};

    #[test]
    fn head_outputs_follow_anchor_order() {
        let (h, w, num_box) = (2, 3, 2);
        let channels = NUM_VARIANTS * num_box * NUM_CLASSES;
        let cls = Array::from_shape_fn((h, w, channels), |(r, c, k)| {
            (((r * w + c) * channels) + k) as f32
        });
        let loc = Array3::zeros((h, w, NUM_VARIANTS * num_box * NUM_COORDINATES));

        let predictions =
            LayerPredictions::from_head_outputs(cls.view(), loc.view(), num_box).unwrap();

        assert_eq!(predictions.logits.dim(), (h, w, 2, num_box, 2));
        assert_eq!(predictions.len(), h * w * 2 * num_box);

        // element (row 1, col 0, variant 1, ratio 0, class 1)
        let expected = (3 * channels + 5) as f32;
        assert_eq!(predictions.logits[[1, 0, 1, 0, 1]], expected);

        let flat = predictions.flat_logits().unwrap();
        assert_eq!(flat.dim(), (predictions.len(), 2));
        // anchors are ordered by (row, col, variant, ratio)
        let anchor = (w * 2 + 1) * num_box;
        assert_eq!(flat[[anchor, 1]], predictions.logits[[1, 0, 1, 0, 1]]);
    }

    #[test]
    fn wrong_channel_count_is_rejected() {
        let cls = Array3::<f32>::zeros((2, 2, 7));
        let loc = Array3::<f32>::zeros((2, 2, 16));

        assert!(matches!(
            LayerPredictions::from_head_outputs(cls.view(), loc.view(), 2),
            Err(Error::Shape { what: "class head output", .. })
        ));
    }

    fn zero_predictions(params: &TextboxParams) -> Vec<LayerPredictions> {
        let r = params.num_box();
        params
            .feat_shapes
            .iter()
            .map(|&(h, w)| {
                LayerPredictions::new(
                    Array5::zeros((h, w, 2, r, 2)),
                    Array5::zeros((h, w, 2, r, 4)),
                )
                .unwrap()
            })
            .collect()
    }

    #[test]
    fn flattened_layers_cover_every_anchor() {
        let params = TextboxParams::default();
        let anchors = AnchorGenerator::new(&params)
            .unwrap()
            .generate(params.image_shape)
            .unwrap();
        let layers = zero_predictions(&params);

        validate_against(&layers, &anchors).unwrap();

        let (logits, localizations) = flatten_layers(&layers).unwrap();
        assert_eq!(logits.dim(), (anchors.len(), 2));
        assert_eq!(localizations.dim(), (anchors.len(), 4));
    }

    #[test]
    fn mismatched_grid_is_reported_by_name() {
        let params = TextboxParams::default();
        let anchors = AnchorGenerator::new(&params)
            .unwrap()
            .generate(params.image_shape)
            .unwrap();
        let mut layers = zero_predictions(&params);
        layers[2] = LayerPredictions::new(
            Array5::zeros((9, 9, 2, 6, 2)),
            Array5::zeros((9, 9, 2, 6, 4)),
        )
        .unwrap();

        let Err(Error::FeatureShape { layer, expected, found }) =
            validate_against(&layers, &anchors)
        else {
            panic!("expected a feature shape error");
        };

        assert_eq!(layer, "conv8");
        assert_eq!(expected, (10, 10));
        assert_eq!(found, (9, 9));
    }

    #[test]
    fn missing_layer_is_rejected() {
        let params = TextboxParams::default();
        let anchors = AnchorGenerator::new(&params)
            .unwrap()
            .generate(params.image_shape)
            .unwrap();
        let mut layers = zero_predictions(&params);
        layers.pop();

        assert!(matches!(
            validate_against(&layers, &anchors),
            Err(Error::LengthMismatch { .. })
        ));
    }

    #[test]
    fn l2_normalize_scales_channels() {
        let features = Array3::from_shape_vec((1, 2, 2), vec![3.0, 4.0, 0.0, 0.0]).unwrap();
        let normalized = l2_normalize(features.view(), 20.0);

        assert!((normalized[[0, 0, 0]] - 12.0).abs() < 1e-5);
        assert!((normalized[[0, 0, 1]] - 16.0).abs() < 1e-5);
        assert_eq!(normalized[[0, 1, 0]], 0.0);
    }
}
