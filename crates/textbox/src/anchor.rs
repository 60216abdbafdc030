use itertools::iproduct;
use ndarray::{Array, Array2, Axis, concatenate};

use crate::{
    config::TextboxParams,
    error::{Error, Result},
    meshgrid::meshgrid,
};

/// Default offset of the anchor centers within their feature cell.
pub const DEFAULT_OFFSET: f32 = 0.5;

/// Number of height variants generated per cell.
pub const NUM_VARIANTS: usize = 2;

/// The anchors of a single feature layer.
///
/// Centers are stored as `(H, W)` grids and sizes as `(2, R)` tables, where the first axis is the
/// height variant and the second the aspect ratio. All values are relative to the image size.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerAnchors {
    /// Vertical center of every cell.
    pub y: Array2<f32>,
    /// Horizontal center of every cell.
    pub x: Array2<f32>,
    /// Height of every (variant, ratio) pair.
    pub h: Array2<f32>,
    /// Width of every (variant, ratio) pair.
    pub w: Array2<f32>,
}

impl LayerAnchors {
    /// Shape of the feature grid, `(H, W)`.
    #[must_use]
    pub fn grid_shape(&self) -> (usize, usize) {
        self.y.dim()
    }

    /// Number of boxes per height variant.
    #[must_use]
    pub fn num_box(&self) -> usize {
        self.h.ncols()
    }

    /// Total number of anchors in this layer, `H * W * 2 * R`.
    #[must_use]
    pub fn len(&self) -> usize {
        self.y.len() * self.h.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flatten the anchors into an `(N, 4)` array of `(yc, xc, h, w)` rows.
    ///
    /// Rows are ordered by `(row, col, variant, ratio)`, which is the order in which a
    /// `(H, W, 2, R, C)` prediction tensor is laid out in memory.
    #[must_use]
    pub fn boxes(&self) -> Array2<f32> {
        let (rows, cols) = self.grid_shape();
        let (variants, num_box) = self.h.dim();

        let mut boxes = Array2::zeros((self.len(), 4));
        let cells = iproduct!(0..rows, 0..cols, 0..variants, 0..num_box);

        for (mut row, (r, c, v, b)) in boxes.axis_iter_mut(Axis(0)).zip(cells) {
            row[0] = self.y[[r, c]];
            row[1] = self.x[[r, c]];
            row[2] = self.h[[v, b]];
            row[3] = self.w[[v, b]];
        }

        boxes
    }
}

/// Anchors for every feature layer, in configuration order.
#[derive(Debug, Clone, PartialEq)]
pub struct Anchors {
    names: Vec<String>,
    layers: Vec<LayerAnchors>,
}

impl Anchors {
    /// Look up the anchors of a named feature layer.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&LayerAnchors> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| &self.layers[i])
    }

    /// Iterate over `(layer name, anchors)` pairs in configuration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &LayerAnchors)> {
        self.names.iter().map(String::as_str).zip(&self.layers)
    }

    #[must_use]
    pub fn layers(&self) -> &[LayerAnchors] {
        &self.layers
    }

    /// Total number of anchors over all layers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.layers.iter().map(LayerAnchors::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All anchors as one `(N, 4)` array of `(yc, xc, h, w)` rows, concatenated in layer order.
    pub fn boxes(&self) -> Result<Array2<f32>> {
        let per_layer = self.layers.iter().map(LayerAnchors::boxes).collect::<Vec<_>>();
        let views = per_layer.iter().map(Array2::view).collect::<Vec<_>>();

        Ok(concatenate(Axis(0), &views)?)
    }
}

/// Generator for the anchors of every feature layer of the detector.
///
/// The generator is created once from a validated configuration; the anchors it produces are
/// fixed for a given image shape and can be shared by every subsequent training step or
/// inference call.
#[derive(Debug, Clone)]
pub struct AnchorGenerator {
    feat_layers: Vec<String>,
    feat_shapes: Vec<(usize, usize)>,
    ratios: Vec<f32>,
    sizes: Vec<(f32, f32)>,
    offset: f32,
}

impl AnchorGenerator {
    /// Create a new generator, rejecting malformed configurations eagerly.
    pub fn new(params: &TextboxParams) -> Result<Self> {
        params.validate()?;

        Ok(Self {
            feat_layers: params.feat_layers.clone(),
            feat_shapes: params.feat_shapes.clone(),
            ratios: params.anchor_ratios.clone(),
            sizes: params.anchor_sizes.clone(),
            offset: DEFAULT_OFFSET,
        })
    }

    /// Use a different offset for the anchor centers within their cell.
    pub fn with_offset(mut self, offset: f32) -> Result<Self> {
        if !(0.0..=1.0).contains(&offset) {
            return Err(Error::InvalidArgument(format!(
                "anchor offset must be within [0, 1], got {offset}"
            )));
        }

        self.offset = offset;
        Ok(self)
    }

    /// Generate the anchors of all feature layers for an image of the given `(height, width)`.
    pub fn generate(&self, image_shape: (usize, usize)) -> Result<Anchors> {
        if image_shape.0 == 0 || image_shape.1 == 0 {
            return Err(Error::InvalidArgument(format!(
                "image shape must be non-zero, got {image_shape:?}"
            )));
        }

        let layers = self
            .feat_layers
            .iter()
            .zip(&self.feat_shapes)
            .zip(&self.sizes)
            .map(|((name, &feat_shape), &size)| {
                let anchors =
                    layer_anchors(image_shape, feat_shape, &self.ratios, size, self.offset);

                tracing::debug!(
                    layer = name.as_str(),
                    grid = ?feat_shape,
                    anchors = anchors.len(),
                    "generated layer anchors"
                );

                anchors
            })
            .collect();

        Ok(Anchors {
            names: self.feat_layers.clone(),
            layers,
        })
    }
}

/// Compute the anchors of one feature layer.
///
/// Every cell gets two height variants, each with one box per aspect ratio:
/// - variant 0 uses `size_min`, stretched by every ratio `r` as `(h / sqrt(r), w * sqrt(r))`
/// - variant 1 uses the geometric mean `sqrt(size_min * size_max)` and is not stretched, so the
///   same box fills all of its ratio slots
pub fn layer_anchors(
    (image_h, image_w): (usize, usize),
    (feat_h, feat_w): (usize, usize),
    ratios: &[f32],
    (size_min, size_max): (f32, f32),
    offset: f32,
) -> LayerAnchors {
    let rows = (Array::range(0.0, feat_h as f32, 1.0) + offset) / feat_h as f32;
    let cols = (Array::range(0.0, feat_w as f32, 1.0) + offset) / feat_w as f32;
    let (y, x) = meshgrid(&rows, &cols);

    let (image_h, image_w) = (image_h as f32, image_w as f32);
    let size_mean = (size_min * size_max).sqrt();

    let mut h = Array2::zeros((NUM_VARIANTS, ratios.len()));
    let mut w = Array2::zeros((NUM_VARIANTS, ratios.len()));

    for (i, ratio) in ratios.iter().enumerate() {
        let sqrt_ratio = ratio.sqrt();

        h[[0, i]] = size_min / image_h / sqrt_ratio;
        w[[0, i]] = size_min / image_w * sqrt_ratio;

        h[[1, i]] = size_mean / image_h;
        w[[1, i]] = size_mean / image_w;
    }

    LayerAnchors { y, x, h, w }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-6
    }

    #[test]
    fn anchor_count_per_layer() {
        let params = TextboxParams::default();
        let anchors = AnchorGenerator::new(&params)
            .unwrap()
            .generate(params.image_shape)
            .unwrap();

        for ((_, layer), (h, w)) in anchors.iter().zip(&params.feat_shapes) {
            assert_eq!(layer.grid_shape(), (*h, *w));
            assert_eq!(layer.h.dim(), (2, params.num_box()));
            assert_eq!(layer.len(), h * w * 2 * params.num_box());
            assert_eq!(layer.boxes().dim(), (layer.len(), 4));
        }

        assert_eq!(anchors.len(), params.num_anchors());
        assert_eq!(anchors.boxes().unwrap().dim(), (params.num_anchors(), 4));
    }

    #[test]
    fn boxes_concatenate_layers_in_order() {
        let params = TextboxParams::default();
        let anchors = AnchorGenerator::new(&params)
            .unwrap()
            .generate(params.image_shape)
            .unwrap();
        let boxes = anchors.boxes().unwrap();

        let mut start = 0;
        for layer in anchors.layers() {
            let layer_boxes = layer.boxes();
            let end = start + layer.len();
            assert_eq!(boxes.slice(ndarray::s![start..end, ..]), layer_boxes);
            start = end;
        }
        assert_eq!(start, boxes.nrows());
    }

    #[test]
    fn centers_sit_mid_cell() {
        let layer = layer_anchors((300, 300), (2, 4), &[1.0], (30.0, 60.0), 0.5);

        assert!(close(layer.y[[0, 0]], 0.25));
        assert!(close(layer.y[[1, 0]], 0.75));
        assert!(close(layer.x[[0, 0]], 0.125));
        assert!(close(layer.x[[0, 3]], 0.875));
    }

    #[test]
    fn variant_sizes() {
        let layer = layer_anchors((300, 600), (1, 1), &[1.0, 4.0], (30.0, 120.0), 0.5);

        // variant 0, stretched by the ratio
        assert!(close(layer.h[[0, 0]], 0.1));
        assert!(close(layer.w[[0, 0]], 0.05));
        assert!(close(layer.h[[0, 1]], 0.05));
        assert!(close(layer.w[[0, 1]], 0.1));

        // variant 1, geometric mean of 30 and 120 is 60
        for i in 0..2 {
            assert!(close(layer.h[[1, i]], 0.2));
            assert!(close(layer.w[[1, i]], 0.1));
        }
    }

    #[test]
    fn flattened_order_is_row_col_variant_ratio() {
        let layer = layer_anchors((100, 100), (2, 2), &[1.0, 4.0], (10.0, 40.0), 0.5);
        let boxes = layer.boxes();

        // first cell, variant 0, ratio 4
        assert!(close(boxes[[1, 0]], 0.25));
        assert!(close(boxes[[1, 1]], 0.25));
        assert!(close(boxes[[1, 2]], 0.05));
        assert!(close(boxes[[1, 3]], 0.2));

        // first cell, variant 1
        assert!(close(boxes[[2, 2]], 0.2));

        // second cell (row 0, col 1) starts after 2 * 2 boxes
        assert!(close(boxes[[4, 0]], 0.25));
        assert!(close(boxes[[4, 1]], 0.75));

        // third cell (row 1, col 0)
        assert!(close(boxes[[8, 0]], 0.75));
        assert!(close(boxes[[8, 1]], 0.25));
    }

    #[test]
    fn lookup_by_name() {
        let params = TextboxParams::default();
        let anchors = AnchorGenerator::new(&params)
            .unwrap()
            .generate(params.image_shape)
            .unwrap();

        assert_eq!(anchors.get("conv8").unwrap().grid_shape(), (10, 10));
        assert!(anchors.get("conv5").is_none());
    }

    #[test]
    fn malformed_config_is_rejected_at_construction() {
        let mut params = TextboxParams::default();
        params.feat_shapes.push((1, 1));

        assert!(matches!(
            AnchorGenerator::new(&params),
            Err(Error::LengthMismatch {
                field: "feat_shapes",
                ..
            })
        ));
    }

    #[test]
    fn invalid_offset_is_rejected() {
        let generator = AnchorGenerator::new(&TextboxParams::default()).unwrap();
        assert!(generator.with_offset(1.5).is_err());
    }
}
