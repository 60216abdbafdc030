//! Configuration of the text detector.

use odal::Config;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Number of classes predicted per anchor: background and text.
pub const NUM_CLASSES: usize = 2;

/// Per-anchor-layer configuration of the detector.
///
/// Every `Vec` field except `anchor_ratios` and `prior_scaling` holds exactly one entry per
/// feature layer, in the order of [`TextboxParams::feat_layers`].
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TextboxParams {
    /// Input image shape as `(height, width)`.
    pub image_shape: (usize, usize),
    pub num_classes: usize,
    /// Names of the backbone blocks used as feature layers.
    pub feat_layers: Vec<String>,
    /// Spatial `(height, width)` of each feature layer.
    pub feat_shapes: Vec<(usize, usize)>,
    /// Range the scale schedule is spread over.
    pub scale_range: (f32, f32),
    /// Aspect ratios shared by every feature layer.
    pub anchor_ratios: Vec<f32>,
    /// L2 normalization scale per layer, `-1` disables it.
    pub normalizations: Vec<i32>,
    /// Scaling of `(dy, dx, dh, dw)` used when encoding and decoding boxes.
    pub prior_scaling: [f32; 4],
    /// `(size_min, size_max)` in pixels per layer.
    pub anchor_sizes: Vec<(f32, f32)>,
    /// Stride of each feature layer relative to the input image.
    pub anchor_steps: Vec<usize>,
    /// Scale fraction per layer.
    pub scales: Vec<f32>,
    /// IoU an anchor needs to exceed to be a positive.
    pub match_threshold: f32,
}

impl Config for TextboxParams {
    const PATH: &'static str = "textbox.toml";
}

impl Default for TextboxParams {
    /// The 300x300 reference configuration.
    fn default() -> Self {
        let scale_range = (0.2, 0.95);

        Self {
            image_shape: (300, 300),
            num_classes: NUM_CLASSES,
            feat_layers: ["conv4", "conv7", "conv8", "conv9", "conv10", "global"]
                .into_iter()
                .map(String::from)
                .collect(),
            feat_shapes: vec![(38, 38), (19, 19), (10, 10), (5, 5), (3, 3), (1, 1)],
            scale_range,
            anchor_ratios: vec![1.0, 2.0, 3.0, 5.0, 7.0, 10.0],
            normalizations: vec![20, -1, -1, -1, -1, -1],
            prior_scaling: [0.1, 0.1, 0.2, 0.2],
            anchor_sizes: vec![
                (30.0, 60.0),
                (60.0, 114.0),
                (114.0, 168.0),
                (168.0, 222.0),
                (222.0, 276.0),
                (276.0, 330.0),
            ],
            anchor_steps: vec![8, 16, 30, 60, 100, 300],
            scales: linear_scales(6, 0.2, 1.0),
            match_threshold: 0.5,
        }
    }
}

impl TextboxParams {
    /// Number of feature layers.
    #[must_use]
    pub fn num_layers(&self) -> usize {
        self.feat_layers.len()
    }

    /// Number of aspect ratios, which is also the number of boxes per height variant.
    #[must_use]
    pub fn num_box(&self) -> usize {
        self.anchor_ratios.len()
    }

    /// Total number of anchors over all feature layers.
    #[must_use]
    pub fn num_anchors(&self) -> usize {
        self.feat_shapes
            .iter()
            .map(|(h, w)| h * w * 2 * self.num_box())
            .sum()
    }

    /// Check the configuration for consistency.
    ///
    /// This is called by every constructor taking a [`TextboxParams`], so that a malformed
    /// configuration is rejected before any anchors or losses are computed.
    pub fn validate(&self) -> Result<()> {
        let expected = self.num_layers();
        if expected == 0 {
            return Err(Error::InvalidConfig("no feature layers configured".into()));
        }

        let lengths = [
            ("feat_shapes", self.feat_shapes.len()),
            ("normalizations", self.normalizations.len()),
            ("anchor_sizes", self.anchor_sizes.len()),
            ("anchor_steps", self.anchor_steps.len()),
            ("scales", self.scales.len()),
        ];

        for (field, found) in lengths {
            if found != expected {
                return Err(Error::LengthMismatch {
                    field,
                    expected,
                    found,
                });
            }
        }

        if self.num_classes != NUM_CLASSES {
            return Err(Error::InvalidConfig(format!(
                "num_classes must be {NUM_CLASSES} (background and text), got {}",
                self.num_classes
            )));
        }

        let (image_h, image_w) = self.image_shape;
        if image_h == 0 || image_w == 0 {
            return Err(Error::InvalidConfig("image_shape must be non-zero".into()));
        }

        if self.anchor_ratios.is_empty() {
            return Err(Error::InvalidConfig("anchor_ratios is empty".into()));
        }

        if let Some(r) = self.anchor_ratios.iter().find(|r| r.is_nan() || **r <= 0.0) {
            return Err(Error::InvalidConfig(format!(
                "anchor ratios must be positive, got {r}"
            )));
        }

        if let Some((h, w)) = self.feat_shapes.iter().find(|(h, w)| *h == 0 || *w == 0) {
            return Err(Error::InvalidConfig(format!(
                "feature shapes must be non-zero, got ({h}, {w})"
            )));
        }

        if let Some((min, max)) = self
            .anchor_sizes
            .iter()
            .find(|(min, max)| min.is_nan() || *min <= 0.0 || max < min)
        {
            return Err(Error::InvalidConfig(format!(
                "anchor sizes must satisfy 0 < min <= max, got ({min}, {max})"
            )));
        }

        if self.anchor_steps.contains(&0) {
            return Err(Error::InvalidConfig("anchor steps must be non-zero".into()));
        }

        if self.prior_scaling.iter().any(|s| s.is_nan() || *s <= 0.0) {
            return Err(Error::InvalidConfig(format!(
                "prior scaling must be positive, got {:?}",
                self.prior_scaling
            )));
        }

        let (scale_min, scale_max) = self.scale_range;
        if !(0.0..=scale_max).contains(&scale_min) {
            return Err(Error::InvalidConfig(format!(
                "scale_range must satisfy 0 <= min <= max, got ({scale_min}, {scale_max})"
            )));
        }

        if self.scales.windows(2).any(|w| w[1] < w[0]) {
            return Err(Error::InvalidConfig(format!(
                "scales must be monotonically non-decreasing, got {:?}",
                self.scales
            )));
        }

        if !(0.0..=1.0).contains(&self.match_threshold) {
            return Err(Error::InvalidConfig(format!(
                "match_threshold must be within [0, 1], got {}",
                self.match_threshold
            )));
        }

        Ok(())
    }
}

/// Create `num_layers` scales evenly spread between `min` and `max`, both inclusive.
#[must_use]
pub fn linear_scales(num_layers: usize, min: f32, max: f32) -> Vec<f32> {
    if num_layers == 1 {
        return vec![min];
    }

    (0..num_layers)
        .map(|i| min + (max - min) * i as f32 / (num_layers - 1) as f32)
        .collect()
}
