//! The text detector, tying anchors, matching, loss and detection together.

use std::{path::Path, sync::Arc};

use ndarray::{Array2, ArrayView2};
use odal::Config;

use crate::{
    anchor::{AnchorGenerator, Anchors},
    box_coder::BoxCoder,
    config::TextboxParams,
    detector::{Detections, Detector},
    error::{Error, Result},
    loss::{LossAssembler, LossInputs, LossTerms},
    matcher::{MatchPolicy, MatchResult, Matcher},
    predictions::{LayerPredictions, flatten_layers, validate_against},
};

/// The text detector for one configuration.
///
/// Anchors of the configured image shape are generated once, when the detector is created, and
/// shared read-only by every later call.
#[derive(Debug)]
pub struct TextboxNet {
    params: TextboxParams,
    coder: BoxCoder,
    matcher: Matcher,
    loss: LossAssembler,
    detector: Detector,
    anchors: Arc<Anchors>,
    /// All anchors flattened into `(N, 4)` rows.
    boxes: Arc<Array2<f32>>,
}

impl TextboxNet {
    /// Create a detector, rejecting malformed configurations.
    pub fn new(params: TextboxParams) -> Result<Self> {
        let anchors = AnchorGenerator::new(&params)?.generate(params.image_shape)?;
        let boxes = anchors.boxes()?;
        tracing::debug!(
            image_shape = ?params.image_shape,
            anchors = boxes.nrows(),
            "generated anchors"
        );

        let coder = BoxCoder::new(params.prior_scaling);

        Ok(Self {
            matcher: Matcher::new(params.match_threshold, coder),
            loss: LossAssembler::new(params.match_threshold),
            detector: Detector::default(),
            coder,
            params,
            anchors: Arc::new(anchors),
            boxes: Arc::new(boxes),
        })
    }

    /// Load the configuration from `main`, overlaid by `overlay`, and create a detector.
    pub fn from_config(main: impl AsRef<Path>, overlay: impl AsRef<Path>) -> Result<Self> {
        let params = TextboxParams::load_with_overlay(main, overlay)?;
        Self::new(params)
    }

    #[must_use]
    pub fn with_match_policy(mut self, policy: MatchPolicy) -> Self {
        self.matcher = self.matcher.with_policy(policy);
        self
    }

    #[must_use]
    pub fn with_loss(mut self, loss: LossAssembler) -> Self {
        self.loss = loss;
        self
    }

    #[must_use]
    pub fn with_detector(mut self, detector: Detector) -> Self {
        self.detector = detector;
        self
    }

    #[must_use]
    pub fn params(&self) -> &TextboxParams {
        &self.params
    }

    #[must_use]
    pub fn coder(&self) -> &BoxCoder {
        &self.coder
    }

    #[must_use]
    pub fn detector(&self) -> &Detector {
        &self.detector
    }

    /// The anchors of every feature layer.
    #[must_use]
    pub fn anchors(&self) -> Arc<Anchors> {
        Arc::clone(&self.anchors)
    }

    /// All anchors as one `(N, 4)` array of `(yc, xc, h, w)` rows.
    #[must_use]
    pub fn anchor_boxes(&self) -> Arc<Array2<f32>> {
        Arc::clone(&self.boxes)
    }

    /// Match the ground-truth boxes of one image to the anchors.
    pub fn bboxes_encode(&self, gt_boxes: ArrayView2<f32>) -> Result<MatchResult> {
        self.matcher.match_anchors(self.boxes.view(), gt_boxes)
    }

    /// Match the ground-truth boxes of every image of a batch.
    pub fn bboxes_encode_batch(&self, gt_boxes: &[Array2<f32>]) -> Result<Vec<MatchResult>> {
        self.matcher.match_batch(self.boxes.view(), gt_boxes)
    }

    /// Decode `(N, 4)` predicted offsets into `(ymin, xmin, ymax, xmax)` boxes.
    pub fn bboxes_decode(&self, localizations: ArrayView2<f32>) -> Result<Array2<f32>> {
        self.coder.decode(localizations, self.boxes.view())
    }

    /// Compute the loss of a batch, given the per-layer predictions and the matched targets of
    /// every image.
    pub fn losses(
        &self,
        predictions: &[Vec<LayerPredictions>],
        targets: &[MatchResult],
    ) -> Result<LossTerms> {
        if predictions.len() != targets.len() {
            return Err(Error::LengthMismatch {
                field: "targets",
                expected: predictions.len(),
                found: targets.len(),
            });
        }

        let flattened = predictions
            .iter()
            .map(|layers| self.flatten(layers))
            .collect::<Result<Vec<_>>>()?;

        let inputs = flattened
            .iter()
            .zip(targets)
            .map(|((logits, localizations), target)| {
                LossInputs::new(
                    logits.view(),
                    target.scores.view(),
                    localizations.view(),
                    target.offsets.view(),
                )
            })
            .collect::<Vec<_>>();

        self.loss.compute_batch(&inputs)
    }

    /// Select the detections of one image from its per-layer predictions.
    pub fn detected_bboxes(&self, predictions: &[LayerPredictions]) -> Result<Detections> {
        let (logits, localizations) = self.flatten(predictions)?;

        self.detector.detect_from_predictions(
            logits.view(),
            localizations.view(),
            self.boxes.view(),
            &self.coder,
        )
    }

    fn flatten(&self, layers: &[LayerPredictions]) -> Result<(Array2<f32>, Array2<f32>)> {
        validate_against(layers, &self.anchors)?;
        flatten_layers(layers)
    }
}
