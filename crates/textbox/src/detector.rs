//! Selection of the final detections from decoded boxes.

use itertools::Itertools;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, ArrayView3, Axis};

use crate::{
    bbox::{Bbox, Yxyx},
    box_coder::BoxCoder,
    error::{Error, Result},
};

/// Index of the "text" class in the classification logits.
pub const TEXT_CLASS: usize = 1;

/// A detected text box, with its confidence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub score: f32,
    /// The bounding box in relative `(ymin, xmin, ymax, xmax)` coordinates.
    pub bbox: Bbox<Yxyx>,
}

/// The detections of one image, by descending score.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Detections {
    pub detections: Vec<Detection>,
}

impl Detections {
    #[must_use]
    pub fn len(&self) -> usize {
        self.detections.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Detection> {
        self.detections.iter()
    }

    /// The scores as an `(M,)` array.
    #[must_use]
    pub fn scores(&self) -> Array1<f32> {
        self.detections.iter().map(|d| d.score).collect()
    }

    /// The boxes as an `(M, 4)` array of `(ymin, xmin, ymax, xmax)` rows.
    #[must_use]
    pub fn boxes(&self) -> Array2<f32> {
        let mut boxes = Array2::zeros((self.len(), 4));
        for (mut row, detection) in boxes.axis_iter_mut(Axis(0)).zip(&self.detections) {
            let (ymin, xmin, ymax, xmax) = detection.bbox.inner;
            row[0] = ymin;
            row[1] = xmin;
            row[2] = ymax;
            row[3] = xmax;
        }

        boxes
    }
}

impl IntoIterator for Detections {
    type Item = Detection;
    type IntoIter = std::vec::IntoIter<Detection>;

    fn into_iter(self) -> Self::IntoIter {
        self.detections.into_iter()
    }
}

impl<'a> IntoIterator for &'a Detections {
    type Item = &'a Detection;
    type IntoIter = std::slice::Iter<'a, Detection>;

    fn into_iter(self) -> Self::IntoIter {
        self.detections.iter()
    }
}

/// Score filtering, top-k selection and greedy non-maximum suppression.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detector {
    /// Boxes scoring below this threshold are dropped before suppression.
    pub select_threshold: Option<f32>,
    /// Boxes overlapping a kept box by more than this IoU are suppressed.
    pub nms_threshold: f32,
    /// Number of highest-scoring boxes considered for suppression.
    pub top_k: usize,
    /// Maximum number of detections kept per image.
    pub keep_top_k: usize,
    /// Region the kept boxes are clipped to.
    pub clip_region: Option<Bbox<Yxyx>>,
}

impl Default for Detector {
    fn default() -> Self {
        Self {
            select_threshold: None,
            nms_threshold: 0.5,
            top_k: 400,
            keep_top_k: 200,
            clip_region: None,
        }
    }
}

impl Detector {
    #[must_use]
    pub fn with_select_threshold(mut self, threshold: f32) -> Self {
        self.select_threshold = Some(threshold);
        self
    }

    #[must_use]
    pub fn with_nms_threshold(mut self, threshold: f32) -> Self {
        self.nms_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_top_k(mut self, top_k: usize, keep_top_k: usize) -> Self {
        self.top_k = top_k;
        self.keep_top_k = keep_top_k;
        self
    }

    #[must_use]
    pub fn with_clip_region(mut self, region: Bbox<Yxyx>) -> Self {
        self.clip_region = Some(region);
        self
    }

    /// Select the detections of one image from the text `scores` `(N,)` and the decoded `boxes`
    /// `(N, 4)`.
    ///
    /// Sorting is stable with respect to the original index, so equal inputs always give the same
    /// detections in the same order.
    pub fn detect(&self, scores: ArrayView1<f32>, boxes: ArrayView2<f32>) -> Result<Detections> {
        if boxes.dim() != (scores.len(), 4) {
            return Err(Error::Shape {
                what: "boxes",
                expected: vec![scores.len(), 4],
                found: boxes.shape().to_vec(),
            });
        }

        let candidates = scores
            .iter()
            .zip(boxes.axis_iter(Axis(0)))
            .enumerate()
            .filter(|(_, (score, _))| self.select_threshold.is_none_or(|t| **score >= t))
            .map(|(i, (&score, bbox))| {
                (
                    i,
                    Detection {
                        score,
                        bbox: Bbox::<Yxyx>::from_row(bbox),
                    },
                )
            })
            .sorted_by(|(i, a), (j, b)| b.score.total_cmp(&a.score).then(i.cmp(j)))
            .take(self.top_k)
            .map(|(_, detection)| detection)
            .collect::<Vec<_>>();

        let detections = non_max_suppression(&candidates, self.nms_threshold, self.keep_top_k)
            .into_iter()
            .map(|i| {
                let detection = candidates[i];
                Detection {
                    bbox: self
                        .clip_region
                        .map_or(detection.bbox, |region| detection.bbox.clip(&region)),
                    ..detection
                }
            })
            .collect::<Vec<_>>();

        if detections.is_empty() {
            tracing::trace!(candidates = scores.len(), "no detections");
        }

        Ok(Detections { detections })
    }

    /// Select the detections of one image from raw network outputs.
    ///
    /// `logits` `(N, 2)` are turned into text probabilities with a softmax, and `localizations`
    /// `(N, 4)` are decoded relative to `anchors` `(N, 4)` before running [`Detector::detect`].
    pub fn detect_from_predictions(
        &self,
        logits: ArrayView2<f32>,
        localizations: ArrayView2<f32>,
        anchors: ArrayView2<f32>,
        coder: &BoxCoder,
    ) -> Result<Detections> {
        if logits.dim() != (localizations.nrows(), 2) {
            return Err(Error::Shape {
                what: "logits",
                expected: vec![localizations.nrows(), 2],
                found: logits.shape().to_vec(),
            });
        }

        let probabilities = softmax(logits);
        let boxes = coder.decode(localizations, anchors)?;

        self.detect(probabilities.column(TEXT_CLASS), boxes.view())
    }

    /// Select the detections of every image of a batch, from scores `(B, N)` and boxes
    /// `(B, N, 4)`.
    pub fn detect_batch(
        &self,
        scores: ArrayView2<f32>,
        boxes: ArrayView3<f32>,
    ) -> Result<Vec<Detections>> {
        if boxes.dim() != (scores.nrows(), scores.ncols(), 4) {
            return Err(Error::Shape {
                what: "boxes",
                expected: vec![scores.nrows(), scores.ncols(), 4],
                found: boxes.shape().to_vec(),
            });
        }

        scores
            .axis_iter(Axis(0))
            .zip(boxes.axis_iter(Axis(0)))
            .map(|(scores, boxes)| self.detect(scores, boxes))
            .collect()
    }
}

/// Greedy non-maximum suppression over `candidates` sorted by descending score.
///
/// Returns the indices of the kept candidates, at most `keep_top_k` of them. A candidate is
/// suppressed if its IoU with an already kept candidate exceeds `threshold`.
#[must_use]
pub fn non_max_suppression(
    candidates: &[Detection],
    threshold: f32,
    keep_top_k: usize,
) -> Vec<usize> {
    let mut kept: Vec<usize> = Vec::new();

    for (i, candidate) in candidates.iter().enumerate() {
        if kept.len() >= keep_top_k {
            break;
        }

        let suppressed = kept
            .iter()
            .any(|&k| candidates[k].bbox.iou(&candidate.bbox) > threshold);

        if !suppressed {
            kept.push(i);
        }
    }

    kept
}

/// Numerically stable softmax over every row.
#[must_use]
pub fn softmax(logits: ArrayView2<f32>) -> Array2<f32> {
    let mut probabilities = logits.to_owned();

    for mut row in probabilities.axis_iter_mut(Axis(0)) {
        let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row.mapv_inplace(|v| v / sum);
    }

    probabilities
}
