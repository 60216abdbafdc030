//! Assignment of ground-truth boxes to anchors.

use ndarray::{Array1, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

use crate::{
    bbox::{Bbox, ConvertBbox, Cyxhw, Yxyx},
    box_coder::BoxCoder,
    error::{Error, Result},
};

/// Score given to anchors that were force-assigned by [`MatchPolicy::EnsureCoverage`].
///
/// It is larger than any IoU, so the anchor is positive under every threshold.
pub const FORCED_MATCH_SCORE: f32 = 2.0;

/// How anchors are assigned to ground-truth boxes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchPolicy {
    /// An anchor is positive iff its best IoU exceeds the match threshold.
    #[default]
    Threshold,
    /// Like [`MatchPolicy::Threshold`], but every ground-truth box with a non-zero area is also
    /// assigned to the anchor it overlaps most, even when that overlap is below the threshold.
    EnsureCoverage,
}

/// The assignment of every anchor of one image.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    /// Best IoU of every anchor with any ground-truth box.
    ///
    /// Anchors forced onto a ground-truth box by [`MatchPolicy::EnsureCoverage`] carry
    /// [`FORCED_MATCH_SCORE`] instead, which lies above every real IoU, so they count as
    /// positives wherever the score is compared to the match threshold.
    pub scores: Array1<f32>,
    /// Encoded `(dy, dx, dh, dw)` offset of every anchor to its best ground-truth box.
    ///
    /// Anchors without any overlap are encoded against the full image box.
    pub offsets: Array2<f32>,
    /// Whether the anchor is a positive.
    pub positive: Array1<bool>,
    /// Index of the ground-truth box assigned to every anchor, `None` for background.
    pub assigned: Vec<Option<usize>>,
}

impl MatchResult {
    /// Number of anchors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.scores.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    /// Number of positive anchors.
    #[must_use]
    pub fn num_positive(&self) -> usize {
        self.positive.iter().filter(|p| **p).count()
    }
}

/// Assigns every anchor to its best-overlapping ground-truth box or to the background.
#[derive(Debug, Clone)]
pub struct Matcher {
    threshold: f32,
    policy: MatchPolicy,
    coder: BoxCoder,
}

impl Matcher {
    /// Create a matcher with the [`MatchPolicy::Threshold`] policy.
    #[must_use]
    pub fn new(match_threshold: f32, coder: BoxCoder) -> Self {
        Self {
            threshold: match_threshold,
            policy: MatchPolicy::default(),
            coder,
        }
    }

    #[must_use]
    pub fn with_policy(mut self, policy: MatchPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    #[must_use]
    pub fn policy(&self) -> MatchPolicy {
        self.policy
    }

    /// Match `anchors` (`(yc, xc, h, w)` rows) against the ground-truth boxes of one image
    /// (`(ymin, xmin, ymax, xmax)` rows).
    ///
    /// An empty set of ground-truth boxes yields an all-background assignment.
    pub fn match_anchors(
        &self,
        anchors: ArrayView2<f32>,
        gt_boxes: ArrayView2<f32>,
    ) -> Result<MatchResult> {
        check_columns("anchors", anchors)?;
        check_columns("gt_boxes", gt_boxes)?;

        let num_anchors = anchors.nrows();
        let anchor_boxes = anchors
            .axis_iter(Axis(0))
            .map(|row| ConvertBbox::<Yxyx>::convert(&Bbox::<Cyxhw>::from_row(row)))
            .collect::<Vec<_>>();
        let gt = gt_boxes
            .axis_iter(Axis(0))
            .map(Bbox::<Yxyx>::from_row)
            .collect::<Vec<_>>();

        if gt.is_empty() {
            tracing::trace!("no ground-truth boxes, all anchors are background");
        }

        let degenerate = gt.iter().filter(|b| b.area() <= 0.0).count();
        if degenerate > 0 {
            tracing::warn!(degenerate, "ignoring ground-truth boxes without area");
        }

        let mut scores = Array1::<f32>::zeros(num_anchors);
        let mut assigned = vec![None; num_anchors];

        for (k, gt_box) in gt.iter().enumerate() {
            for (i, anchor) in anchor_boxes.iter().enumerate() {
                let overlap = anchor.iou(gt_box);
                // strict comparison, so ties keep the lowest ground-truth index
                if overlap > scores[i] {
                    scores[i] = overlap;
                    assigned[i] = Some(k);
                }
            }
        }

        if self.policy == MatchPolicy::EnsureCoverage {
            for (k, gt_box) in gt.iter().enumerate() {
                let best = anchor_boxes
                    .iter()
                    .map(|anchor| anchor.iou(gt_box))
                    .enumerate()
                    .fold(None, |best: Option<(usize, f32)>, (i, overlap)| match best {
                        Some((_, best_overlap)) if best_overlap >= overlap => best,
                        _ if overlap > 0.0 => Some((i, overlap)),
                        _ => best,
                    });

                if let Some((i, _)) = best {
                    scores[i] = FORCED_MATCH_SCORE;
                    assigned[i] = Some(k);
                }
            }
        }

        let mut matched = Array2::<f32>::zeros((num_anchors, 4));
        for (mut row, gt_index) in matched.axis_iter_mut(Axis(0)).zip(&assigned) {
            let bbox = gt_index.map_or_else(Bbox::unit, |k| gt[k]);
            row.assign(&Array1::from_vec(<[f32; 4]>::from(bbox).to_vec()));
        }

        let offsets = self.coder.encode(matched.view(), anchors)?;
        let positive = scores.mapv(|s| s > self.threshold);

        Ok(MatchResult {
            scores,
            offsets,
            positive,
            assigned,
        })
    }

    /// Match every image of a batch independently.
    pub fn match_batch(
        &self,
        anchors: ArrayView2<f32>,
        gt_boxes: &[Array2<f32>],
    ) -> Result<Vec<MatchResult>> {
        gt_boxes
            .iter()
            .map(|gt| self.match_anchors(anchors, gt.view()))
            .collect()
    }
}

fn check_columns(what: &'static str, array: ArrayView2<f32>) -> Result<()> {
    if array.ncols() == 4 {
        return Ok(());
    }

    Err(Error::Shape {
        what,
        expected: vec![array.nrows(), 4],
        found: array.shape().to_vec(),
    })
}
