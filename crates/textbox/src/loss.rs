//! Training loss with hard-negative mining.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Zip, concatenate};

use crate::error::{Error, Result};

/// Default number of hard negatives kept per positive.
pub const DEFAULT_NEGATIVE_RATIO: f32 = 3.0;

/// The flattened network outputs and targets of one image.
///
/// All arrays hold one row per anchor, in the order produced by [`crate::anchor::Anchors::boxes`].
#[derive(Debug, Clone, Copy)]
pub struct LossInputs<'a> {
    /// Classification logits, `(N, 2)`.
    pub logits: ArrayView2<'a, f32>,
    /// Best ground-truth overlap of every anchor, `(N,)`.
    pub gscores: ArrayView1<'a, f32>,
    /// Predicted offsets, `(N, 4)`.
    pub localizations: ArrayView2<'a, f32>,
    /// Target offsets, `(N, 4)`.
    pub glocalizations: ArrayView2<'a, f32>,
}

impl<'a> LossInputs<'a> {
    #[must_use]
    pub fn new(
        logits: ArrayView2<'a, f32>,
        gscores: ArrayView1<'a, f32>,
        localizations: ArrayView2<'a, f32>,
        glocalizations: ArrayView2<'a, f32>,
    ) -> Self {
        Self {
            logits,
            gscores,
            localizations,
            glocalizations,
        }
    }

    /// Number of anchors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.gscores.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.gscores.is_empty()
    }

    fn check(&self) -> Result<()> {
        let n = self.len();

        for (what, array, cols) in [
            ("logits", self.logits, 2),
            ("localizations", self.localizations, 4),
            ("glocalizations", self.glocalizations, 4),
        ] {
            if array.dim() != (n, cols) {
                return Err(Error::Shape {
                    what,
                    expected: vec![n, cols],
                    found: array.shape().to_vec(),
                });
            }
        }

        Ok(())
    }
}

/// Every term of the loss, so they can be monitored individually.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossTerms {
    /// Number of positives, plus one per image.
    pub n_pos: usize,
    /// Number of negatives that contributed to the loss.
    pub n_neg: usize,
    /// Mean cross-entropy over the positives.
    pub cross_pos: f32,
    /// Mean cross-entropy over the mined negatives.
    pub cross_neg: f32,
    /// `cross_pos + cross_neg`.
    pub cross: f32,
    /// Mean smooth-L1 localization loss over the positives.
    pub loc: f32,
    /// `loc + cross`.
    pub total: f32,
}

/// Assembles the detector loss from flattened predictions and matched targets.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossAssembler {
    pub match_threshold: f32,
    /// Hard negatives kept per positive.
    pub negative_ratio: f32,
    /// Weight of the localization loss.
    pub alpha: f32,
}

impl Default for LossAssembler {
    fn default() -> Self {
        Self::new(0.5)
    }
}

/// The per-image result of mining, before it is reduced over the batch.
struct Mined {
    cross: Array1<f32>,
    positive: Array1<bool>,
    negative: Array1<bool>,
    loc: Array2<f32>,
    n_pos: usize,
}

impl LossAssembler {
    #[must_use]
    pub fn new(match_threshold: f32) -> Self {
        Self {
            match_threshold,
            negative_ratio: DEFAULT_NEGATIVE_RATIO,
            alpha: 1.0,
        }
    }

    /// Compute the loss of a single image.
    pub fn compute(&self, inputs: &LossInputs) -> Result<LossTerms> {
        self.compute_batch(std::slice::from_ref(inputs))
    }

    /// Compute the loss of a batch.
    ///
    /// Hard negatives are mined within every image, the means are then taken over all anchors
    /// of the batch.
    pub fn compute_batch(&self, batch: &[LossInputs]) -> Result<LossTerms> {
        if self.negative_ratio.is_nan() || self.negative_ratio < 0.0 {
            return Err(Error::InvalidArgument(format!(
                "negative ratio must be non-negative, got {}",
                self.negative_ratio
            )));
        }

        let mined = batch
            .iter()
            .map(|inputs| self.mine(inputs))
            .collect::<Result<Vec<_>>>()?;

        let cross = concat1(mined.iter().map(|m| m.cross.view()))?;
        let positive = concat1(mined.iter().map(|m| m.positive.view()))?;
        let negative = concat1(mined.iter().map(|m| m.negative.view()))?;
        let loc_views = mined.iter().map(|m| m.loc.view()).collect::<Vec<_>>();
        let loc = if loc_views.is_empty() {
            Array2::zeros((0, 4))
        } else {
            concatenate(Axis(0), &loc_views)?
        };

        let positive_weights = positive.mapv(|p| if p { 1.0 } else { 0.0 });
        let negative_weights = negative.mapv(|n| if n { 1.0 } else { 0.0 });
        let loc_weights = (self.alpha * &positive_weights).insert_axis(Axis(1));

        let cross_pos = weighted_mean(cross.view(), positive_weights.view());
        let cross_neg = weighted_mean(cross.view(), negative_weights.view());
        let loc = weighted_mean(
            loc.view(),
            loc_weights.broadcast(loc.dim()).ok_or(Error::Shape {
                what: "localization weights",
                expected: vec![loc.nrows(), 4],
                found: loc_weights.shape().to_vec(),
            })?,
        );

        let cross = cross_pos + cross_neg;
        let terms = LossTerms {
            n_pos: mined.iter().map(|m| m.n_pos).sum(),
            n_neg: negative.iter().filter(|n| **n).count(),
            cross_pos,
            cross_neg,
            cross,
            loc,
            total: loc + cross,
        };

        tracing::trace!(
            images = batch.len(),
            n_pos = terms.n_pos,
            n_neg = terms.n_neg,
            cross_pos = terms.cross_pos,
            cross_neg = terms.cross_neg,
            loc = terms.loc,
            total = terms.total,
            "computed loss"
        );

        Ok(terms)
    }

    fn mine(&self, inputs: &LossInputs) -> Result<Mined> {
        inputs.check()?;

        let positive = inputs.gscores.mapv(|s| s > self.match_threshold);
        let negative = inputs.gscores.mapv(|s| s <= self.match_threshold);
        let n_pos = positive.iter().filter(|p| **p).count() + 1;

        if n_pos == 1 {
            tracing::trace!("image without positive anchors");
        }

        let cross = sparse_cross_entropy(inputs.logits, positive.view());

        let candidates = Zip::from(&cross)
            .and(&positive)
            .map_collect(|&loss, &p| if p { 0.0 } else { loss });

        let k = ((self.negative_ratio * n_pos as f32).floor() as usize).min(inputs.len());
        let negative = hard_negatives(candidates.view(), negative.view(), k);

        let loc = smooth_l1(&(&inputs.localizations - &inputs.glocalizations));

        Ok(Mined {
            cross,
            positive,
            negative,
            loc,
            n_pos,
        })
    }
}

/// Select the hard negatives among `negative` anchors.
///
/// The `k` largest losses of negative anchors are selected; every negative whose loss is at least
/// the smallest selected loss is kept, so ties may keep more than `k` anchors.
#[must_use]
pub fn hard_negatives(loss: ArrayView1<f32>, negative: ArrayView1<bool>, k: usize) -> Array1<bool> {
    let mut candidates = loss
        .iter()
        .zip(negative)
        .filter_map(|(&l, &n)| n.then_some(l))
        .collect::<Vec<_>>();

    let k = k.min(candidates.len());
    if k == 0 {
        return Array1::from_elem(loss.len(), false);
    }

    candidates.sort_unstable_by(|a, b| b.total_cmp(a));
    let min_selected = candidates[k - 1];

    Zip::from(&loss)
        .and(&negative)
        .map_collect(|&l, &n| n && l >= min_selected)
}

/// Softmax cross-entropy of two-class `logits` against the binary `labels`, per row.
///
/// Computed in log-sum-exp form; non-finite logits propagate.
#[must_use]
pub fn sparse_cross_entropy(logits: ArrayView2<f32>, labels: ArrayView1<bool>) -> Array1<f32> {
    Zip::from(logits.rows())
        .and(&labels)
        .map_collect(|row, &label| {
            let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
            let log_sum_exp = max + row.mapv(|v| (v - max).exp()).sum().ln();
            log_sum_exp - row[usize::from(label)]
        })
}

/// Smooth-L1 of every element: `0.5 x²` for `|x| < 1`, `|x| - 0.5` otherwise.
#[must_use]
pub fn smooth_l1(x: &Array2<f32>) -> Array2<f32> {
    x.mapv(|v| {
        let abs = v.abs();
        if abs < 1.0 { 0.5 * v * v } else { abs - 0.5 }
    })
}

/// `sum(loss * weights) / count(weights != 0)`, or `0` if every weight is zero.
fn weighted_mean<D: ndarray::Dimension>(
    loss: ndarray::ArrayView<f32, D>,
    weights: ndarray::ArrayView<f32, D>,
) -> f32 {
    let present = weights.iter().filter(|w| **w != 0.0).count();
    if present == 0 {
        return 0.0;
    }

    let sum = Zip::from(&loss)
        .and(&weights)
        .fold(0.0, |acc, &l, &w| acc + l * w);

    sum / present as f32
}

fn concat1<'a, T: Clone + 'a>(
    views: impl Iterator<Item = ArrayView1<'a, T>>,
) -> Result<Array1<T>> {
    let views = views.collect::<Vec<_>>();
    if views.is_empty() {
        return Ok(Array1::from_vec(Vec::new()));
    }

    Ok(concatenate(Axis(0), &views)?)
}
