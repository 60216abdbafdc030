use ndarray::{Array2, ArrayView2, Axis, stack};

use crate::{
    bbox::{Bbox, Cyxhw, Yxyx},
    error::{Error, Result},
};

/// Default scaling of `(dy, dx, dh, dw)`.
pub const DEFAULT_PRIOR_SCALING: [f32; 4] = [0.1, 0.1, 0.2, 0.2];

/// Utility that encodes boxes relative to anchors, and decodes the regression format output by
/// the model back into boxes.
///
/// Anchors are given as `(yc, xc, h, w)` rows, boxes as `(ymin, xmin, ymax, xmax)` rows, and codes
/// as `(dy, dx, dh, dw)` rows. Decoding is the exact inverse of encoding; no clamping is applied
/// before the exponent, so non-finite predictions stay non-finite.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoxCoder {
    /// The scaling applied to `(dy, dx, dh, dw)` respectively.
    pub prior_scaling: [f32; 4],
}

impl Default for BoxCoder {
    fn default() -> Self {
        Self::new(DEFAULT_PRIOR_SCALING)
    }
}

impl BoxCoder {
    /// Create a new [`BoxCoder`] with the given prior scaling.
    #[must_use]
    pub fn new(prior_scaling: [f32; 4]) -> Self {
        BoxCoder { prior_scaling }
    }

    /// Encode `boxes` relative to `anchors`, row by row.
    pub fn encode(&self, boxes: ArrayView2<f32>, anchors: ArrayView2<f32>) -> Result<Array2<f32>> {
        check_rows("boxes", boxes, anchors.nrows())?;
        check_rows("anchors", anchors, boxes.nrows())?;

        let [sy, sx, sh, sw] = self.prior_scaling;

        let heights = &boxes.column(2) - &boxes.column(0);
        let widths = &boxes.column(3) - &boxes.column(1);
        let center_y = &boxes.column(0) + &(0.5 * &heights);
        let center_x = &boxes.column(1) + &(0.5 * &widths);

        let anchor_y = anchors.column(0);
        let anchor_x = anchors.column(1);
        let anchor_h = anchors.column(2);
        let anchor_w = anchors.column(3);

        let dy = (&center_y - &anchor_y) / &anchor_h / sy;
        let dx = (&center_x - &anchor_x) / &anchor_w / sx;
        let dh = (&heights / &anchor_h).mapv(f32::ln) / sh;
        let dw = (&widths / &anchor_w).mapv(f32::ln) / sw;

        Ok(stack![Axis(1), dy, dx, dh, dw])
    }

    /// Decode the relative box predictions into `(ymin, xmin, ymax, xmax)` format.
    pub fn decode(
        &self,
        rel_codes: ArrayView2<f32>,
        anchors: ArrayView2<f32>,
    ) -> Result<Array2<f32>> {
        check_rows("rel_codes", rel_codes, anchors.nrows())?;
        check_rows("anchors", anchors, rel_codes.nrows())?;

        let [sy, sx, sh, sw] = self.prior_scaling;

        let anchor_y = anchors.column(0);
        let anchor_x = anchors.column(1);
        let anchor_h = anchors.column(2);
        let anchor_w = anchors.column(3);

        let pred_center_y = &rel_codes.column(0) * sy * &anchor_h + &anchor_y;
        let pred_center_x = &rel_codes.column(1) * sx * &anchor_w + &anchor_x;
        let pred_h = (&rel_codes.column(2) * sh).mapv(f32::exp) * &anchor_h;
        let pred_w = (&rel_codes.column(3) * sw).mapv(f32::exp) * &anchor_w;

        let half_h = pred_h / 2.0;
        let half_w = pred_w / 2.0;

        let ymin = &pred_center_y - &half_h;
        let xmin = &pred_center_x - &half_w;
        let ymax = &pred_center_y + &half_h;
        let xmax = &pred_center_x + &half_w;

        Ok(stack![Axis(1), ymin, xmin, ymax, xmax])
    }

    /// Encode a single box relative to a single anchor.
    #[must_use]
    pub fn encode_single(&self, bbox: &Bbox<Yxyx>, anchor: &Bbox<Cyxhw>) -> [f32; 4] {
        let [sy, sx, sh, sw] = self.prior_scaling;
        let (ymin, xmin, ymax, xmax) = bbox.inner;
        let (ay, ax, ah, aw) = anchor.inner;

        let (h, w) = (ymax - ymin, xmax - xmin);
        let (cy, cx) = (ymin + h / 2.0, xmin + w / 2.0);

        [
            (cy - ay) / ah / sy,
            (cx - ax) / aw / sx,
            (h / ah).ln() / sh,
            (w / aw).ln() / sw,
        ]
    }
}

fn check_rows(what: &'static str, array: ArrayView2<f32>, rows: usize) -> Result<()> {
    if array.dim() == (rows, 4) {
        return Ok(());
    }

    Err(Error::Shape {
        what,
        expected: vec![rows, 4],
        found: array.shape().to_vec(),
    })
}
