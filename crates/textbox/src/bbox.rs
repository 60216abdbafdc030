/// A type-safe bounding box in relative image coordinates.
///
/// It is a wrapper around a tuple of four `f32` values. The type parameter `T` specifies the
/// format of the box and is used to enforce type safety. All formats put the vertical coordinate
/// before the horizontal one, matching the layout of the anchor and prediction arrays.
///
/// # Conversion
///
/// The bounding box can be converted between formats using the [`ConvertBbox`] trait.
///
/// ```
/// use textbox::bbox::*;
///
/// let corners = Bbox::yxyx(0.25, 0.5, 0.75, 1.0);
/// let center: Bbox<Cyxhw> = corners.convert();
///
/// assert_eq!(center.inner, (0.5, 0.75, 0.5, 0.5));
/// ```
///
/// # Formats
///
/// - [`Yxyx`] (ymin, xmin, ymax, xmax)
/// - [`Cyxhw`] (center_y, center_x, height, width)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bbox<T> {
    pub inner: (f32, f32, f32, f32),
    _marker: std::marker::PhantomData<T>,
}

impl<T> Bbox<T> {
    /// Create a new bounding box from the given coordinates.
    fn new(bbox: (f32, f32, f32, f32)) -> Self {
        Bbox {
            inner: bbox,
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T> Bbox<T>
where
    Bbox<T>: ConvertBbox<Yxyx>,
{
    /// Compute the area of the bounding box.
    ///
    /// Boxes with inverted corners have an area of `0.0`.
    pub fn area(&self) -> f32 {
        let (y1, x1, y2, x2) = ConvertBbox::<Yxyx>::convert(self).inner;
        (y2 - y1).max(0.0) * (x2 - x1).max(0.0)
    }

    /// Compute the intersection area between two bounding boxes.
    ///
    /// If the bounding boxes do not overlap, the intersection area is `0.0`.
    pub fn intersection<S>(&self, other: &S) -> f32
    where
        S: ConvertBbox<Yxyx>,
    {
        let (y1, x1, y2, x2) = ConvertBbox::<Yxyx>::convert(self).inner;
        let (y3, x3, y4, x4) = ConvertBbox::<Yxyx>::convert(other).inner;

        let h = (y2.min(y4) - y1.max(y3)).max(0.0);
        let w = (x2.min(x4) - x1.max(x3)).max(0.0);

        h * w
    }

    /// Compute the union area between two bounding boxes.
    pub fn union<S>(&self, other: &S) -> f32
    where
        S: ConvertBbox<Yxyx>,
    {
        let area1 = self.area();
        let area2 = ConvertBbox::<Yxyx>::convert(other).area();
        area1 + area2 - self.intersection(other)
    }

    /// Compute the intersection over union (IoU) between two bounding boxes.
    ///
    /// The IoU against a zero-area box is `0.0`.
    pub fn iou<S>(&self, other: &S) -> f32
    where
        S: ConvertBbox<Yxyx>,
    {
        let union = self.union(other);
        if union <= 0.0 {
            return 0.0;
        }

        self.intersection(other) / union
    }
}

impl<T> From<Bbox<T>> for (f32, f32, f32, f32) {
    fn from(bbox: Bbox<T>) -> Self {
        bbox.inner
    }
}

impl<T> From<Bbox<T>> for [f32; 4] {
    fn from(bbox: Bbox<T>) -> Self {
        let (a, b, c, d) = bbox.inner;
        [a, b, c, d]
    }
}

/// Trait for converting a bounding box to a different representation.
pub trait ConvertBbox<T> {
    fn convert(&self) -> Bbox<T>;
}

/// Marker type for bounding boxes given by their top-left and bottom-right corners.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Yxyx;

impl Bbox<Yxyx> {
    /// Create a bounding box from the coordinates of the top-left and bottom-right corners.
    #[must_use]
    pub fn yxyx(ymin: f32, xmin: f32, ymax: f32, xmax: f32) -> Bbox<Yxyx> {
        Bbox::new((ymin, xmin, ymax, xmax))
    }

    /// Create a bounding box from a row of four coordinates.
    ///
    /// # Panics
    ///
    /// Panics if the row has fewer than four elements.
    #[must_use]
    pub fn from_row(row: ndarray::ArrayView1<f32>) -> Bbox<Yxyx> {
        Bbox::new((row[0], row[1], row[2], row[3]))
    }

    /// The full image, `(0, 0, 1, 1)`.
    #[must_use]
    pub fn unit() -> Bbox<Yxyx> {
        Bbox::new((0.0, 0.0, 1.0, 1.0))
    }

    /// Clip the bounding box into `region`.
    #[must_use]
    pub fn clip(&self, region: &Bbox<Yxyx>) -> Bbox<Yxyx> {
        let (ymin, xmin, ymax, xmax) = self.inner;
        let (ry1, rx1, ry2, rx2) = region.inner;

        Bbox::new((ymin.max(ry1), xmin.max(rx1), ymax.min(ry2), xmax.min(rx2)))
    }

    /// Mirror the bounding box horizontally within the unit image.
    #[must_use]
    pub fn flip_left_right(&self) -> Bbox<Yxyx> {
        let (ymin, xmin, ymax, xmax) = self.inner;
        Bbox::new((ymin, 1.0 - xmax, ymax, 1.0 - xmin))
    }
}

impl ConvertBbox<Yxyx> for Bbox<Yxyx> {
    fn convert(&self) -> Bbox<Yxyx> {
        *self
    }
}

impl ConvertBbox<Cyxhw> for Bbox<Yxyx> {
    fn convert(&self) -> Bbox<Cyxhw> {
        let (y1, x1, y2, x2) = self.inner;
        Bbox::new(((y1 + y2) / 2.0, (x1 + x2) / 2.0, y2 - y1, x2 - x1))
    }
}

/// Marker type for bounding boxes given by their center, height and width.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cyxhw;

impl Bbox<Cyxhw> {
    /// Create a bounding box from the coordinates of the center and the height and width.
    #[must_use]
    pub fn cyxhw(cy: f32, cx: f32, h: f32, w: f32) -> Bbox<Cyxhw> {
        Bbox::new((cy, cx, h, w))
    }

    /// Create a bounding box from a row of four coordinates.
    ///
    /// # Panics
    ///
    /// Panics if the row has fewer than four elements.
    #[must_use]
    pub fn from_row(row: ndarray::ArrayView1<f32>) -> Bbox<Cyxhw> {
        Bbox::new((row[0], row[1], row[2], row[3]))
    }
}

impl ConvertBbox<Yxyx> for Bbox<Cyxhw> {
    fn convert(&self) -> Bbox<Yxyx> {
        let (cy, cx, h, w) = self.inner;
        Bbox::new((cy - h / 2.0, cx - w / 2.0, cy + h / 2.0, cx + w / 2.0))
    }
}

impl ConvertBbox<Cyxhw> for Bbox<Cyxhw> {
    fn convert(&self) -> Bbox<Cyxhw> {
        *self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iou_yxyx() {
        let bbox1 = Bbox::yxyx(0.0, 0.0, 10.0, 10.0);
        let bbox2 = Bbox::yxyx(5.0, 5.0, 15.0, 15.0);

        assert_eq!(bbox1.intersection(&bbox2), 25.0);
        assert_eq!(bbox1.union(&bbox2), 175.0);
        assert_eq!(bbox1.iou(&bbox2), 25.0 / 175.0);
    }

    #[test]
    fn iou_cyxhw() {
        let bbox1 = Bbox::cyxhw(5.0, 5.0, 10.0, 10.0);
        let bbox2 = Bbox::cyxhw(10.0, 10.0, 10.0, 10.0);

        assert_eq!(bbox1.intersection(&bbox2), 25.0);
        assert_eq!(bbox1.union(&bbox2), 175.0);
        assert_eq!(bbox1.iou(&bbox2), 25.0 / 175.0);
    }

    #[test]
    fn iou_with_zero_area_box_is_zero() {
        let bbox = Bbox::yxyx(0.2, 0.2, 0.4, 0.4);
        let line = Bbox::yxyx(0.3, 0.2, 0.3, 0.4);
        let point = Bbox::yxyx(0.3, 0.3, 0.3, 0.3);

        assert_eq!(bbox.iou(&line), 0.0);
        assert_eq!(point.iou(&point), 0.0);
    }

    #[test]
    fn disjoint_boxes_do_not_intersect() {
        let bbox1 = Bbox::yxyx(0.0, 0.0, 0.1, 0.1);
        let bbox2 = Bbox::yxyx(0.5, 0.5, 0.6, 0.6);

        assert_eq!(bbox1.intersection(&bbox2), 0.0);
        assert_eq!(bbox1.iou(&bbox2), 0.0);
    }

    #[test]
    fn convert_round_trip() {
        let corners = Bbox::yxyx(0.1, 0.2, 0.5, 0.9);
        let center: Bbox<Cyxhw> = corners.convert();
        let back: Bbox<Yxyx> = center.convert();

        let (a, b) = (<[f32; 4]>::from(corners), <[f32; 4]>::from(back));
        for (x, y) in a.iter().zip(b) {
            assert!((x - y).abs() < 1e-6);
        }
    }

    #[test]
    fn clip_into_region() {
        let bbox = Bbox::yxyx(-0.1, 0.2, 0.5, 1.3);
        let clipped = bbox.clip(&Bbox::unit());

        assert_eq!(clipped.inner, (0.0, 0.2, 0.5, 1.0));
    }

    #[test]
    fn flip_is_an_involution() {
        let bbox = Bbox::yxyx(0.1, 0.2, 0.5, 0.7);
        let flipped = bbox.flip_left_right();

        assert!((flipped.inner.1 - 0.3).abs() < 1e-6);
        assert!((flipped.inner.3 - 0.8).abs() < 1e-6);

        let back = flipped.flip_left_right();
        assert!((back.inner.1 - 0.2).abs() < 1e-6);
        assert!((back.inner.3 - 0.7).abs() < 1e-6);
    }
}
