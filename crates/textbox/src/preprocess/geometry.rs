//! Geometric transforms of an image together with its relative bounding boxes.

use fast_image_resize::{
    self as fir, FilterType, ResizeAlg, ResizeOptions, Resizer,
    images::{Image, ImageRef},
    pixels::F32x3,
};
use ndarray::{Array2, Array3, ArrayView2, ArrayView3, Axis, s};
use rand::Rng;

use crate::error::{Error, Result};

/// Mirror the image horizontally, along with its `(ymin, xmin, ymax, xmax)` boxes.
#[must_use]
pub fn flip_left_right(
    image: ArrayView3<f32>,
    boxes: ArrayView2<f32>,
) -> (Array3<f32>, Array2<f32>) {
    let flipped = image.slice(s![.., ..;-1, ..]).to_owned();

    let mut flipped_boxes = boxes.to_owned();
    for mut row in flipped_boxes.axis_iter_mut(Axis(0)) {
        let (xmin, xmax) = (row[1], row[3]);
        row[1] = 1.0 - xmax;
        row[3] = 1.0 - xmin;
    }

    (flipped, flipped_boxes)
}

/// Flip the image and its boxes with probability 0.5.
pub fn random_flip_left_right<R: Rng>(
    rng: &mut R,
    image: ArrayView3<f32>,
    boxes: ArrayView2<f32>,
) -> (Array3<f32>, Array2<f32>) {
    if rng.random_bool(0.5) {
        flip_left_right(image, boxes)
    } else {
        (image.to_owned(), boxes.to_owned())
    }
}

/// Move relative boxes from an image of `(height, width)` into a target canvas of
/// `(target_height, target_width)`, where the image is placed at `(offset_y, offset_x)`.
///
/// Negative offsets describe a crop.
#[must_use]
pub fn bboxes_crop_or_pad(
    boxes: ArrayView2<f32>,
    (height, width): (usize, usize),
    (offset_y, offset_x): (isize, isize),
    (target_height, target_width): (usize, usize),
) -> Array2<f32> {
    let (height, width, offset_y, offset_x, target_height, target_width) = (
        height as f32,
        width as f32,
        offset_y as f32,
        offset_x as f32,
        target_height as f32,
        target_width as f32,
    );

    let mut moved = boxes.to_owned();
    for mut row in moved.axis_iter_mut(Axis(0)) {
        row[0] = (row[0] * height + offset_y) / target_height;
        row[1] = (row[1] * width + offset_x) / target_width;
        row[2] = (row[2] * height + offset_y) / target_height;
        row[3] = (row[3] * width + offset_x) / target_width;
    }

    moved
}

/// Centrally crop and/or zero-pad the image to `(target_height, target_width)`, adjusting the
/// boxes to the new canvas.
pub fn resize_with_crop_or_pad(
    image: ArrayView3<f32>,
    boxes: ArrayView2<f32>,
    (target_height, target_width): (usize, usize),
) -> Result<(Array3<f32>, Array2<f32>)> {
    if target_height == 0 || target_width == 0 {
        return Err(Error::InvalidArgument(format!(
            "target shape must be non-zero, got {:?}",
            (target_height, target_width)
        )));
    }

    let (height, width, channels) = image.dim();

    let crop_y = height.saturating_sub(target_height) / 2;
    let crop_x = width.saturating_sub(target_width) / 2;
    let pad_y = target_height.saturating_sub(height) / 2;
    let pad_x = target_width.saturating_sub(width) / 2;

    let kept_height = height.min(target_height);
    let kept_width = width.min(target_width);

    let cropped = image.slice(s![crop_y..crop_y + kept_height, crop_x..crop_x + kept_width, ..]);
    let mut resized = Array3::zeros((target_height, target_width, channels));
    resized
        .slice_mut(s![pad_y..pad_y + kept_height, pad_x..pad_x + kept_width, ..])
        .assign(&cropped);

    let boxes = bboxes_crop_or_pad(
        boxes,
        (height, width),
        (signed(pad_y) - signed(crop_y), signed(pad_x) - signed(crop_x)),
        (target_height, target_width),
    );

    Ok((resized, boxes))
}

fn signed(value: usize) -> isize {
    isize::try_from(value).unwrap_or(isize::MAX)
}

/// Resize an RGB image with bilinear interpolation.
///
/// Relative boxes are unaffected by resizing.
pub fn resize_bilinear(
    image: ArrayView3<f32>,
    (target_height, target_width): (usize, usize),
) -> Result<Array3<f32>> {
    let (height, width, channels) = image.dim();
    if channels != 3 {
        return Err(Error::Shape {
            what: "image",
            expected: vec![height, width, 3],
            found: vec![height, width, channels],
        });
    }
    if target_height == 0 || target_width == 0 || height == 0 || width == 0 {
        return Err(Error::InvalidArgument(format!(
            "cannot resize {:?} to {:?}",
            (height, width),
            (target_height, target_width)
        )));
    }

    let pixels = image
        .rows()
        .into_iter()
        .map(|rgb| F32x3::new([rgb[0], rgb[1], rgb[2]]))
        .collect::<Vec<_>>();
    let src_image = ImageRef::from_pixels(dimension(width)?, dimension(height)?, &pixels)?;
    let mut dst_image = Image::new(
        dimension(target_width)?,
        dimension(target_height)?,
        fir::PixelType::F32x3,
    );

    Resizer::new().resize(
        &src_image,
        &mut dst_image,
        &ResizeOptions::new().resize_alg(ResizeAlg::Convolution(FilterType::Bilinear)),
    )?;

    let values = dst_image
        .buffer()
        .chunks_exact(size_of::<f32>())
        .map(|bytes| f32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
        .collect::<Vec<_>>();

    Ok(Array3::from_shape_vec(
        (target_height, target_width, 3),
        values,
    )?)
}

fn dimension(value: usize) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| Error::InvalidArgument(format!("image dimension {value} is too large")))
}
