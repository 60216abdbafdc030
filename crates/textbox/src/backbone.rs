//! Topology of the feature extractor, as a static list of layer descriptors.
//!
//! Only spatial shapes are modelled here; the numeric layers live with the inference runtime.
//! The shapes are what anchor generation depends on, so [`Backbone::check`] verifies them against
//! the configured feature layers.

use crate::{
    anchor::NUM_VARIANTS,
    config::TextboxParams,
    error::{Error, Result},
    predictions::NUM_COORDINATES,
};

/// Padding scheme of a convolution or pooling layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Padding {
    /// Output size is `ceil(n / stride)`.
    Same,
    /// Output size is `ceil((n - effective_kernel + 1) / stride)`.
    Valid,
}

/// A single operation of the backbone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    Conv {
        out: usize,
        kernel: (usize, usize),
        stride: usize,
        dilation: usize,
        padding: Padding,
    },
    MaxPool {
        kernel: (usize, usize),
        stride: usize,
        padding: Padding,
    },
}

impl Layer {
    /// A stride 1, undilated convolution with `SAME` padding.
    #[must_use]
    pub const fn conv(out: usize, kernel: (usize, usize)) -> Self {
        Layer::Conv {
            out,
            kernel,
            stride: 1,
            dilation: 1,
            padding: Padding::Same,
        }
    }

    /// A 2x2 stride 2 max pool.
    #[must_use]
    pub const fn pool(padding: Padding) -> Self {
        Layer::MaxPool {
            kernel: (2, 2),
            stride: 2,
            padding,
        }
    }

    /// Spatial output shape for an input of `(height, width)`.
    pub fn output_shape(&self, (height, width): (usize, usize)) -> Result<(usize, usize)> {
        let (kernel, stride, dilation, padding) = match *self {
            Layer::Conv {
                kernel,
                stride,
                dilation,
                padding,
                ..
            } => (kernel, stride, dilation, padding),
            Layer::MaxPool {
                kernel,
                stride,
                padding,
            } => (kernel, stride, 1, padding),
        };

        if stride == 0 || dilation == 0 || kernel.0 == 0 || kernel.1 == 0 {
            return Err(Error::InvalidArgument(format!(
                "kernel, stride and dilation must be non-zero in {self:?}"
            )));
        }

        let extent = |n: usize, k: usize| -> Result<usize> {
            match padding {
                Padding::Same => Ok(n.div_ceil(stride)),
                Padding::Valid => {
                    let effective = (k - 1) * dilation + 1;
                    if n < effective {
                        return Err(Error::InvalidArgument(format!(
                            "input extent {n} is smaller than the effective kernel {effective}"
                        )));
                    }
                    Ok((n - effective + 1).div_ceil(stride))
                }
            }
        };

        Ok((extent(height, kernel.0)?, extent(width, kernel.1)?))
    }
}

/// A named group of layers, whose output is a feature map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub name: String,
    pub layers: Vec<Layer>,
}

impl Block {
    pub fn new(name: impl Into<String>, layers: impl IntoIterator<Item = Layer>) -> Self {
        Self {
            name: name.into(),
            layers: layers.into_iter().collect(),
        }
    }

    /// Number of output channels, taken from the last convolution.
    #[must_use]
    pub fn out_channels(&self) -> Option<usize> {
        self.layers.iter().rev().find_map(|layer| match layer {
            Layer::Conv { out, .. } => Some(*out),
            Layer::MaxPool { .. } => None,
        })
    }
}

/// The backbone, as an ordered sequence of blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backbone {
    blocks: Vec<Block>,
}

impl Backbone {
    #[must_use]
    pub fn new(blocks: Vec<Block>) -> Self {
        Self { blocks }
    }

    /// The VGG-16 based topology of the 300x300 text detector.
    #[must_use]
    pub fn textbox300() -> Self {
        use Layer::{Conv, MaxPool};
        use Padding::{Same, Valid};

        let conv = Layer::conv;
        let strided = |out| Conv {
            out,
            kernel: (3, 3),
            stride: 2,
            dilation: 1,
            padding: Same,
        };

        Self::new(vec![
            Block::new("conv1", [conv(64, (3, 3)), conv(64, (3, 3))]),
            Block::new(
                "conv2",
                [Layer::pool(Valid), conv(128, (3, 3)), conv(128, (3, 3))],
            ),
            Block::new(
                "conv3",
                [
                    Layer::pool(Valid),
                    conv(256, (3, 3)),
                    conv(256, (3, 3)),
                    conv(256, (3, 3)),
                ],
            ),
            Block::new(
                "conv4",
                [
                    Layer::pool(Same),
                    conv(512, (3, 3)),
                    conv(512, (3, 3)),
                    conv(512, (3, 3)),
                ],
            ),
            Block::new(
                "conv5",
                [
                    Layer::pool(Valid),
                    conv(512, (3, 3)),
                    conv(512, (3, 3)),
                    conv(512, (3, 3)),
                ],
            ),
            Block::new(
                "conv6",
                [
                    MaxPool {
                        kernel: (3, 3),
                        stride: 1,
                        padding: Same,
                    },
                    Conv {
                        out: 1024,
                        kernel: (3, 3),
                        stride: 1,
                        dilation: 6,
                        padding: Same,
                    },
                ],
            ),
            Block::new("conv7", [conv(1024, (1, 1))]),
            Block::new("conv8", [conv(256, (1, 1)), strided(512)]),
            Block::new("conv9", [conv(128, (1, 1)), strided(256)]),
            Block::new("conv10", [conv(128, (1, 1)), strided(256)]),
            Block::new(
                "global",
                [
                    conv(128, (1, 1)),
                    Conv {
                        out: 256,
                        kernel: (3, 3),
                        stride: 1,
                        dilation: 1,
                        padding: Valid,
                    },
                ],
            ),
        ])
    }

    #[must_use]
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Look up a block by name.
    #[must_use]
    pub fn block(&self, name: &str) -> Option<&Block> {
        self.blocks.iter().find(|block| block.name == name)
    }

    /// Propagate an input of `image_shape` through every layer and return the spatial shape of
    /// every block's output, in order.
    pub fn feature_shapes(
        &self,
        image_shape: (usize, usize),
    ) -> Result<Vec<(&str, (usize, usize))>> {
        let mut shape = image_shape;
        let mut shapes = Vec::with_capacity(self.blocks.len());

        for block in &self.blocks {
            for layer in &block.layers {
                shape = layer.output_shape(shape)?;
            }

            tracing::trace!(block = block.name.as_str(), ?shape, "propagated block");
            shapes.push((block.name.as_str(), shape));
        }

        Ok(shapes)
    }

    /// Verify that every configured feature layer is produced by this backbone with the
    /// configured shape.
    pub fn check(&self, params: &TextboxParams) -> Result<()> {
        let shapes = self.feature_shapes(params.image_shape)?;

        for (layer, &expected) in params.feat_layers.iter().zip(&params.feat_shapes) {
            let Some(&(_, found)) = shapes
                .iter()
                .find(|(name, _)| *name == layer.as_str())
            else {
                return Err(Error::UnknownLayer(layer.clone()));
            };

            if found != expected {
                return Err(Error::FeatureShape {
                    layer: layer.clone(),
                    expected,
                    found,
                });
            }
        }

        Ok(())
    }
}

/// The prediction heads attached to one feature layer.
#[derive(Debug, Clone, PartialEq)]
pub struct MultiboxHead {
    pub layer: String,
    /// Scale of the L2 normalization applied before the heads, if any.
    pub normalization: Option<f32>,
    /// Convolution predicting `2 * R * 4` box offsets per cell.
    pub loc: Layer,
    /// Convolution predicting `2 * R * num_classes` logits per cell.
    pub cls: Layer,
}

/// Describe the multibox heads of every feature layer.
///
/// Every head uses a `1x5` kernel with `SAME` padding, except on the last layer, which uses a
/// `1x1` kernel with `VALID` padding.
pub fn multibox_heads(params: &TextboxParams) -> Result<Vec<MultiboxHead>> {
    params.validate()?;

    let num_box = params.num_box();
    let last = params.num_layers() - 1;

    let heads = params
        .feat_layers
        .iter()
        .zip(&params.normalizations)
        .enumerate()
        .map(|(i, (layer, &normalization))| {
            let (kernel, padding) = if i == last {
                ((1, 1), Padding::Valid)
            } else {
                ((1, 5), Padding::Same)
            };
            let head = |out| Layer::Conv {
                out,
                kernel,
                stride: 1,
                dilation: 1,
                padding,
            };

            let normalization = (normalization > 0).then_some(normalization as f32);

            MultiboxHead {
                layer: layer.clone(),
                normalization,
                loc: head(NUM_VARIANTS * num_box * NUM_COORDINATES),
                cls: head(NUM_VARIANTS * num_box * params.num_classes),
            }
        })
        .collect();

    Ok(heads)
}
