//! See [`Error`].

use miette::Diagnostic;
use thiserror::Error;

/// Error types for this crate.
#[derive(Debug, Error, Diagnostic)]
pub enum Error {
    #[error("`{field}` has {found} entries, expected {expected} (one per feature layer)")]
    #[diagnostic(help("every per-layer setting must list exactly one entry per `feat_layers` item"))]
    LengthMismatch {
        field: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Unexpected shape for {what}: expected {expected:?}, found {found:?}")]
    Shape {
        what: &'static str,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("Feature layer `{layer}` has shape {found:?}, configured as {expected:?}")]
    FeatureShape {
        layer: String,
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error("Feature layer `{0}` is not produced by the backbone")]
    UnknownLayer(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Failed to load configuration")]
    Config(#[from] odal::Error),

    #[error("Failed to wrap image buffer for resizing")]
    ImageBuffer(#[from] fast_image_resize::ImageBufferError),

    #[error("Failed to resize image")]
    Resize(#[from] fast_image_resize::ResizeError),

    #[error("Failed to reshape array")]
    ArrayShape(#[from] ndarray::ShapeError),
}

/// Type alias for [`Result<T, Error>`].
pub type Result<T> = std::result::Result<T, Error>;
