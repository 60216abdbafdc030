//! Single-shot detection of horizontal text boxes.
//!
//! The crate covers everything around the network itself: anchor generation, box encoding,
//! ground-truth matching, the training loss with hard negative mining, detection post-processing
//! and box-aware preprocessing. Network outputs are passed in as [`ndarray`] arrays.

pub mod anchor;
pub mod backbone;
pub mod bbox;
pub mod box_coder;
pub mod config;
pub mod detector;
pub mod error;
pub mod loss;
pub mod matcher;
pub mod meshgrid;
pub mod net;
pub mod predictions;
pub mod preprocess;

pub use anchor::{AnchorGenerator, Anchors, LayerAnchors};
pub use backbone::{Backbone, MultiboxHead};
pub use bbox::{Bbox, Cyxhw, Yxyx};
pub use box_coder::BoxCoder;
pub use config::TextboxParams;
pub use detector::{Detection, Detections, Detector};
pub use error::{Error, Result};
pub use loss::{LossAssembler, LossInputs, LossTerms};
pub use matcher::{MatchPolicy, MatchResult, Matcher};
pub use net::TextboxNet;
pub use predictions::LayerPredictions;
pub use preprocess::Preprocessor;
