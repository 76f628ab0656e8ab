//! # CvT: Convolutional Vision Transformer
//!
//! CvT: Introducing Convolutions to Vision Transformers (<https://arxiv.org/abs/2103.15808>)
//!
//! Each stage embeds its input with a strided convolution, then runs a
//! pre-norm transformer whose attention projections are depthwise-separable
//! convolutions over the token grid. The last stage carries a class token.

pub mod block;
pub mod block_sequence;
pub mod conv_attention;
pub mod error;
pub mod feed_forward;
pub mod pooling;
pub mod pre_norm;
pub mod transformer;

pub use error::CvtConfigError;
pub use pooling::PoolMode;
pub use transformer::{Cvt, CvtConfig, CvtMeta, CvtPlan, StageConfig};
