#![warn(missing_docs)]
//!# bimm-cvt - Convolutional Vision Transformers for Burn
//!
//! A CvT image backbone: strided convolutional token embeddings feeding
//! stages of self-attention whose query/key/value projections are
//! depthwise-separable convolutions over the token grid.
//!
//! ```rust,no_run
//! use bimm_cvt::models::cvt::transformer::CvtConfig;
//! use burn::backend::NdArray;
//! use burn::prelude::Tensor;
//!
//! let device = Default::default();
//! let model = CvtConfig::new(3).init::<NdArray>(&device);
//! let images = Tensor::<NdArray, 4>::ones([1, 3, 224, 224], &device);
//! assert_eq!(model.forward(images).dims(), [1, 384]);
//! ```

/// Test-only macro import.
#[cfg(test)]
#[allow(unused_imports)]
#[macro_use]
extern crate hamcrest;

#[cfg(test)]
#[allow(dead_code)]
pub(crate) mod testing;

pub mod layers;
pub mod models;
pub mod utility;
