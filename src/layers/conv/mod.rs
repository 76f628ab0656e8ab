//! # Convolutional Layers

pub mod sep_conv;
pub mod token_embed;
