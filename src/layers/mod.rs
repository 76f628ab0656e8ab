//! # Neural Network Layers

pub mod conv;
pub mod drop;
