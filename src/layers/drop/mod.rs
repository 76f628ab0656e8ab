//! # Stochastic Depth Layers

pub mod path;
pub mod rate_table;
