//! # Models

pub mod cvt;
