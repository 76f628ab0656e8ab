//! # Utility Modules

pub mod results;
