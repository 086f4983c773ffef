//! Macro implementations

pub mod output_shape;

pub use output_shape::derive_output_shape;
