//! Auxiliary sensors fused into the motion prediction

pub mod encoder;

pub use encoder::{EncoderConfig, EncoderReading};
