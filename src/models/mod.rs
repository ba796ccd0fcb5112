//! Neural network models
//!
//! - `vocoder`: HiFi-GAN vocoders for speech units and mel-spectrograms

pub mod vocoder;
