//! HiFi-GAN vocoders
//!
//! Unit vocoders ([`Vocoder`] over [`CodeGenerator`]) turn discrete speech
//! units into 16 kHz waveforms; mel vocoders ([`MelGenerator`]) turn
//! mel-spectrograms into waveforms. Both share the [`Generator`] upsampling
//! stack. Models are built from configurations by the builders and loaded
//! from asset cards by the loader functions.

pub mod builder;
pub mod codehifigan;
pub mod hifigan;
pub mod loader;
pub mod melhifigan;
#[allow(clippy::module_inception)]
pub mod vocoder;

pub use builder::{MelVocoderBuilder, VocoderBuilder, VocoderConfig};
pub use codehifigan::CodeGenerator;
pub use hifigan::Generator;
pub use loader::{load_mel_vocoder_config, load_mel_vocoder_model, load_vocoder_model};
pub use melhifigan::MelGenerator;
pub use vocoder::Vocoder;
