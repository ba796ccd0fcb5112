//! # seamless-vocoder
//!
//! HiFi-GAN vocoders for speech-to-speech translation, in pure Rust on
//! [candle](https://github.com/huggingface/candle).
//!
//! ## Features
//!
//! - **Unit vocoder**: discrete speech units plus a target language (and
//!   optionally a speaker) to 16 kHz speech, with a duration predictor
//! - **Mel vocoder**: mel-spectrograms to speech
//! - **Asset cards**: JSON model descriptions with per-card config overrides
//! - **PyTorch checkpoints**: `.pt` state dicts are read directly and weight
//!   normalization is folded at load time
//! - **CUDA** / **Metal** support through candle
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use seamless_vocoder::{auto_device, load_vocoder_model, AssetStore};
//! use candle_core::DType;
//!
//! let device = auto_device()?;
//! let store = AssetStore::from_env();
//! let vocoder = load_vocoder_model("vocoder_36langs", &store, &device, DType::F32)?;
//!
//! let audio = vocoder.synthesize(&[12, 45, 45, 873, 2], "eng", None)?;
//! audio.save("out.wav")?;
//! ```
//!
//! ## Architecture
//!
//! 1. **Generator**: the HiFi-GAN upsampling stack (transposed convolutions
//!    followed by multi-receptive-field residual blocks).
//! 2. **CodeGenerator**: embeds units, languages and speakers, expands units
//!    by predicted durations and runs the generator.
//! 3. **Vocoder**: resolves language names and default speakers through the
//!    model's language/speaker index map.
//! 4. **MelGenerator**: normalizes mel-spectrograms with stored statistics
//!    and runs the generator.

pub mod audio;
#[cfg(feature = "hub")]
pub mod hub;
pub mod models;
pub mod profiling;

use anyhow::Result;
use candle_core::{DType, Device};

pub use audio::AudioBuffer;
pub use models::vocoder::builder::MelVocoderConfig;
pub use models::vocoder::loader::{load_vocoder_config, AssetCard, AssetStore};
pub use models::vocoder::vocoder::{LangSelection, LangSpkrIdxMap, SpeakerSelection};
pub use models::vocoder::{
    load_mel_vocoder_config, load_mel_vocoder_model, load_vocoder_model, CodeGenerator,
    Generator, MelGenerator, MelVocoderBuilder, Vocoder, VocoderBuilder, VocoderConfig,
};

/// Recommended dtype for `device`: `F16` on GPUs, `F32` on CPU.
pub fn compute_dtype_for_device(device: &Device) -> DType {
    if device.is_cuda() || device.is_metal() {
        DType::F16
    } else {
        DType::F32
    }
}

/// Pick the best available device.
///
/// Tries CUDA, then Metal (when compiled in with the `cuda` / `metal`
/// features), then falls back to the CPU.
pub fn auto_device() -> Result<Device> {
    #[cfg(feature = "cuda")]
    {
        if let Ok(device) = Device::cuda_if_available(0) {
            if device.is_cuda() {
                tracing::info!("Using CUDA device");
                return Ok(device);
            }
        }
    }

    #[cfg(feature = "metal")]
    {
        if let Ok(device) = Device::new_metal(0) {
            tracing::info!("Using Metal device");
            return Ok(device);
        }
    }

    tracing::info!("Using CPU device");
    Ok(Device::Cpu)
}

/// Parse `auto`, `cpu`, `cuda`, `cuda:N` or `metal`.
pub fn parse_device(device_str: &str) -> Result<Device> {
    match device_str.to_lowercase().as_str() {
        "auto" => auto_device(),
        "cpu" => Ok(Device::Cpu),
        s if s.starts_with("cuda") => {
            #[cfg(feature = "cuda")]
            {
                let ordinal: usize = match s.strip_prefix("cuda:") {
                    Some(idx) => idx
                        .parse()
                        .map_err(|e| anyhow::anyhow!("invalid CUDA device index: {e}"))?,
                    None => 0,
                };
                Device::new_cuda(ordinal)
                    .map_err(|e| anyhow::anyhow!("failed to init CUDA device {ordinal}: {e}"))
            }
            #[cfg(not(feature = "cuda"))]
            anyhow::bail!("'{s}' requested but CUDA support is not compiled in (feature `cuda`)")
        }
        "metal" => {
            #[cfg(feature = "metal")]
            {
                Device::new_metal(0)
                    .map_err(|e| anyhow::anyhow!("failed to init Metal device: {e}"))
            }
            #[cfg(not(feature = "metal"))]
            anyhow::bail!("Metal support is not compiled in (feature `metal`)")
        }
        other => anyhow::bail!("unknown device '{other}' (expected auto, cpu, cuda, cuda:N or metal)"),
    }
}

/// Short label for logs.
pub fn device_info(device: &Device) -> String {
    match device {
        Device::Cpu => "CPU".to_string(),
        Device::Cuda(_) => "CUDA".to_string(),
        Device::Metal(_) => "Metal".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_device() {
        assert!(matches!(parse_device("cpu").unwrap(), Device::Cpu));
        assert!(matches!(parse_device("CPU").unwrap(), Device::Cpu));
        assert!(parse_device("tpu").is_err());
        assert!(parse_device("auto").is_ok());
    }

    #[cfg(not(feature = "cuda"))]
    #[test]
    fn test_parse_device_cuda_not_compiled() {
        let err = parse_device("cuda:1").unwrap_err();
        assert!(err.to_string().contains("cuda:1"));
    }

    #[test]
    fn test_device_helpers() {
        assert_eq!(device_info(&Device::Cpu), "CPU");
        assert_eq!(compute_dtype_for_device(&Device::Cpu), DType::F32);
    }
}
