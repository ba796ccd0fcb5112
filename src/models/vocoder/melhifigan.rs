//! Mel-spectrogram HiFi-GAN
//!
//! Wraps the shared [`Generator`] with the per-bin statistics the mels were
//! normalized with during training.

use anyhow::{bail, Context, Result};
use candle_core::{DType, Tensor};
use candle_nn::VarBuilder;

use super::builder::MelVocoderConfig;
use super::hifigan::Generator;
use crate::audio::AudioBuffer;

/// HiFi-GAN vocoder driven by mel-spectrograms.
pub struct MelGenerator {
    generator: Generator,
    /// Per-bin mean, shape `[n_mels]`
    mean: Tensor,
    /// Per-bin scale, shape `[n_mels]`
    scale: Tensor,
    n_mels: usize,
    sample_rate: u32,
}

impl MelGenerator {
    /// Build the generator.
    ///
    /// `mean` and `scale` are read from `vb` when the checkpoint has them and
    /// default to 0 and 1 otherwise.
    pub fn new(config: &MelVocoderConfig, vb: VarBuilder) -> Result<Self> {
        let generator = Generator::new(&config.generator_config(), vb.clone())?;
        let n_mels = config.model_in_dim;

        let mean = if vb.contains_tensor("mean") {
            vb.get(n_mels, "mean")?
        } else {
            Tensor::zeros(n_mels, vb.dtype(), vb.device())?
        };
        let scale = if vb.contains_tensor("scale") {
            vb.get(n_mels, "scale")?
        } else {
            Tensor::ones(n_mels, vb.dtype(), vb.device())?
        };

        Ok(Self {
            generator,
            mean,
            scale,
            n_mels,
            sample_rate: config.sample_rate,
        })
    }

    /// Synthesize one utterance.
    ///
    /// Input shape: [frames, n_mels]
    /// Output shape: [frames * hop_length]
    pub fn forward(&self, mel: &Tensor, normalize_before: bool) -> Result<Tensor> {
        let (frames, bins) = mel
            .dims2()
            .context("mel-spectrogram must be [frames, n_mels]")?;
        if frames == 0 {
            bail!("mel-spectrogram has no frames");
        }
        if bins != self.n_mels {
            bail!("expected {} mel bins, got {}", self.n_mels, bins);
        }

        let mel = mel.to_dtype(self.mean.dtype())?;
        let x = if normalize_before {
            mel.broadcast_sub(&self.mean)?.broadcast_div(&self.scale)?
        } else {
            mel
        };

        let x = x.t()?.unsqueeze(0)?.contiguous()?;
        let wav = self.generator.forward(&x)?;
        Ok(wav.flatten_all()?)
    }

    /// Synthesize a batch without normalization.
    ///
    /// Input shape: [batch, n_mels, frames]
    /// Output shape: [batch, 1, frames * hop_length]
    pub fn forward_batch(&self, mel: &Tensor) -> Result<Tensor> {
        self.generator.forward(mel)
    }

    /// Normalize, synthesize and wrap the result as audio.
    pub fn synthesize(&self, mel: &Tensor) -> Result<AudioBuffer> {
        let wav = self.forward(mel, true)?;
        AudioBuffer::from_tensor(wav.to_dtype(DType::F32)?, self.sample_rate)
    }

    pub fn n_mels(&self) -> usize {
        self.n_mels
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Output samples per mel frame.
    pub fn hop_length(&self) -> usize {
        self.generator.upsample_factor()
    }
}
