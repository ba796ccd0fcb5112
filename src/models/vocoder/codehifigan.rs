//! Unit-conditioned HiFi-GAN ("CodeHiFiGAN")
//!
//! Discrete speech units are embedded, optionally expanded by a duration
//! predictor, and concatenated with broadcast language and speaker
//! embeddings before running the shared [`Generator`]. The channel order fed
//! to the generator is `[lang, unit, spkr]`.

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{
    conv1d, embedding, layer_norm, linear, Conv1d, Conv1dConfig, Embedding, LayerNorm, Linear,
    VarBuilder,
};
use serde::{Deserialize, Serialize};

use super::builder::VocoderConfig;
use super::hifigan::Generator;

/// Upper bound on the frames one utterance may expand to under predicted
/// durations (about 87 minutes of audio at 50 units per second).
pub const MAX_EXPANDED_FRAMES: u64 = 1 << 18;

/// Duration predictor hyper-parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DurationPredictorConfig {
    /// Input channels (must match the unit embedding size)
    pub encoder_embed_dim: usize,
    /// Hidden channels of both convolutions
    pub var_pred_hidden_dim: usize,
    /// Kernel size of `conv1`
    pub var_pred_kernel_size: usize,
    /// Dropout probability (training only)
    #[serde(default)]
    pub var_pred_dropout: f64,
}

/// Predicts a log-duration for every unit.
///
/// Architecture:
/// 1. Conv1d + ReLU, LayerNorm
/// 2. Conv1d (padding 1) + ReLU, LayerNorm
/// 3. Linear projection to one value per frame
///
/// Dropout sits between the stages during training and is the identity here.
pub struct VariancePredictor {
    conv1: Conv1d,
    ln1: LayerNorm,
    conv2: Conv1d,
    ln2: LayerNorm,
    proj: Linear,
}

impl VariancePredictor {
    pub fn new(config: &DurationPredictorConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = config.var_pred_hidden_dim;
        let kernel = config.var_pred_kernel_size;

        let conv1 = conv1d(
            config.encoder_embed_dim,
            hidden,
            kernel,
            Conv1dConfig {
                padding: (kernel - 1) / 2,
                ..Default::default()
            },
            vb.pp("conv1.0"),
        )?;
        let ln1 = layer_norm(hidden, 1e-5, vb.pp("ln1"))?;
        let conv2 = conv1d(
            hidden,
            hidden,
            kernel,
            Conv1dConfig {
                padding: 1,
                ..Default::default()
            },
            vb.pp("conv2.0"),
        )?;
        let ln2 = layer_norm(hidden, 1e-5, vb.pp("ln2"))?;
        let proj = linear(hidden, 1, vb.pp("proj"))?;

        Ok(Self {
            conv1,
            ln1,
            conv2,
            ln2,
            proj,
        })
    }

    /// Input shape: [batch, seq_len, encoder_embed_dim]
    /// Output shape: [batch, seq_len] (log durations)
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = self
            .conv1
            .forward(&x.transpose(1, 2)?.contiguous()?)?
            .relu()?;
        let x = self.ln1.forward(&x.transpose(1, 2)?.contiguous()?)?;
        let x = self
            .conv2
            .forward(&x.transpose(1, 2)?.contiguous()?)?
            .relu()?;
        let x = self.ln2.forward(&x.transpose(1, 2)?.contiguous()?)?;
        Ok(self.proj.forward(&x)?.squeeze(2)?)
    }
}

/// Inputs to [`CodeGenerator::forward`].
pub struct CodeGeneratorInput {
    /// Unit ids, shape `[batch, seq_len]`
    pub code: Tensor,
    /// Speaker ids, shape `[batch, 1]`
    pub spkr: Tensor,
    /// Language ids, shape `[batch, 1]`
    pub lang: Tensor,
}

/// HiFi-GAN generator conditioned on units, language and speaker.
pub struct CodeGenerator {
    generator: Generator,
    dict: Embedding,
    spkr: Embedding,
    lang: Embedding,
    dur_predictor: Option<VariancePredictor>,
    num_embeddings: usize,
    num_spkrs: usize,
    num_langs: usize,
    device: Device,
}

impl CodeGenerator {
    /// Build from a vocoder configuration.
    ///
    /// The generator layers share the prefix of `vb`; the embedding tables
    /// live under `dict`, `spkr` and `lang`, the duration predictor under
    /// `dur_predictor`.
    pub fn new(config: &VocoderConfig, vb: VarBuilder) -> Result<Self> {
        let generator = Generator::new(&config.generator_config(), vb.clone())?;
        let dict = embedding(config.num_embeddings, config.embedding_dim, vb.pp("dict"))?;
        let spkr = embedding(config.num_spkrs, config.spkr_embedding_dim, vb.pp("spkr"))?;
        let lang = embedding(config.num_langs, config.lang_embedding_dim, vb.pp("lang"))?;

        let dur_predictor = config
            .dur_predictor_params
            .as_ref()
            .map(|params| VariancePredictor::new(params, vb.pp("dur_predictor")))
            .transpose()?;

        Ok(Self {
            generator,
            dict,
            spkr,
            lang,
            dur_predictor,
            num_embeddings: config.num_embeddings,
            num_spkrs: config.num_spkrs,
            num_langs: config.num_langs,
            device: vb.device().clone(),
        })
    }

    /// Synthesize waveforms.
    ///
    /// Returns the waveform `[batch, 1, samples]` and, when the duration
    /// predictor ran, the per-unit durations `[1, seq_len]`.
    pub fn forward(
        &self,
        input: &CodeGeneratorInput,
        dur_prediction: bool,
    ) -> Result<(Tensor, Option<Tensor>)> {
        check_ids(&input.code, self.num_embeddings, "unit")?;
        check_ids(&input.spkr, self.num_spkrs, "speaker")?;
        check_ids(&input.lang, self.num_langs, "language")?;

        let code = input.code.to_dtype(DType::U32)?;
        let mut x = self.dict.forward(&code)?.transpose(1, 2)?.contiguous()?;

        let mut dur_out = None;
        if let (Some(dur_predictor), true) = (&self.dur_predictor, dur_prediction) {
            let batch = x.dim(0)?;
            if batch != 1 {
                bail!("duration prediction only supports a single utterance, got batch of {batch}");
            }
            let log_dur = dur_predictor.forward(&x.transpose(1, 2)?.contiguous()?)?;
            let durations = durations_from_log(&log_dur)?;
            x = repeat_frames(&x, &durations)?;
            tracing::debug!(
                units = durations.len(),
                frames = x.dim(2)?,
                "expanded units by predicted durations"
            );
            dur_out = Some(Tensor::new(durations.as_slice(), &self.device)?.unsqueeze(0)?);
        }

        let frames = x.dim(2)?;

        let spkr = self
            .spkr
            .forward(&input.spkr.to_dtype(DType::U32)?)?
            .transpose(1, 2)?;
        let spkr = upsample_condition(&spkr, frames)?;
        let x = Tensor::cat(&[&x, &spkr], 1)?;

        let lang = self
            .lang
            .forward(&input.lang.to_dtype(DType::U32)?)?
            .transpose(1, 2)?;
        let lang = upsample_condition(&lang, frames)?;
        let x = Tensor::cat(&[&lang, &x], 1)?;

        let wav = self.generator.forward(&x)?;
        Ok((wav, dur_out))
    }

    /// Whether a duration predictor was configured.
    pub fn has_duration_predictor(&self) -> bool {
        self.dur_predictor.is_some()
    }

    pub fn upsample_factor(&self) -> usize {
        self.generator.upsample_factor()
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}

/// Broadcast a per-utterance condition over `max_frames` frames.
///
/// The condition is normalized to `[batch, channels, len]` (rank 2 gains a
/// trailing axis, any other rank becomes `[n, 1, 1]`) and each position is
/// repeated `max_frames / len` times.
pub fn upsample_condition(signal: &Tensor, max_frames: usize) -> Result<Tensor> {
    let signal = match signal.rank() {
        3 => signal.clone(),
        2 => signal.unsqueeze(2)?,
        _ => signal.reshape((signal.elem_count(), 1, 1))?,
    };
    let (batch, channels, len) = signal.dims3()?;

    if len == 0 || max_frames == 0 || max_frames % len != 0 {
        bail!(
            "cannot upsample condition of length {len} to {max_frames} frames: \
             misalignment between condition features"
        );
    }

    let repeats = max_frames / len;
    Ok(signal
        .unsqueeze(3)?
        .repeat((1, 1, 1, repeats))?
        .reshape((batch, channels, max_frames))?)
}

/// `clamp(round(exp(log_dur) - 1), min = 1)` for every unit.
///
/// Durations too large for `u32` saturate; [`repeat_frames`] rejects the
/// resulting length.
fn durations_from_log(log_dur: &Tensor) -> Result<Vec<u32>> {
    let values: Vec<f32> = log_dur.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
    values
        .into_iter()
        .map(|l| {
            if l.is_nan() {
                bail!("duration predictor produced NaN");
            }
            Ok((l.exp() - 1.0).round_ties_even().max(1.0) as u32)
        })
        .collect()
}

/// Repeat frame `t` of a `[batch, channels, seq_len]` tensor `durations[t]` times.
fn repeat_frames(x: &Tensor, durations: &[u32]) -> Result<Tensor> {
    let seq_len = x.dim(2)?;
    if durations.len() != seq_len {
        bail!(
            "got {} durations for {} frames",
            durations.len(),
            seq_len
        );
    }

    let total: u64 = durations.iter().map(|&d| u64::from(d)).sum();
    if total > MAX_EXPANDED_FRAMES {
        bail!(
            "durations expand {} units to {} frames, more than the limit of {}",
            seq_len,
            total,
            MAX_EXPANDED_FRAMES
        );
    }

    let indices: Vec<u32> = durations
        .iter()
        .enumerate()
        .flat_map(|(t, &d)| std::iter::repeat(t as u32).take(d as usize))
        .collect();
    let len = indices.len();
    let indices = Tensor::from_vec(indices, len, x.device())?;
    Ok(x.index_select(&indices, 2)?)
}

/// Reject ids that would index past an embedding table.
fn check_ids(ids: &Tensor, limit: usize, what: &str) -> Result<()> {
    let values: Vec<u32> = ids
        .flatten_all()?
        .to_dtype(DType::U32)?
        .to_vec1()
        .with_context(|| format!("failed to read {what} ids"))?;
    if let Some(&bad) = values.iter().find(|&&id| id as usize >= limit) {
        bail!("{what} id {bad} out of range (table has {limit} entries)");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    fn create_mock_vb(device: &Device) -> VarBuilder<'static> {
        let varmap = VarMap::new();
        VarBuilder::from_varmap(&varmap, DType::F32, device)
    }

    fn tiny_config(with_durations: bool) -> VocoderConfig {
        let mut config = VocoderConfig::tiny_for_tests();
        if !with_durations {
            config.dur_predictor_params = None;
        }
        config
    }

    fn input(device: &Device, code: &[u32], spkr: u32, lang: u32) -> CodeGeneratorInput {
        CodeGeneratorInput {
            code: Tensor::new(code, device).unwrap().unsqueeze(0).unwrap(),
            spkr: Tensor::new(&[[spkr]], device).unwrap(),
            lang: Tensor::new(&[[lang]], device).unwrap(),
        }
    }

    #[test]
    fn test_upsample_condition_repeats() {
        let device = Device::Cpu;
        let signal = Tensor::new(&[[[1.0f32], [2.0]]], &device).unwrap(); // [1, 2, 1]
        let out = upsample_condition(&signal, 3).unwrap();
        assert_eq!(out.dims(), &[1, 2, 3]);
        let values: Vec<Vec<f32>> = out.squeeze(0).unwrap().to_vec2().unwrap();
        assert_eq!(values, vec![vec![1.0, 1.0, 1.0], vec![2.0, 2.0, 2.0]]);
    }

    #[test]
    fn test_upsample_condition_rank_normalization() {
        let device = Device::Cpu;
        let rank2 = Tensor::new(&[[1.0f32, 2.0]], &device).unwrap();
        assert_eq!(upsample_condition(&rank2, 4).unwrap().dims(), &[1, 2, 4]);

        let rank1 = Tensor::new(&[1.0f32, 2.0], &device).unwrap();
        assert_eq!(upsample_condition(&rank1, 4).unwrap().dims(), &[2, 1, 4]);
    }

    #[test]
    fn test_upsample_condition_misaligned() {
        let device = Device::Cpu;
        let signal = Tensor::zeros((1, 4, 3), DType::F32, &device).unwrap();
        let err = upsample_condition(&signal, 7).unwrap_err();
        assert!(err.to_string().contains("misalignment"));
    }

    #[test]
    fn test_durations_from_log() {
        let device = Device::Cpu;
        // exp(0) - 1 = 0 is clamped to 1
        let log_dur = Tensor::new(
            &[[0.0f32, 4.0f32.ln(), 2.4f32.ln(), 6.6f32.ln(), -5.0]],
            &device,
        )
        .unwrap();
        let durations = durations_from_log(&log_dur).unwrap();
        assert_eq!(durations, vec![1, 3, 1, 6, 1]);
    }

    #[test]
    fn test_repeat_frames() {
        let device = Device::Cpu;
        let x = Tensor::new(&[[[1.0f32, 2.0, 3.0]]], &device).unwrap();
        let out = repeat_frames(&x, &[2, 1, 3]).unwrap();
        let values: Vec<f32> = out.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(values, vec![1.0, 1.0, 2.0, 3.0, 3.0, 3.0]);

        assert!(repeat_frames(&x, &[1, 1]).is_err());
    }

    #[test]
    fn test_runaway_durations_are_rejected() {
        let device = Device::Cpu;
        let log_dur = Tensor::new(&[[40.0f32, 1e6, 0.0]], &device).unwrap();
        let durations = durations_from_log(&log_dur).unwrap();
        assert_eq!(durations, vec![u32::MAX, u32::MAX, 1]);

        let x = Tensor::zeros((1, 2, 3), DType::F32, &device).unwrap();
        let err = repeat_frames(&x, &durations).unwrap_err();
        assert!(err.to_string().contains("limit"));

        let at_limit = [MAX_EXPANDED_FRAMES as u32 - 2, 1, 1];
        assert!(repeat_frames(&x, &at_limit).is_ok());
        let over = [MAX_EXPANDED_FRAMES as u32 - 1, 1, 1];
        assert!(repeat_frames(&x, &over).is_err());

        let nan = Tensor::new(&[[f32::NAN, 1.0]], &device).unwrap();
        let err = durations_from_log(&nan).unwrap_err();
        assert!(err.to_string().contains("NaN"));
    }

    #[test]
    fn test_variance_predictor_shape() {
        let device = Device::Cpu;
        let config = DurationPredictorConfig {
            encoder_embed_dim: 6,
            var_pred_hidden_dim: 10,
            var_pred_kernel_size: 3,
            var_pred_dropout: 0.5,
        };
        let predictor = VariancePredictor::new(&config, create_mock_vb(&device)).unwrap();

        let x = Tensor::randn(0.0f32, 1.0, (2, 7, 6), &device).unwrap();
        let out = predictor.forward(&x).unwrap();
        assert_eq!(out.dims(), &[2, 7]);
    }

    #[test]
    fn test_code_generator_without_durations() {
        let device = Device::Cpu;
        let config = tiny_config(false);
        let generator = CodeGenerator::new(&config, create_mock_vb(&device)).unwrap();
        assert!(!generator.has_duration_predictor());

        let (wav, dur) = generator
            .forward(&input(&device, &[1, 2, 3, 4, 5], 0, 1), true)
            .unwrap();

        assert!(dur.is_none());
        assert_eq!(wav.dims(), &[1, 1, 5 * config.upsample_factor()]);
    }

    #[test]
    fn test_code_generator_with_durations() {
        let device = Device::Cpu;
        let config = tiny_config(true);
        let generator = CodeGenerator::new(&config, create_mock_vb(&device)).unwrap();

        let (wav, dur) = generator
            .forward(&input(&device, &[3, 1, 4, 1], 1, 0), true)
            .unwrap();

        let durations: Vec<u32> = dur.unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(durations.len(), 4);
        assert!(durations.iter().all(|&d| d >= 1));

        let frames: u32 = durations.iter().sum();
        assert_eq!(
            wav.dims(),
            &[1, 1, frames as usize * config.upsample_factor()]
        );
    }

    #[test]
    fn test_code_generator_skips_durations_when_disabled() {
        let device = Device::Cpu;
        let config = tiny_config(true);
        let generator = CodeGenerator::new(&config, create_mock_vb(&device)).unwrap();

        let (wav, dur) = generator
            .forward(&input(&device, &[3, 1, 4], 1, 0), false)
            .unwrap();
        assert!(dur.is_none());
        assert_eq!(wav.dims(), &[1, 1, 3 * config.upsample_factor()]);
    }

    #[test]
    fn test_code_generator_duration_batch_limit() {
        let device = Device::Cpu;
        let config = tiny_config(true);
        let generator = CodeGenerator::new(&config, create_mock_vb(&device)).unwrap();

        let batch = CodeGeneratorInput {
            code: Tensor::new(&[[1u32, 2], [3, 4]], &device).unwrap(),
            spkr: Tensor::new(&[[0u32], [1]], &device).unwrap(),
            lang: Tensor::new(&[[0u32], [0]], &device).unwrap(),
        };
        let err = generator.forward(&batch, true).unwrap_err();
        assert!(err.to_string().contains("single utterance"));

        let (wav, _) = generator.forward(&batch, false).unwrap();
        assert_eq!(wav.dims(), &[2, 1, 2 * config.upsample_factor()]);
    }

    #[test]
    fn test_code_generator_rejects_out_of_range_ids() {
        let device = Device::Cpu;
        let config = tiny_config(false);
        let generator = CodeGenerator::new(&config, create_mock_vb(&device)).unwrap();

        let bad_unit = config.num_embeddings as u32;
        let err = generator
            .forward(&input(&device, &[0, bad_unit], 0, 0), false)
            .unwrap_err();
        assert!(err.to_string().contains("unit id"));

        let bad_spkr = config.num_spkrs as u32;
        let err = generator
            .forward(&input(&device, &[0, 1], bad_spkr, 0), false)
            .unwrap_err();
        assert!(err.to_string().contains("speaker id"));

        let bad_lang = config.num_langs as u32;
        let err = generator
            .forward(&input(&device, &[0, 1], 0, bad_lang), false)
            .unwrap_err();
        assert!(err.to_string().contains("language id"));
    }
}
