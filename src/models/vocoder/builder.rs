//! Vocoder configurations, architecture registries and model builders

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use super::codehifigan::{CodeGenerator, DurationPredictorConfig};
use super::hifigan::{GeneratorConfig, DEFAULT_MODEL_IN_DIM};
use super::melhifigan::MelGenerator;
use super::vocoder::{LangSpkrIdxMap, Vocoder};

/// Asset-card model type of unit vocoders.
pub const VOCODER_MODEL_TYPE: &str = "vocoder_code_hifigan";

/// Asset-card model type of mel-spectrogram vocoders.
pub const MEL_VOCODER_MODEL_TYPE: &str = "vocoder_mel_hifigan";

/// Unit vocoder (CodeHiFiGAN) configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VocoderConfig {
    /// Generator input channels (`embedding_dim + lang_embedding_dim + spkr_embedding_dim`)
    pub model_in_dim: usize,
    /// Kernel size of each transposed convolution
    pub upsample_kernel_sizes: Vec<usize>,
    /// Stride of each transposed convolution
    pub upsample_rates: Vec<usize>,
    /// Channels after `conv_pre`
    pub upsample_initial_channel: usize,
    /// Residual block kernel sizes
    pub resblock_kernel_sizes: Vec<usize>,
    /// Residual block dilations
    pub resblock_dilation_sizes: Vec<Vec<usize>>,
    /// Unit vocabulary size
    pub num_embeddings: usize,
    /// Unit embedding size
    pub embedding_dim: usize,
    /// Duration predictor; `None` disables duration expansion
    #[serde(default)]
    pub dur_predictor_params: Option<DurationPredictorConfig>,
    /// Language embedding size
    pub lang_embedding_dim: usize,
    /// Number of languages
    pub num_langs: usize,
    /// Speaker embedding size
    pub spkr_embedding_dim: usize,
    /// Number of speakers
    pub num_spkrs: usize,
    /// Language name -> language/speaker indices
    #[serde(default)]
    pub lang_spkr_idx_map: LangSpkrIdxMap,
}

impl VocoderConfig {
    /// The 16 kHz unit vocoder shipped with the speech translation models.
    pub fn base() -> Self {
        Self {
            model_in_dim: 1792,
            upsample_kernel_sizes: vec![11, 8, 8, 4, 4],
            upsample_rates: vec![5, 4, 4, 2, 2],
            upsample_initial_channel: 512,
            resblock_kernel_sizes: vec![3, 7, 11],
            resblock_dilation_sizes: vec![vec![1, 3, 5], vec![1, 3, 5], vec![1, 3, 5]],
            num_embeddings: 10000,
            embedding_dim: 1280,
            dur_predictor_params: Some(DurationPredictorConfig {
                encoder_embed_dim: 1280,
                var_pred_hidden_dim: 1280,
                var_pred_kernel_size: 3,
                var_pred_dropout: 0.5,
            }),
            lang_embedding_dim: 256,
            num_langs: 36,
            spkr_embedding_dim: 256,
            num_spkrs: 200,
            lang_spkr_idx_map: LangSpkrIdxMap::default(),
        }
    }

    /// Parse from a JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read vocoder config from {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse vocoder config from {}", path.display()))
    }

    /// The generator part of the configuration.
    pub fn generator_config(&self) -> GeneratorConfig {
        GeneratorConfig {
            upsample_rates: self.upsample_rates.clone(),
            upsample_kernel_sizes: self.upsample_kernel_sizes.clone(),
            upsample_initial_channel: self.upsample_initial_channel,
            resblock_kernel_sizes: self.resblock_kernel_sizes.clone(),
            resblock_dilation_sizes: self.resblock_dilation_sizes.clone(),
            model_in_dim: self.model_in_dim,
        }
    }

    /// Output samples per (duration-expanded) unit frame.
    pub fn upsample_factor(&self) -> usize {
        self.upsample_rates.iter().product()
    }

    pub fn validate(&self) -> Result<()> {
        self.generator_config().validate()?;

        let concat_dim = self.embedding_dim + self.lang_embedding_dim + self.spkr_embedding_dim;
        if self.model_in_dim != concat_dim {
            bail!(
                "model_in_dim {} does not match embedding_dim + lang_embedding_dim + spkr_embedding_dim = {}",
                self.model_in_dim,
                concat_dim
            );
        }
        if self.num_embeddings == 0 || self.num_langs == 0 || self.num_spkrs == 0 {
            bail!("num_embeddings, num_langs and num_spkrs must all be positive");
        }

        if let Some(params) = &self.dur_predictor_params {
            if params.encoder_embed_dim != self.embedding_dim {
                bail!(
                    "duration predictor encoder_embed_dim {} does not match embedding_dim {}",
                    params.encoder_embed_dim,
                    self.embedding_dim
                );
            }
            // conv2 pads by one frame on each side, so only k=3 keeps the length
            if params.var_pred_kernel_size != 3 {
                bail!(
                    "duration predictor kernel size must be 3, got {}",
                    params.var_pred_kernel_size
                );
            }
        }

        self.lang_spkr_idx_map
            .validate(self.num_langs, self.num_spkrs)
            .context("invalid lang_spkr_idx_map")
    }
}

/// Mel-spectrogram vocoder configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MelVocoderConfig {
    /// Number of mel bins
    #[serde(default = "default_n_mels")]
    pub model_in_dim: usize,
    pub upsample_rates: Vec<usize>,
    pub upsample_kernel_sizes: Vec<usize>,
    pub upsample_initial_channel: usize,
    pub resblock_kernel_sizes: Vec<usize>,
    pub resblock_dilation_sizes: Vec<Vec<usize>>,
    /// Output sample rate in Hz
    #[serde(default = "default_mel_sample_rate")]
    pub sample_rate: u32,
}

fn default_n_mels() -> usize {
    DEFAULT_MODEL_IN_DIM
}

fn default_mel_sample_rate() -> u32 {
    16000
}

impl MelVocoderConfig {
    /// 16 kHz, 80 mel bins, hop 160.
    pub fn base_mel() -> Self {
        Self {
            model_in_dim: 80,
            upsample_rates: vec![5, 4, 4, 2],
            upsample_kernel_sizes: vec![11, 8, 8, 4],
            upsample_initial_channel: 512,
            resblock_kernel_sizes: vec![3, 7, 11],
            resblock_dilation_sizes: vec![vec![1, 3, 5], vec![1, 3, 5], vec![1, 3, 5]],
            sample_rate: 16000,
        }
    }

    /// 24 kHz, 80 mel bins, hop 240.
    pub fn mel_24khz() -> Self {
        Self {
            upsample_rates: vec![5, 4, 4, 3],
            upsample_kernel_sizes: vec![11, 8, 8, 7],
            sample_rate: 24000,
            ..Self::base_mel()
        }
    }

    /// Parse from a JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read mel vocoder config from {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse mel vocoder config from {}", path.display()))
    }

    pub fn generator_config(&self) -> GeneratorConfig {
        GeneratorConfig {
            upsample_rates: self.upsample_rates.clone(),
            upsample_kernel_sizes: self.upsample_kernel_sizes.clone(),
            upsample_initial_channel: self.upsample_initial_channel,
            resblock_kernel_sizes: self.resblock_kernel_sizes.clone(),
            resblock_dilation_sizes: self.resblock_dilation_sizes.clone(),
            model_in_dim: self.model_in_dim,
        }
    }

    /// Samples per mel frame (the STFT hop length the mels were computed with).
    pub fn hop_length(&self) -> usize {
        self.upsample_rates.iter().product()
    }

    pub fn validate(&self) -> Result<()> {
        self.generator_config().validate()?;
        if self.sample_rate == 0 {
            bail!("sample_rate must be positive");
        }
        Ok(())
    }
}

/// Constructs a default configuration for a named architecture.
pub type ConfigFactory<C> = fn() -> C;

/// Named architectures of one model type.
pub struct ArchitectureRegistry<C> {
    model_type: &'static str,
    archs: BTreeMap<&'static str, ConfigFactory<C>>,
}

impl<C> ArchitectureRegistry<C> {
    pub fn new(model_type: &'static str) -> Self {
        Self {
            model_type,
            archs: BTreeMap::new(),
        }
    }

    /// Register an architecture, replacing any previous one with the same name.
    pub fn register(&mut self, name: &'static str, factory: ConfigFactory<C>) {
        self.archs.insert(name, factory);
    }

    /// Default configuration of `name`.
    pub fn get(&self, name: &str) -> Result<C> {
        match self.archs.get(name) {
            Some(factory) => Ok(factory()),
            None => bail!(
                "unknown {} architecture '{}' (known: {})",
                self.model_type,
                name,
                self.names().join(", ")
            ),
        }
    }

    /// Registered architecture names, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        self.archs.keys().copied().collect()
    }

    pub fn model_type(&self) -> &'static str {
        self.model_type
    }
}

/// Architectures of [`VOCODER_MODEL_TYPE`].
pub fn vocoder_archs() -> ArchitectureRegistry<VocoderConfig> {
    let mut registry = ArchitectureRegistry::new(VOCODER_MODEL_TYPE);
    registry.register("base", VocoderConfig::base);
    registry
}

/// Architectures of [`MEL_VOCODER_MODEL_TYPE`].
pub fn mel_vocoder_archs() -> ArchitectureRegistry<MelVocoderConfig> {
    let mut registry = ArchitectureRegistry::new(MEL_VOCODER_MODEL_TYPE);
    registry.register("base_mel", MelVocoderConfig::base_mel);
    registry.register("24khz_mel", MelVocoderConfig::mel_24khz);
    registry
}

/// Builds unit vocoders.
pub struct VocoderBuilder {
    config: VocoderConfig,
    device: Device,
    dtype: DType,
}

impl VocoderBuilder {
    pub fn new(config: VocoderConfig, device: &Device, dtype: DType) -> Self {
        Self {
            config,
            device: device.clone(),
            dtype,
        }
    }

    pub fn config(&self) -> &VocoderConfig {
        &self.config
    }

    /// Build the code generator with weights rooted at `vb`.
    pub fn build_code_generator(&self, vb: VarBuilder) -> Result<CodeGenerator> {
        self.config.validate()?;
        CodeGenerator::new(&self.config, vb)
    }

    /// Build a vocoder; the generator weights live under `code_generator`.
    pub fn build_model(&self, vb: VarBuilder) -> Result<Vocoder> {
        let code_generator = self.build_code_generator(vb.pp("code_generator"))?;
        Ok(Vocoder::new(
            code_generator,
            self.config.lang_spkr_idx_map.clone(),
        ))
    }

    /// Build from an already converted checkpoint.
    pub fn build_from_tensors(&self, tensors: HashMap<String, Tensor>) -> Result<Vocoder> {
        let vb = VarBuilder::from_tensors(tensors, self.dtype, &self.device);
        self.build_model(vb)
    }

    /// Build with freshly initialized weights.
    ///
    /// The returned [`VarMap`] holds the weights, e.g. for saving them.
    pub fn build_random(&self) -> Result<(Vocoder, VarMap)> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, self.dtype, &self.device);
        let vocoder = self.build_model(vb)?;
        Ok((vocoder, varmap))
    }
}

/// Builds mel-spectrogram vocoders.
pub struct MelVocoderBuilder {
    config: MelVocoderConfig,
    device: Device,
    dtype: DType,
}

impl MelVocoderBuilder {
    pub fn new(config: MelVocoderConfig, device: &Device, dtype: DType) -> Self {
        Self {
            config,
            device: device.clone(),
            dtype,
        }
    }

    pub fn config(&self) -> &MelVocoderConfig {
        &self.config
    }

    pub fn build_model(&self, vb: VarBuilder) -> Result<MelGenerator> {
        self.config.validate()?;
        MelGenerator::new(&self.config, vb)
    }

    pub fn build_from_tensors(&self, tensors: HashMap<String, Tensor>) -> Result<MelGenerator> {
        let vb = VarBuilder::from_tensors(tensors, self.dtype, &self.device);
        self.build_model(vb)
    }

    pub fn build_random(&self) -> Result<(MelGenerator, VarMap)> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, self.dtype, &self.device);
        let model = self.build_model(vb)?;
        Ok((model, varmap))
    }
}

/// Build a unit vocoder on the device and dtype of `vb`.
pub fn create_vocoder_model(config: VocoderConfig, vb: VarBuilder) -> Result<Vocoder> {
    VocoderBuilder::new(config, vb.device(), vb.dtype()).build_model(vb)
}

/// Build a mel vocoder on the device and dtype of `vb`.
pub fn create_mel_vocoder_model(config: MelVocoderConfig, vb: VarBuilder) -> Result<MelGenerator> {
    MelVocoderBuilder::new(config, vb.device(), vb.dtype()).build_model(vb)
}

#[cfg(test)]
impl VocoderConfig {
    /// A few-thousand-parameter configuration for unit tests.
    pub(crate) fn tiny_for_tests() -> Self {
        let lang_spkr_idx_map: LangSpkrIdxMap = serde_json::from_str(
            r#"{
                "multilingual": {"eng": 0, "fra": 1, "deu": 2},
                "multispkr": {"eng": [1], "fra": [3, 4], "deu": []}
            }"#,
        )
        .expect("valid map");

        Self {
            model_in_dim: 16,
            upsample_kernel_sizes: vec![4, 4],
            upsample_rates: vec![2, 2],
            upsample_initial_channel: 16,
            resblock_kernel_sizes: vec![3],
            resblock_dilation_sizes: vec![vec![1, 3]],
            num_embeddings: 20,
            embedding_dim: 8,
            dur_predictor_params: Some(DurationPredictorConfig {
                encoder_embed_dim: 8,
                var_pred_hidden_dim: 8,
                var_pred_kernel_size: 3,
                var_pred_dropout: 0.5,
            }),
            lang_embedding_dim: 4,
            num_langs: 3,
            spkr_embedding_dim: 4,
            num_spkrs: 5,
            lang_spkr_idx_map,
        }
    }
}
