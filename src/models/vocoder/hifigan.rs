//! HiFi-GAN generator
//!
//! Upsamples a `[batch, channels, frames]` conditioning signal to a
//! `[batch, 1, samples]` waveform with a stack of transposed convolutions,
//! each followed by a multi-receptive-field fusion of residual blocks.
//!
//! Architecture:
//! - `conv_pre`: Conv1d(model_in_dim -> initial_channel, k=7)
//! - per stage `i`: LeakyReLU(0.1) -> `ups[i]` -> mean of `resblocks[i*K..(i+1)*K]`
//! - LeakyReLU(0.01) -> `conv_post`: Conv1d(channels -> 1, k=7) -> tanh

use anyhow::{bail, Context, Result};
use candle_core::{Module, Tensor};
use candle_nn::{
    conv1d, conv_transpose1d, ops::leaky_relu, Conv1d, Conv1dConfig, ConvTranspose1d,
    ConvTranspose1dConfig, VarBuilder,
};
use serde::{Deserialize, Serialize};

/// Negative slope of the leaky ReLU between generator stages.
pub const LRELU_SLOPE: f64 = 0.1;

/// Slope of the leaky ReLU applied before `conv_post` (PyTorch's default).
const POST_LRELU_SLOPE: f64 = 0.01;

/// Default number of input channels (mel bins) when none is configured.
pub const DEFAULT_MODEL_IN_DIM: usize = 80;

/// "Same" padding for a dilated convolution with an odd kernel.
pub fn get_padding(kernel_size: usize, dilation: usize) -> usize {
    (kernel_size * dilation - dilation) / 2
}

/// Hyper-parameters shared by every HiFi-GAN generator variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratorConfig {
    /// Stride of each transposed convolution
    pub upsample_rates: Vec<usize>,
    /// Kernel size of each transposed convolution
    pub upsample_kernel_sizes: Vec<usize>,
    /// Channels after `conv_pre`; halved at every stage
    pub upsample_initial_channel: usize,
    /// Kernel size of each residual block within a stage
    pub resblock_kernel_sizes: Vec<usize>,
    /// Dilations of each residual block within a stage
    pub resblock_dilation_sizes: Vec<Vec<usize>>,
    /// Input channels
    #[serde(default = "default_model_in_dim")]
    pub model_in_dim: usize,
}

fn default_model_in_dim() -> usize {
    DEFAULT_MODEL_IN_DIM
}

impl GeneratorConfig {
    /// Check that the layer lists line up.
    pub fn validate(&self) -> Result<()> {
        if self.upsample_rates.is_empty() {
            bail!("upsample_rates must not be empty");
        }
        if self.upsample_rates.len() != self.upsample_kernel_sizes.len() {
            bail!(
                "upsample_rates ({}) and upsample_kernel_sizes ({}) must have the same length",
                self.upsample_rates.len(),
                self.upsample_kernel_sizes.len()
            );
        }
        for (&rate, &kernel) in self
            .upsample_rates
            .iter()
            .zip(self.upsample_kernel_sizes.iter())
        {
            if rate == 0 || kernel < rate {
                bail!("invalid upsample layer: kernel {kernel} must be >= rate {rate} > 0");
            }
        }
        if self.resblock_kernel_sizes.is_empty() {
            bail!("resblock_kernel_sizes must not be empty");
        }
        if self.resblock_kernel_sizes.len() != self.resblock_dilation_sizes.len() {
            bail!(
                "resblock_kernel_sizes ({}) and resblock_dilation_sizes ({}) must have the same length",
                self.resblock_kernel_sizes.len(),
                self.resblock_dilation_sizes.len()
            );
        }
        if self.resblock_dilation_sizes.iter().any(|d| d.is_empty()) {
            bail!("every residual block needs at least one dilation");
        }
        let stages = self.upsample_rates.len() as u32;
        let divisor = 1usize
            .checked_shl(stages)
            .filter(|&d| d != 0)
            .context("too many upsample stages")?;
        if self.upsample_initial_channel == 0 || self.upsample_initial_channel % divisor != 0 {
            bail!(
                "upsample_initial_channel {} must be a positive multiple of 2^{}",
                self.upsample_initial_channel,
                stages
            );
        }
        if self.model_in_dim == 0 {
            bail!("model_in_dim must be positive");
        }
        Ok(())
    }

    /// Total number of output samples per input frame.
    pub fn upsample_factor(&self) -> usize {
        self.upsample_rates.iter().product()
    }
}

/// Residual block with dilated convolutions (HiFi-GAN "ResBlock1").
///
/// Each of the dilation steps runs
/// `x + conv2(lrelu(conv1(lrelu(x))))`, so the shape is preserved.
pub struct ResBlock {
    convs1: Vec<Conv1d>,
    convs2: Vec<Conv1d>,
}

impl ResBlock {
    /// Create a residual block.
    ///
    /// # Arguments
    /// * `channels` - Input and output channels
    /// * `kernel_size` - Kernel size of every convolution
    /// * `dilations` - One dilation per `convs1` layer
    /// * `vb` - Variable builder rooted at `resblocks.{n}`
    pub fn new(
        channels: usize,
        kernel_size: usize,
        dilations: &[usize],
        vb: VarBuilder,
    ) -> Result<Self> {
        let mut convs1 = Vec::with_capacity(dilations.len());
        let mut convs2 = Vec::with_capacity(dilations.len());

        for (i, &dilation) in dilations.iter().enumerate() {
            let config = Conv1dConfig {
                padding: get_padding(kernel_size, dilation),
                dilation,
                ..Default::default()
            };
            convs1.push(conv1d(
                channels,
                channels,
                kernel_size,
                config,
                vb.pp(format!("convs1.{i}")),
            )?);

            let config = Conv1dConfig {
                padding: get_padding(kernel_size, 1),
                ..Default::default()
            };
            convs2.push(conv1d(
                channels,
                channels,
                kernel_size,
                config,
                vb.pp(format!("convs2.{i}")),
            )?);
        }

        Ok(Self { convs1, convs2 })
    }

    /// Input/Output shape: [batch, channels, seq_len]
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut x = x.clone();
        for (c1, c2) in self.convs1.iter().zip(self.convs2.iter()) {
            let xt = leaky_relu(&x, LRELU_SLOPE)?;
            let xt = c1.forward(&xt)?;
            let xt = leaky_relu(&xt, LRELU_SLOPE)?;
            let xt = c2.forward(&xt)?;
            x = (xt + x)?;
        }
        Ok(x)
    }
}

impl Module for ResBlock {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        ResBlock::forward(self, x).map_err(|e| candle_core::Error::Msg(e.to_string()))
    }
}

/// HiFi-GAN generator.
pub struct Generator {
    conv_pre: Conv1d,
    ups: Vec<ConvTranspose1d>,
    resblocks: Vec<ResBlock>,
    conv_post: Conv1d,
    num_kernels: usize,
    model_in_dim: usize,
    upsample_factor: usize,
}

impl Generator {
    /// Build the generator.
    ///
    /// Weight names follow the checkpoint layout: `conv_pre`, `ups.{i}`,
    /// `resblocks.{i * K + j}` and `conv_post`, all relative to `vb`.
    pub fn new(config: &GeneratorConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;

        let initial = config.upsample_initial_channel;
        let conv_pre = conv1d(
            config.model_in_dim,
            initial,
            7,
            Conv1dConfig {
                padding: 3,
                ..Default::default()
            },
            vb.pp("conv_pre"),
        )?;

        let num_kernels = config.resblock_kernel_sizes.len();
        let mut ups = Vec::with_capacity(config.upsample_rates.len());
        let mut resblocks = Vec::with_capacity(config.upsample_rates.len() * num_kernels);
        let mut channels = initial;

        for (i, (&rate, &kernel)) in config
            .upsample_rates
            .iter()
            .zip(config.upsample_kernel_sizes.iter())
            .enumerate()
        {
            let out_channels = initial >> (i + 1);
            let up_config = ConvTranspose1dConfig {
                padding: (kernel - rate) / 2,
                output_padding: 0,
                stride: rate,
                dilation: 1,
                groups: 1,
            };
            ups.push(conv_transpose1d(
                channels,
                out_channels,
                kernel,
                up_config,
                vb.pp(format!("ups.{i}")),
            )?);

            for (j, (&k, dilations)) in config
                .resblock_kernel_sizes
                .iter()
                .zip(config.resblock_dilation_sizes.iter())
                .enumerate()
            {
                resblocks.push(ResBlock::new(
                    out_channels,
                    k,
                    dilations,
                    vb.pp(format!("resblocks.{}", i * num_kernels + j)),
                )?);
            }
            channels = out_channels;
        }

        let conv_post = conv1d(
            channels,
            1,
            7,
            Conv1dConfig {
                padding: 3,
                ..Default::default()
            },
            vb.pp("conv_post"),
        )?;

        Ok(Self {
            conv_pre,
            ups,
            resblocks,
            conv_post,
            num_kernels,
            model_in_dim: config.model_in_dim,
            upsample_factor: config.upsample_factor(),
        })
    }

    /// Synthesize a waveform.
    ///
    /// Input shape: [batch, model_in_dim, frames]
    /// Output shape: [batch, 1, frames * upsample_factor], values in [-1, 1]
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (_batch, channels, frames) = x
            .dims3()
            .context("generator input must be [batch, channels, frames]")?;
        if channels != self.model_in_dim {
            bail!(
                "generator expects {} input channels, got {}",
                self.model_in_dim,
                channels
            );
        }
        tracing::debug!(frames, "HiFi-GAN forward");

        let mut x = self.conv_pre.forward(x)?;
        for (i, up) in self.ups.iter().enumerate() {
            x = leaky_relu(&x, LRELU_SLOPE)?;
            x = up.forward(&x)?;

            let stage = &self.resblocks[i * self.num_kernels..(i + 1) * self.num_kernels];
            let mut xs = stage[0].forward(&x)?;
            for block in &stage[1..] {
                xs = (xs + block.forward(&x)?)?;
            }
            x = (xs / self.num_kernels as f64)?;
        }

        let x = leaky_relu(&x, POST_LRELU_SLOPE)?;
        let x = self.conv_post.forward(&x)?;
        Ok(x.tanh()?)
    }

    /// Expected number of input channels.
    pub fn model_in_dim(&self) -> usize {
        self.model_in_dim
    }

    /// Output samples produced per input frame.
    pub fn upsample_factor(&self) -> usize {
        self.upsample_factor
    }
}

impl Module for Generator {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        Generator::forward(self, x).map_err(|e| candle_core::Error::Msg(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn create_mock_vb(device: &Device) -> VarBuilder<'static> {
        let varmap = VarMap::new();
        VarBuilder::from_varmap(&varmap, DType::F32, device)
    }

    fn tiny_config() -> GeneratorConfig {
        GeneratorConfig {
            upsample_rates: vec![2, 2],
            upsample_kernel_sizes: vec![4, 4],
            upsample_initial_channel: 16,
            resblock_kernel_sizes: vec![3, 5],
            resblock_dilation_sizes: vec![vec![1, 3, 5], vec![1, 3, 5]],
            model_in_dim: 8,
        }
    }

    #[test]
    fn test_get_padding() {
        assert_eq!(get_padding(3, 1), 1);
        assert_eq!(get_padding(3, 5), 5);
        assert_eq!(get_padding(7, 3), 9);
        assert_eq!(get_padding(11, 1), 5);
    }

    #[test]
    fn test_resblock_preserves_shape() {
        let device = Device::Cpu;
        let block = ResBlock::new(12, 3, &[1, 3, 5], create_mock_vb(&device)).unwrap();

        let input = Tensor::randn(0.0f32, 1.0, (2, 12, 17), &device).unwrap();
        let output = block.forward(&input).unwrap();

        assert_eq!(output.dims(), &[2, 12, 17]);
    }

    #[test]
    fn test_generator_output_shape() {
        let device = Device::Cpu;
        let config = tiny_config();
        let generator = Generator::new(&config, create_mock_vb(&device)).unwrap();
        assert_eq!(generator.upsample_factor(), 4);

        let input = Tensor::randn(0.0f32, 1.0, (1, 8, 5), &device).unwrap();
        let output = generator.forward(&input).unwrap();

        assert_eq!(output.dims(), &[1, 1, 20]);
    }

    #[test]
    fn test_generator_odd_kernel_upsampling() {
        // kernel 11 / stride 5 is the first stage of the unit vocoder
        let device = Device::Cpu;
        let config = GeneratorConfig {
            upsample_rates: vec![5],
            upsample_kernel_sizes: vec![11],
            upsample_initial_channel: 8,
            resblock_kernel_sizes: vec![3],
            resblock_dilation_sizes: vec![vec![1, 3, 5]],
            model_in_dim: 4,
        };
        let generator = Generator::new(&config, create_mock_vb(&device)).unwrap();

        let input = Tensor::randn(0.0f32, 1.0, (1, 4, 6), &device).unwrap();
        let output = generator.forward(&input).unwrap();

        assert_eq!(output.dims(), &[1, 1, 30]);
    }

    #[test]
    fn test_generator_output_is_bounded() {
        let device = Device::Cpu;
        let generator = Generator::new(&tiny_config(), create_mock_vb(&device)).unwrap();

        let input = Tensor::randn(0.0f32, 10.0, (2, 8, 9), &device).unwrap();
        let output = generator.forward(&input).unwrap();

        let max_abs: f32 = output
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(max_abs <= 1.0);
    }

    #[test]
    fn test_generator_rejects_wrong_channels() {
        let device = Device::Cpu;
        let generator = Generator::new(&tiny_config(), create_mock_vb(&device)).unwrap();

        let input = Tensor::randn(0.0f32, 1.0, (1, 7, 5), &device).unwrap();
        let err = generator.forward(&input).unwrap_err();
        assert!(err.to_string().contains("input channels"));

        let input = Tensor::randn(0.0f32, 1.0, (8, 5), &device).unwrap();
        assert!(generator.forward(&input).is_err());
    }

    #[test]
    fn test_config_validation() {
        let mut config = tiny_config();
        assert!(config.validate().is_ok());

        config.upsample_kernel_sizes.pop();
        assert!(config.validate().is_err());

        let mut config = tiny_config();
        config.upsample_initial_channel = 6;
        assert!(config.validate().is_err());

        let mut config = tiny_config();
        config.resblock_dilation_sizes.pop();
        assert!(config.validate().is_err());

        let mut config = tiny_config();
        config.upsample_kernel_sizes = vec![1, 4];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_default_model_in_dim() {
        let json = r#"{
            "upsample_rates": [2],
            "upsample_kernel_sizes": [4],
            "upsample_initial_channel": 4,
            "resblock_kernel_sizes": [3],
            "resblock_dilation_sizes": [[1]]
        }"#;
        let config: GeneratorConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.model_in_dim, DEFAULT_MODEL_IN_DIM);
    }
}
