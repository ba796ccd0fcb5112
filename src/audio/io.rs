//! Mono waveforms and WAV files.

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device, Tensor};
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use std::path::Path;

/// Sample encoding used when writing WAV files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WavEncoding {
    /// 16-bit signed PCM
    #[default]
    Pcm16,
    /// 32-bit IEEE float
    Float32,
}

/// Mono waveform produced by a vocoder.
///
/// Samples are 32-bit floats, nominally in \[-1.0, 1.0\].
///
/// ```rust,ignore
/// let audio = vocoder.synthesize(&units, "eng", None)?;
/// println!("{:.2}s at {} Hz", audio.duration(), audio.sample_rate);
/// audio.save("out.wav")?;
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    pub samples: Vec<f32>,
    /// Sample rate in Hz
    pub sample_rate: u32,
}

impl AudioBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Take the samples of a waveform tensor of any shape holding one utterance,
    /// e.g. `[samples]` or `[1, 1, samples]`.
    pub fn from_tensor(tensor: Tensor, sample_rate: u32) -> Result<Self> {
        if sample_rate == 0 {
            bail!("sample rate must be positive");
        }
        let samples: Vec<f32> = tensor
            .flatten_all()?
            .to_dtype(DType::F32)?
            .to_vec1()
            .context("Failed to read waveform samples")?;
        Ok(Self::new(samples, sample_rate))
    }

    /// Samples as a `[samples]` tensor.
    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        Ok(Tensor::new(self.samples.as_slice(), device)?)
    }

    /// Duration in seconds
    pub fn duration(&self) -> f32 {
        self.samples.len() as f32 / self.sample_rate as f32
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Largest absolute sample value.
    pub fn peak(&self) -> f32 {
        self.samples.iter().fold(0.0f32, |m, s| m.max(s.abs()))
    }

    /// Scale so the peak sits at `target_db` dBFS. Silence is left alone.
    pub fn normalize_db(&mut self, target_db: f32) {
        let peak = self.peak();
        if peak > 0.0 {
            let gain = 10.0f32.powf(target_db / 20.0) / peak;
            self.samples.iter_mut().for_each(|s| *s *= gain);
        }
    }

    /// Scale so the peak is exactly 1.0.
    pub fn normalize(&mut self) {
        self.normalize_db(0.0);
    }

    /// Write a 16-bit PCM WAV file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        write_wav(path, self, WavEncoding::Pcm16)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        read_wav(path)
    }
}

/// Write a mono WAV file.
///
/// PCM output clamps samples to \[-1.0, 1.0\] first.
pub fn write_wav<P: AsRef<Path>>(path: P, audio: &AudioBuffer, encoding: WavEncoding) -> Result<()> {
    let path = path.as_ref();
    let (bits_per_sample, sample_format) = match encoding {
        WavEncoding::Pcm16 => (16, SampleFormat::Int),
        WavEncoding::Float32 => (32, SampleFormat::Float),
    };
    let spec = WavSpec {
        channels: 1,
        sample_rate: audio.sample_rate,
        bits_per_sample,
        sample_format,
    };

    let mut writer = WavWriter::create(path, spec)
        .with_context(|| format!("Failed to create WAV file: {}", path.display()))?;
    match encoding {
        WavEncoding::Pcm16 => {
            for &s in &audio.samples {
                writer.write_sample((s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)?;
            }
        }
        WavEncoding::Float32 => {
            for &s in &audio.samples {
                writer.write_sample(s)?;
            }
        }
    }
    writer
        .finalize()
        .with_context(|| format!("Failed to finish WAV file: {}", path.display()))?;

    tracing::debug!(
        "Wrote {} samples ({:.2}s) to {}",
        audio.len(),
        audio.duration(),
        path.display()
    );
    Ok(())
}

/// Read a WAV file, averaging channels down to mono.
pub fn read_wav<P: AsRef<Path>>(path: P) -> Result<AudioBuffer> {
    let path = path.as_ref();
    let reader = WavReader::open(path)
        .with_context(|| format!("Failed to open WAV file: {}", path.display()))?;
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let interleaved: Vec<f32> = match spec.sample_format {
        SampleFormat::Float => reader.into_samples::<f32>().collect::<Result<_, _>>()?,
        SampleFormat::Int => {
            let full_scale = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / full_scale))
                .collect::<Result<_, _>>()?
        }
    };

    let samples = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect()
    };

    Ok(AudioBuffer::new(samples, spec.sample_rate))
}
