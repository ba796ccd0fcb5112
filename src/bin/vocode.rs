//! Vocode speech units or mel-spectrograms into a WAV file
//!
//! Usage:
//!     cargo run --features cli --bin vocode -- units --card vocoder_36langs \
//!         --units "12 45 45 873" --lang eng --output out.wav
//!     cargo run --features cli --bin vocode -- mel --card cards/mel.json \
//!         --mel mel.safetensors --output out.wav

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device, Tensor};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Instant;

use seamless_vocoder::audio::{write_wav, WavEncoding};
use seamless_vocoder::{
    compute_dtype_for_device, device_info, load_mel_vocoder_model, load_vocoder_model,
    parse_device, AssetStore, AudioBuffer, LangSelection, SpeakerSelection,
};

/// Turn speech units or mel-spectrograms into audio
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// Asset card name, or path to a card .json file
    #[arg(long, global = true)]
    card: Option<String>,

    /// Extra directories to search for asset cards (searched first)
    #[arg(long = "cards-dir", global = true)]
    cards_dirs: Vec<PathBuf>,

    /// Device for inference (auto, cpu, cuda, cuda:N, metal)
    #[arg(long, default_value = "auto", global = true)]
    device: String,

    /// Output WAV file
    #[arg(short, long, default_value = "output.wav", global = true)]
    output: PathBuf,

    /// Write 32-bit float samples instead of 16-bit PCM
    #[arg(long, global = true)]
    float: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Vocode discrete speech units
    Units {
        /// Unit ids separated by spaces or commas
        #[arg(long, conflicts_with = "units_file")]
        units: Option<String>,

        /// File holding unit ids separated by whitespace or commas
        #[arg(long)]
        units_file: Option<PathBuf>,

        /// Target language code, e.g. eng
        #[arg(long)]
        lang: String,

        /// Speaker index (defaults to the language's first speaker)
        #[arg(long)]
        speaker: Option<u32>,

        /// Use every unit once instead of predicting durations
        #[arg(long)]
        no_dur_prediction: bool,
    },
    /// Vocode a mel-spectrogram of shape [frames, n_mels]
    Mel {
        /// .safetensors file with a `mel` tensor, or a .npy file
        #[arg(long)]
        mel: PathBuf,

        /// Skip mean/scale normalization
        #[arg(long)]
        no_normalize: bool,
    },
}

fn parse_units(text: &str) -> Result<Vec<u32>> {
    text.split(|c: char| c.is_whitespace() || c == ',')
        .filter(|tok| !tok.is_empty())
        .map(|tok| {
            tok.parse::<u32>()
                .with_context(|| format!("invalid unit id '{tok}'"))
        })
        .collect()
}

fn read_mel(path: &Path, device: &Device) -> Result<Tensor> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
    let mel = match ext {
        "npy" => Tensor::read_npy(path)
            .with_context(|| format!("Failed to read {}", path.display()))?,
        "safetensors" => {
            let mut tensors = candle_core::safetensors::load(path, &Device::Cpu)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            match tensors.remove("mel") {
                Some(mel) => mel,
                None => bail!("{} has no `mel` tensor", path.display()),
            }
        }
        other => bail!("unsupported mel file format '{other}'"),
    };
    Ok(mel.to_device(device)?)
}

fn main() -> Result<()> {
    let _profiling_guard = seamless_vocoder::profiling::init_logging();

    let cli = Cli::parse();
    let common = &cli.common;

    let Some(card) = common.card.as_deref() else {
        bail!("--card is required");
    };

    let mut store = AssetStore::new();
    for dir in &common.cards_dirs {
        store.add_dir(dir);
    }
    for dir in AssetStore::from_env().search_dirs() {
        store.add_dir(dir);
    }

    let device = parse_device(&common.device)?;
    let dtype = compute_dtype_for_device(&device);
    tracing::info!("Device: {} ({:?})", device_info(&device), dtype);

    let start = Instant::now();
    let audio = match &cli.command {
        Command::Units {
            units,
            units_file,
            lang,
            speaker,
            no_dur_prediction,
        } => {
            let text = match (units, units_file) {
                (Some(units), _) => units.clone(),
                (None, Some(file)) => std::fs::read_to_string(file)
                    .with_context(|| format!("Failed to read {}", file.display()))?,
                (None, None) => bail!("pass --units or --units-file"),
            };
            let units = parse_units(&text)?;
            if units.is_empty() {
                bail!("no unit ids given");
            }

            let vocoder = load_vocoder_model(card, &store, &device, dtype)?;
            tracing::info!("Vocoding {} units ({})", units.len(), lang);

            let unit_tensor = Tensor::new(units.as_slice(), &device)?;
            let wav = vocoder.forward(
                &unit_tensor,
                &LangSelection::from(lang.as_str()),
                &SpeakerSelection::from(*speaker),
                !no_dur_prediction,
            )?;
            AudioBuffer::from_tensor(wav.to_dtype(DType::F32)?, vocoder.sample_rate())?
        }
        Command::Mel { mel, no_normalize } => {
            let model = load_mel_vocoder_model(card, &store, &device, dtype)?;
            let mel = read_mel(mel, &device)?.to_dtype(dtype)?;
            tracing::info!("Vocoding mel-spectrogram {:?}", mel.dims());

            let wav = model.forward(&mel, !no_normalize)?;
            AudioBuffer::from_tensor(wav, model.sample_rate())?
        }
    };

    let elapsed = start.elapsed().as_secs_f64();
    let encoding = if common.float {
        WavEncoding::Float32
    } else {
        WavEncoding::Pcm16
    };
    write_wav(&common.output, &audio, encoding)?;

    tracing::info!(
        "Wrote {:.2}s of audio to {} in {:.2}s (RTF {:.3})",
        audio.duration(),
        common.output.display(),
        elapsed,
        elapsed / audio.duration().max(f32::EPSILON) as f64
    );
    Ok(())
}
