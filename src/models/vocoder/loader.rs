//! Asset cards, checkpoint conversion and model loading
//!
//! A model is described by a JSON asset card naming its model type, its
//! architecture and its checkpoint. The architecture supplies the default
//! configuration, the card's `model_config` overrides individual fields, and
//! the checkpoint is converted to the layout the builders expect (weight
//! normalization folded, keys renamed) before the model is built.

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device, Tensor};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::builder::{
    mel_vocoder_archs, vocoder_archs, ArchitectureRegistry, MelVocoderBuilder, MelVocoderConfig,
    VocoderBuilder, VocoderConfig,
};
use super::melhifigan::MelGenerator;
use super::vocoder::Vocoder;

/// Environment variable holding extra card directories.
pub const CARDS_ENV_VAR: &str = "SEAMLESS_VOCODER_CARDS";

/// Directory searched after the ones from [`CARDS_ENV_VAR`].
pub const DEFAULT_CARDS_DIR: &str = "cards";

const NORM_EPS: f64 = 1e-12;

/// Description of one model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetCard {
    pub name: String,
    pub model_type: String,
    pub model_arch: String,
    /// Local path, or a file name inside `repo`
    #[serde(default)]
    pub checkpoint: Option<String>,
    /// HuggingFace Hub repository holding the checkpoint
    #[serde(default)]
    pub repo: Option<String>,
    #[serde(default)]
    pub revision: Option<String>,
    /// Overrides applied on top of the architecture defaults
    #[serde(default)]
    pub model_config: Option<Value>,
    /// Directory relative checkpoint paths resolve against
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl AssetCard {
    /// Parse a card file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read asset card {}", path.display()))?;
        let base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        Self::from_json(&content, base_dir)
            .with_context(|| format!("Failed to parse asset card {}", path.display()))
    }

    pub fn from_json(json: &str, base_dir: PathBuf) -> Result<Self> {
        let mut card: Self = serde_json::from_str(json)?;
        card.base_dir = base_dir;
        Ok(card)
    }

    pub fn ensure_model_type(&self, expected: &str) -> Result<()> {
        if self.model_type != expected {
            bail!(
                "asset card '{}' has model type '{}', expected '{}'",
                self.name,
                self.model_type,
                expected
            );
        }
        Ok(())
    }

    /// Local path of the checkpoint, downloading it first when the card
    /// points at a hub repository.
    pub fn checkpoint_path(&self) -> Result<PathBuf> {
        let Some(checkpoint) = &self.checkpoint else {
            bail!("asset card '{}' has no checkpoint", self.name);
        };

        if let Some(repo) = &self.repo {
            return self.download(repo, checkpoint);
        }

        let path = Path::new(checkpoint);
        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        };
        if !path.exists() {
            bail!(
                "checkpoint of '{}' not found: {}",
                self.name,
                path.display()
            );
        }
        Ok(path)
    }

    #[cfg(feature = "hub")]
    fn download(&self, repo: &str, filename: &str) -> Result<PathBuf> {
        crate::hub::download_checkpoint(repo, filename, self.revision.as_deref())
    }

    #[cfg(not(feature = "hub"))]
    fn download(&self, repo: &str, _filename: &str) -> Result<PathBuf> {
        bail!(
            "asset card '{}' points at hub repository '{}', but the `hub` feature is disabled",
            self.name,
            repo
        )
    }
}

/// Finds asset cards by name.
#[derive(Debug, Clone, Default)]
pub struct AssetStore {
    search_dirs: Vec<PathBuf>,
}

impl AssetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Directories from [`CARDS_ENV_VAR`], then `./cards`.
    pub fn from_env() -> Self {
        let mut store = Self::new();
        if let Some(paths) = std::env::var_os(CARDS_ENV_VAR) {
            for dir in std::env::split_paths(&paths) {
                store.add_dir(dir);
            }
        }
        store.add_dir(DEFAULT_CARDS_DIR);
        store
    }

    pub fn add_dir(&mut self, dir: impl Into<PathBuf>) {
        self.search_dirs.push(dir.into());
    }

    pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.add_dir(dir);
        self
    }

    pub fn search_dirs(&self) -> &[PathBuf] {
        &self.search_dirs
    }

    /// Load a card by name, or from an explicit `.json` path.
    pub fn card(&self, name_or_path: &str) -> Result<AssetCard> {
        let as_path = Path::new(name_or_path);
        if as_path.extension().is_some_and(|ext| ext == "json") {
            return AssetCard::from_file(as_path);
        }

        for dir in &self.search_dirs {
            let candidate = dir.join(format!("{name_or_path}.json"));
            if candidate.is_file() {
                debug!("Found asset card {}", candidate.display());
                let card = AssetCard::from_file(&candidate)?;
                if card.name != name_or_path {
                    warn!(
                        "asset card {} is named '{}'",
                        candidate.display(),
                        card.name
                    );
                }
                return Ok(card);
            }
        }

        let searched: Vec<String> = self
            .search_dirs
            .iter()
            .map(|d| d.display().to_string())
            .collect();
        bail!(
            "asset card '{}' not found (searched: {})",
            name_or_path,
            searched.join(", ")
        )
    }
}

/// Apply `overrides` to a serialized configuration.
///
/// Top-level keys must already exist in `base`; nested objects are merged
/// key by key, everything else is replaced. Nested field names are checked
/// when the merged value is deserialized, since map sections such as
/// `multilingual` take new keys.
pub fn merge_config_overrides(base: &mut Value, overrides: &Value) -> Result<()> {
    let Value::Object(overrides) = overrides else {
        bail!("model_config must be a JSON object");
    };
    let Value::Object(base) = base else {
        bail!("configuration does not serialize to a JSON object");
    };

    for (key, value) in overrides {
        match base.get_mut(key) {
            Some(slot) => deep_merge(slot, value),
            None => bail!("unknown model_config key '{key}'"),
        }
    }
    Ok(())
}

fn deep_merge(base: &mut Value, value: &Value) {
    match (base, value) {
        (Value::Object(base), Value::Object(value)) => {
            for (key, v) in value {
                match base.get_mut(key) {
                    Some(slot) => deep_merge(slot, v),
                    None => {
                        base.insert(key.clone(), v.clone());
                    }
                }
            }
        }
        (slot, value) => *slot = value.clone(),
    }
}

/// Architecture defaults of `card` with its overrides applied.
fn config_from_card<C>(card: &AssetCard, registry: &ArchitectureRegistry<C>) -> Result<C>
where
    C: Serialize + DeserializeOwned,
{
    card.ensure_model_type(registry.model_type())?;
    let config = registry.get(&card.model_arch)?;

    let Some(overrides) = &card.model_config else {
        return Ok(config);
    };

    let mut value = serde_json::to_value(&config)?;
    merge_config_overrides(&mut value, overrides)
        .with_context(|| format!("invalid model_config in asset card '{}'", card.name))?;
    serde_json::from_value(value)
        .with_context(|| format!("invalid model_config in asset card '{}'", card.name))
}

/// Read every tensor of a checkpoint.
///
/// `.safetensors` files are memory-read by candle; PyTorch pickles
/// (`.pt`, `.pth`, `.bin`) are read with candle's pickle reader, looking
/// for the state dict under `generator`, then `model`, then at the root.
pub fn load_checkpoint(path: &Path, device: &Device) -> Result<HashMap<String, Tensor>> {
    if !path.exists() {
        bail!("checkpoint not found: {}", path.display());
    }

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default();
    let tensors = match ext {
        "safetensors" => candle_core::safetensors::load(path, device)
            .with_context(|| format!("Failed to load safetensors from {}", path.display()))?,
        "pt" | "pth" | "bin" => load_pickle(path, device)?,
        other => bail!(
            "unsupported checkpoint format '{}' ({})",
            other,
            path.display()
        ),
    };

    info!("Loaded {} tensors from {}", tensors.len(), path.display());
    Ok(tensors)
}

fn load_pickle(path: &Path, device: &Device) -> Result<HashMap<String, Tensor>> {
    for key in [Some("generator"), Some("model"), None] {
        let entries = match candle_core::pickle::read_all_with_key(path, key) {
            Ok(entries) => entries,
            Err(e) => {
                debug!("no state dict under {:?} in {}: {}", key, path.display(), e);
                continue;
            }
        };
        if entries.is_empty() {
            continue;
        }
        return entries
            .into_iter()
            .map(|(name, tensor)| Ok((name, tensor.to_device(device)?)))
            .collect();
    }
    bail!("no tensors found in {}", path.display())
}

/// `g * v / max(||v||, eps)`, the norm taken over every dim but the first.
pub fn apply_weight_norm(weight_g: &Tensor, weight_v: &Tensor) -> Result<Tensor> {
    let rank = weight_v.rank();
    let out = weight_v.dim(0)?;

    let mut norm_shape = vec![1usize; rank];
    norm_shape[0] = out;

    let norm = if rank > 1 {
        weight_v
            .flatten_from(1)?
            .sqr()?
            .sum_keepdim(1)?
            .sqrt()?
            .reshape(norm_shape.as_slice())?
    } else {
        weight_v.abs()?
    };
    let norm = norm.clamp(NORM_EPS, f64::MAX)?;

    let weight_g = weight_g.reshape(norm_shape.as_slice())?;
    Ok(weight_v.broadcast_div(&norm)?.broadcast_mul(&weight_g)?)
}

/// Replace every `X.weight_g` / `X.weight_v` pair with `X.weight`.
pub fn fold_weight_norm(tensors: HashMap<String, Tensor>) -> Result<HashMap<String, Tensor>> {
    let mut folded = HashMap::with_capacity(tensors.len());
    let mut pairs = 0usize;

    for (name, tensor) in &tensors {
        if let Some(base) = name.strip_suffix(".weight_v") {
            let weight = match tensors.get(&format!("{base}.weight_g")) {
                Some(weight_g) => {
                    pairs += 1;
                    apply_weight_norm(weight_g, tensor)
                        .with_context(|| format!("Failed to fold weight norm of {base}"))?
                }
                None => tensor.clone(),
            };
            folded.insert(format!("{base}.weight"), weight);
        } else if let Some(base) = name.strip_suffix(".weight_g") {
            if !tensors.contains_key(&format!("{base}.weight_v")) {
                warn!("dropping {name}: no matching weight_v");
            }
        } else {
            folded.insert(name.clone(), tensor.clone());
        }
    }

    debug!("Folded {} weight-normalized layers", pairs);
    Ok(folded)
}

fn strip_model_prefix(name: &str) -> &str {
    name.strip_prefix("model.").unwrap_or(name)
}

/// Bring a unit vocoder checkpoint into the `code_generator.*` layout.
pub fn convert_vocoder_checkpoint(
    tensors: HashMap<String, Tensor>,
) -> Result<HashMap<String, Tensor>> {
    let tensors = fold_weight_norm(tensors)?;
    Ok(tensors
        .into_iter()
        .map(|(name, tensor)| {
            let name = strip_model_prefix(&name);
            let name = if name.starts_with("code_generator.") {
                name.to_string()
            } else if let Some(rest) = name.strip_prefix("generator.") {
                format!("code_generator.{rest}")
            } else {
                format!("code_generator.{name}")
            };
            (name, tensor)
        })
        .collect())
}

/// Bring a mel vocoder checkpoint into the root-level layout.
pub fn convert_mel_vocoder_checkpoint(
    tensors: HashMap<String, Tensor>,
) -> Result<HashMap<String, Tensor>> {
    let tensors = fold_weight_norm(tensors)?;
    Ok(tensors
        .into_iter()
        .map(|(name, tensor)| {
            let name = strip_model_prefix(&name);
            let name = name.strip_prefix("generator.").unwrap_or(name);
            (name.to_string(), tensor)
        })
        .collect())
}

/// Configuration of a unit vocoder card.
pub fn load_vocoder_config(name_or_card: &str, store: &AssetStore) -> Result<VocoderConfig> {
    let card = store.card(name_or_card)?;
    config_from_card(&card, &vocoder_archs())
}

/// Load a unit vocoder with its checkpoint weights.
pub fn load_vocoder_model(
    name_or_card: &str,
    store: &AssetStore,
    device: &Device,
    dtype: DType,
) -> Result<Vocoder> {
    let card = store.card(name_or_card)?;
    let config = config_from_card(&card, &vocoder_archs())?;
    config
        .validate()
        .with_context(|| format!("invalid configuration for '{}'", card.name))?;

    info!(
        "Loading vocoder '{}' (arch {}) on {:?}",
        card.name, card.model_arch, device
    );
    let tensors = load_checkpoint(&card.checkpoint_path()?, device)?;
    let tensors = convert_vocoder_checkpoint(tensors)?;

    VocoderBuilder::new(config, device, dtype)
        .build_from_tensors(tensors)
        .with_context(|| format!("Failed to build vocoder '{}'", card.name))
}

/// Configuration of a mel vocoder card.
pub fn load_mel_vocoder_config(name_or_card: &str, store: &AssetStore) -> Result<MelVocoderConfig> {
    let card = store.card(name_or_card)?;
    config_from_card(&card, &mel_vocoder_archs())
}

/// Load a mel vocoder with its checkpoint weights.
pub fn load_mel_vocoder_model(
    name_or_card: &str,
    store: &AssetStore,
    device: &Device,
    dtype: DType,
) -> Result<MelGenerator> {
    let card = store.card(name_or_card)?;
    let config = config_from_card(&card, &mel_vocoder_archs())?;
    config
        .validate()
        .with_context(|| format!("invalid configuration for '{}'", card.name))?;

    info!(
        "Loading mel vocoder '{}' (arch {}) on {:?}",
        card.name, card.model_arch, device
    );
    let tensors = load_checkpoint(&card.checkpoint_path()?, device)?;
    let tensors = convert_mel_vocoder_checkpoint(tensors)?;

    MelVocoderBuilder::new(config, device, dtype)
        .build_from_tensors(tensors)
        .with_context(|| format!("Failed to build mel vocoder '{}'", card.name))
}
