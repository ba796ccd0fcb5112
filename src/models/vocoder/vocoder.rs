//! Unit vocoder front-end
//!
//! Resolves language names and speaker choices to embedding indices and runs
//! the [`CodeGenerator`].

use anyhow::{bail, Context, Result};
use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

use super::codehifigan::{CodeGenerator, CodeGeneratorInput};
use crate::audio::AudioBuffer;

/// Output sample rate of the unit vocoders.
pub const VOCODER_SAMPLE_RATE: u32 = 16000;

/// Maps language names to language and speaker embedding indices.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LangSpkrIdxMap {
    /// Language name -> language embedding index
    #[serde(default)]
    pub multilingual: HashMap<String, u32>,
    /// Language name -> speaker embedding indices, first one is the default
    #[serde(default)]
    pub multispkr: HashMap<String, Vec<u32>>,
}

impl LangSpkrIdxMap {
    /// Parse from a JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read language map from {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse language map from {}", path.display()))
    }

    pub fn lang_index(&self, lang: &str) -> Result<u32> {
        match self.multilingual.get(lang) {
            Some(&idx) => Ok(idx),
            None => bail!("unknown language '{lang}'"),
        }
    }

    /// First speaker listed for `lang`.
    pub fn default_speaker(&self, lang: &str) -> Result<u32> {
        match self.multispkr.get(lang).and_then(|spkrs| spkrs.first()) {
            Some(&idx) => Ok(idx),
            None => bail!("no default speaker for language '{lang}'"),
        }
    }

    /// Check every index against the embedding table sizes.
    pub fn validate(&self, num_langs: usize, num_spkrs: usize) -> Result<()> {
        for (lang, &idx) in &self.multilingual {
            if idx as usize >= num_langs {
                bail!("language '{lang}' maps to index {idx}, but there are only {num_langs} languages");
            }
        }
        for (lang, spkrs) in &self.multispkr {
            if let Some(&idx) = spkrs.iter().find(|&&s| s as usize >= num_spkrs) {
                bail!("language '{lang}' lists speaker {idx}, but there are only {num_spkrs} speakers");
            }
        }
        Ok(())
    }
}

/// Target language(s) of a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum LangSelection {
    /// Same language for every row
    Single(String),
    /// One language per row
    PerItem(Vec<String>),
}

impl From<&str> for LangSelection {
    fn from(lang: &str) -> Self {
        Self::Single(lang.to_string())
    }
}

/// Speaker(s) of a batch.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum SpeakerSelection {
    /// Default speaker of each row's language
    #[default]
    Default,
    /// Same speaker index for every row
    Single(u32),
    /// One entry per row, `None` meaning the language default
    PerItem(Vec<Option<u32>>),
}

impl From<Option<u32>> for SpeakerSelection {
    fn from(spkr: Option<u32>) -> Self {
        match spkr {
            Some(idx) => Self::Single(idx),
            None => Self::Default,
        }
    }
}

/// Speech-unit vocoder.
pub struct Vocoder {
    code_generator: CodeGenerator,
    lang_spkr_idx_map: LangSpkrIdxMap,
}

impl Vocoder {
    pub fn new(code_generator: CodeGenerator, lang_spkr_idx_map: LangSpkrIdxMap) -> Self {
        Self {
            code_generator,
            lang_spkr_idx_map,
        }
    }

    /// Synthesize a batch of unit sequences.
    ///
    /// A rank-1 `units` tensor `[seq_len]` is ONE utterance and yields a batch
    /// of one, not `seq_len` single-unit utterances. Rank 2 is
    /// `[batch, seq_len]`; higher ranks keep dim 0 as the batch and flatten
    /// the rest into the sequence.
    /// Output shape: [batch, 1, samples]
    pub fn forward(
        &self,
        units: &Tensor,
        langs: &LangSelection,
        spkrs: &SpeakerSelection,
        dur_prediction: bool,
    ) -> Result<Tensor> {
        let code = match units.rank() {
            0 => bail!("units must have at least one dimension"),
            1 => units.unsqueeze(0)?,
            2 => units.clone(),
            _ => {
                let batch = units.dim(0)?;
                units.reshape((batch, ()))?
            }
        };
        let batch = code.dim(0)?;

        let lang_names: Vec<&str> = match langs {
            LangSelection::Single(lang) => vec![lang.as_str(); batch],
            LangSelection::PerItem(list) => {
                if list.len() != batch {
                    bail!("got {} languages for a batch of {batch}", list.len());
                }
                list.iter().map(String::as_str).collect()
            }
        };

        let lang_ids = lang_names
            .iter()
            .map(|lang| self.lang_spkr_idx_map.lang_index(lang))
            .collect::<Result<Vec<_>>>()?;

        let spkr_ids = match spkrs {
            SpeakerSelection::Default => lang_names
                .iter()
                .map(|lang| self.lang_spkr_idx_map.default_speaker(lang))
                .collect::<Result<Vec<_>>>()?,
            SpeakerSelection::Single(idx) => vec![*idx; batch],
            SpeakerSelection::PerItem(list) => {
                if list.len() != batch {
                    bail!("got {} speakers for a batch of {batch}", list.len());
                }
                list.iter()
                    .zip(&lang_names)
                    .map(|(spkr, lang)| match spkr {
                        Some(idx) => Ok(*idx),
                        None => self.lang_spkr_idx_map.default_speaker(lang),
                    })
                    .collect::<Result<Vec<_>>>()?
            }
        };

        debug!(
            batch,
            seq_len = code.dim(1)?,
            ?lang_ids,
            ?spkr_ids,
            "running unit vocoder"
        );

        let device = self.code_generator.device();
        let input = CodeGeneratorInput {
            code: code.to_dtype(DType::U32)?,
            spkr: Tensor::from_vec(spkr_ids, (batch, 1), device)?,
            lang: Tensor::from_vec(lang_ids, (batch, 1), device)?,
        };

        let (wav, _durations) = self.code_generator.forward(&input, dur_prediction)?;
        Ok(wav)
    }

    /// Synthesize one utterance with duration prediction.
    pub fn synthesize(&self, units: &[u32], lang: &str, spkr: Option<u32>) -> Result<AudioBuffer> {
        if units.is_empty() {
            bail!("no units to synthesize");
        }
        let units = Tensor::new(units, self.code_generator.device())?;
        let wav = self.forward(&units, &lang.into(), &spkr.into(), true)?;
        AudioBuffer::from_tensor(wav.flatten_all()?.to_dtype(DType::F32)?, VOCODER_SAMPLE_RATE)
    }

    pub fn sample_rate(&self) -> u32 {
        VOCODER_SAMPLE_RATE
    }

    pub fn code_generator(&self) -> &CodeGenerator {
        &self.code_generator
    }

    pub fn lang_spkr_idx_map(&self) -> &LangSpkrIdxMap {
        &self.lang_spkr_idx_map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::vocoder::builder::{VocoderBuilder, VocoderConfig};
    use candle_core::Device;

    fn tiny_vocoder() -> Vocoder {
        let builder = VocoderBuilder::new(VocoderConfig::tiny_for_tests(), &Device::Cpu, DType::F32);
        builder.build_random().unwrap().0
    }

    fn samples(wav: &Tensor) -> Vec<f32> {
        wav.flatten_all().unwrap().to_vec1().unwrap()
    }

    #[test]
    fn test_lang_map_lookups() {
        let map = VocoderConfig::tiny_for_tests().lang_spkr_idx_map;
        assert_eq!(map.lang_index("fra").unwrap(), 1);
        assert_eq!(map.default_speaker("fra").unwrap(), 3);

        let err = map.lang_index("jpn").unwrap_err();
        assert!(err.to_string().contains("jpn"));

        let err = map.default_speaker("deu").unwrap_err();
        assert!(err.to_string().contains("deu"));
    }

    #[test]
    fn test_lang_map_missing_sections() {
        let map: LangSpkrIdxMap = serde_json::from_str(r#"{"multilingual": {"eng": 0}}"#).unwrap();
        assert!(map.multispkr.is_empty());
        assert!(map.validate(1, 1).is_ok());
        assert!(map.validate(0, 1).is_err());
    }

    #[test]
    fn test_forward_rank_handling() {
        let vocoder = tiny_vocoder();
        let device = Device::Cpu;
        let factor = vocoder.code_generator().upsample_factor();

        let single = Tensor::new(&[1u32, 2, 3], &device).unwrap();
        let wav = vocoder
            .forward(&single, &"eng".into(), &SpeakerSelection::Default, false)
            .unwrap();
        assert_eq!(wav.dims(), &[1, 1, 3 * factor]);

        let nested = Tensor::new(&[[[1u32, 2], [3, 4]], [[5, 6], [7, 8]]], &device).unwrap();
        let wav = vocoder
            .forward(&nested, &"eng".into(), &SpeakerSelection::Default, false)
            .unwrap();
        assert_eq!(wav.dims(), &[2, 1, 4 * factor]);
    }

    #[test]
    fn test_rank_one_units_are_one_utterance() {
        let vocoder = tiny_vocoder();
        let device = Device::Cpu;
        let factor = vocoder.code_generator().upsample_factor();

        let flat = Tensor::new(&[1u32, 2, 3, 4], &device).unwrap();
        let as_row = Tensor::new(&[[1u32, 2, 3, 4]], &device).unwrap();
        let as_column = Tensor::new(&[[1u32], [2], [3], [4]], &device).unwrap();
        let spkr = SpeakerSelection::Single(1);

        let wav = vocoder.forward(&flat, &"eng".into(), &spkr, false).unwrap();
        let row = vocoder.forward(&as_row, &"eng".into(), &spkr, false).unwrap();
        let column = vocoder.forward(&as_column, &"eng".into(), &spkr, false).unwrap();

        assert_eq!(wav.dims(), &[1, 1, 4 * factor]);
        assert_eq!(samples(&wav), samples(&row));
        assert_eq!(column.dims(), &[4, 1, factor]);
    }

    #[test]
    fn test_default_speaker_matches_explicit() {
        let vocoder = tiny_vocoder();
        let units = Tensor::new(&[4u32, 5, 6, 7], &Device::Cpu).unwrap();

        let default = vocoder
            .forward(&units, &"fra".into(), &SpeakerSelection::Default, false)
            .unwrap();
        let explicit = vocoder
            .forward(&units, &"fra".into(), &SpeakerSelection::Single(3), false)
            .unwrap();
        let per_item = vocoder
            .forward(&units, &"fra".into(), &SpeakerSelection::PerItem(vec![None]), false)
            .unwrap();

        assert_eq!(samples(&default), samples(&explicit));
        assert_eq!(samples(&default), samples(&per_item));
    }

    #[test]
    fn test_per_item_languages() {
        let vocoder = tiny_vocoder();
        let units = Tensor::new(&[[1u32, 2], [3, 4]], &Device::Cpu).unwrap();

        let langs = LangSelection::PerItem(vec!["eng".into(), "deu".into()]);
        let spkrs = SpeakerSelection::PerItem(vec![None, Some(0)]);
        let wav = vocoder.forward(&units, &langs, &spkrs, false).unwrap();
        assert_eq!(wav.dim(0).unwrap(), 2);

        // "deu" has no speakers listed
        let err = vocoder
            .forward(&units, &langs, &SpeakerSelection::Default, false)
            .unwrap_err();
        assert!(err.to_string().contains("deu"));

        let short = LangSelection::PerItem(vec!["eng".into()]);
        assert!(vocoder
            .forward(&units, &short, &SpeakerSelection::Default, false)
            .is_err());
        assert!(vocoder
            .forward(&units, &"eng".into(), &SpeakerSelection::PerItem(vec![None]), false)
            .is_err());
    }

    #[test]
    fn test_unknown_language() {
        let vocoder = tiny_vocoder();
        let units = Tensor::new(&[1u32], &Device::Cpu).unwrap();
        let err = vocoder
            .forward(&units, &"kor".into(), &SpeakerSelection::Single(0), false)
            .unwrap_err();
        assert!(err.to_string().contains("kor"));
    }

    #[test]
    fn test_synthesize() {
        let vocoder = tiny_vocoder();
        let audio = vocoder.synthesize(&[1, 2, 3], "eng", None).unwrap();
        assert_eq!(audio.sample_rate, VOCODER_SAMPLE_RATE);
        assert!(audio.len() >= 3 * vocoder.code_generator().upsample_factor());
        assert_eq!(audio.len() % vocoder.code_generator().upsample_factor(), 0);

        assert!(vocoder.synthesize(&[], "eng", None).is_err());
    }
}
