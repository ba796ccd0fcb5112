//! Benchmarks for vocoder inference with random weights.
//!
//! Run with: `cargo bench -- vocoder`

use candle_core::{DType, Device, Tensor};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use seamless_vocoder::{
    LangSelection, MelVocoderBuilder, MelVocoderConfig, SpeakerSelection, VocoderBuilder,
    VocoderConfig,
};
use std::hint::black_box;

/// Base generator stack with narrower channels, so a CPU run stays short.
fn bench_vocoder_config() -> VocoderConfig {
    let mut config = VocoderConfig::base();
    config.upsample_initial_channel = 128;
    config.embedding_dim = 128;
    config.lang_embedding_dim = 32;
    config.spkr_embedding_dim = 32;
    config.model_in_dim = 192;
    config.num_embeddings = 1000;
    config.num_langs = 1;
    config.num_spkrs = 1;
    if let Some(params) = config.dur_predictor_params.as_mut() {
        params.encoder_embed_dim = 128;
        params.var_pred_hidden_dim = 128;
    }
    config.lang_spkr_idx_map = serde_json::from_str(
        r#"{"multilingual": {"eng": 0}, "multispkr": {"eng": [0]}}"#,
    )
    .unwrap();
    config
}

fn bench_unit_vocoder(c: &mut Criterion) {
    let device = Device::Cpu;
    let (vocoder, _varmap) = VocoderBuilder::new(bench_vocoder_config(), &device, DType::F32)
        .build_random()
        .unwrap();

    let mut group = c.benchmark_group("unit_vocoder");
    group.sample_size(10);
    for num_units in [25usize, 100] {
        let ids: Vec<u32> = (0..num_units as u32).map(|i| (i * 37) % 1000).collect();
        let units = Tensor::new(ids.as_slice(), &device).unwrap();
        let langs = LangSelection::from("eng");

        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{num_units}_units")),
            &units,
            |b, units| {
                b.iter(|| {
                    vocoder
                        .forward(black_box(units), &langs, &SpeakerSelection::Default, false)
                        .unwrap()
                });
            },
        );
    }
    group.finish();
}

fn bench_mel_vocoder(c: &mut Criterion) {
    let device = Device::Cpu;
    let mut config = MelVocoderConfig::base_mel();
    config.upsample_initial_channel = 128;
    let (model, _varmap) = MelVocoderBuilder::new(config, &device, DType::F32)
        .build_random()
        .unwrap();

    let mut group = c.benchmark_group("mel_vocoder");
    group.sample_size(10);
    for frames in [50usize, 200] {
        let mel = Tensor::randn(0.0f32, 1.0, (frames, 80), &device).unwrap();
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{frames}_frames")),
            &mel,
            |b, mel| {
                b.iter(|| model.forward(black_box(mel), true).unwrap());
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_unit_vocoder, bench_mel_vocoder);
criterion_main!(benches);
