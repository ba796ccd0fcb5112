//! Logging setup for binaries, with optional Chrome tracing.
//!
//! With the `profiling` feature, [`init`] installs a `tracing-chrome` layer
//! that records every span to a JSON trace (open it in `chrome://tracing` or
//! [Perfetto](https://ui.perfetto.dev)). Without it, [`init`] returns `None`
//! and [`init_logging`] falls back to a plain `fmt` subscriber.

use std::path::Path;

/// Default trace file, relative to the working directory.
pub const DEFAULT_TRACE_FILE: &str = "vocoder-trace.json";

/// Keeps the trace file open; it is flushed when dropped.
#[cfg(feature = "profiling")]
pub struct ProfilingGuard {
    _guard: tracing_chrome::FlushGuard,
}

#[cfg(not(feature = "profiling"))]
pub struct ProfilingGuard;

/// Install the Chrome tracing layer writing to `trace_file`.
///
/// Returns `None` when the `profiling` feature is disabled.
#[cfg_attr(not(feature = "profiling"), allow(unused_variables))]
pub fn init(trace_file: &Path) -> Option<ProfilingGuard> {
    #[cfg(feature = "profiling")]
    {
        use tracing_chrome::ChromeLayerBuilder;
        use tracing_subscriber::layer::SubscriberExt;
        use tracing_subscriber::util::SubscriberInitExt;

        let (chrome_layer, guard) = ChromeLayerBuilder::new()
            .file(trace_file)
            .include_args(true)
            .build();
        tracing_subscriber::registry().with(chrome_layer).init();

        tracing::info!("Profiling enabled, writing trace to {}", trace_file.display());
        Some(ProfilingGuard { _guard: guard })
    }

    #[cfg(not(feature = "profiling"))]
    {
        None
    }
}

/// Chrome tracing when profiling, otherwise `fmt` logging filtered by
/// `RUST_LOG` (default `info`).
///
/// Hold the returned guard until the end of `main`.
pub fn init_logging() -> Option<ProfilingGuard> {
    let guard = init(Path::new(DEFAULT_TRACE_FILE));
    if guard.is_none() {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        // a subscriber may already be installed, e.g. by a test harness
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    }
    guard
}
