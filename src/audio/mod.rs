//! Waveform container and WAV I/O for vocoder output

mod io;

pub use io::{read_wav, write_wav, AudioBuffer, WavEncoding};
