pub mod align;
pub mod decoder;
pub mod encoder;
pub mod error;
pub mod features;
pub mod filters;
pub mod language;
pub(crate) mod layers;
pub mod model;
pub mod options;
pub mod pcm_decode;
pub mod result;
pub mod sampler;
pub mod segment;
pub mod tokens;
pub mod transcriber;

pub use error::{Result, TranscribeError};
pub use model::{ModelSource, WhisperModel};
pub use options::{ChunkingStrategy, DecodingOptions, Task};
pub use result::{TranscriptionResult, TranscriptionSegment, WordTiming};
pub use transcriber::{Transcriber, TranscriberBuilder};

/// Expected input sample rate in Hz. Callers resample before handing audio over.
pub const SAMPLE_RATE: usize = 16000;
/// STFT size used by the feature extractor.
pub const N_FFT: usize = 400;
/// STFT hop length; one mel frame covers this many samples.
pub const HOP_LENGTH: usize = 160;
/// Seconds of audio per processing window.
pub const WINDOW_SECONDS: usize = 30;
/// Samples per processing window.
pub const N_SAMPLES_PER_WINDOW: usize = SAMPLE_RATE * WINDOW_SECONDS;
/// Mel frames per processing window.
pub const N_FRAMES: usize = N_SAMPLES_PER_WINDOW / HOP_LENGTH;
/// Encoder output positions per window (two mel frames per position).
pub const N_AUDIO_CTX: usize = N_FRAMES / 2;
/// Seconds encoded by one timestamp token increment.
pub const SECONDS_PER_TIME_TOKEN: f32 = 0.02;
/// Samples encoded by one timestamp token increment (20 ms at 16 kHz).
pub const SAMPLES_PER_TIME_TOKEN: usize = SAMPLE_RATE / 50;
