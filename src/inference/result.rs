use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// One word with its aligned time span, produced when word timestamps are
/// requested.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct WordTiming {
    pub word: String,
    pub tokens: Vec<u32>,
    /// Seconds from the start of the input audio.
    pub start: f32,
    pub end: f32,
    /// In (0, 1]; derived from the mean token logprob.
    pub probability: f32,
}

/// One transcribed span bounded by timestamp tokens.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct TranscriptionSegment {
    pub id: usize,
    /// Sample offset of the window this segment was decoded from.
    pub seek: usize,
    /// Seconds from the start of the input audio.
    pub start: f32,
    pub end: f32,
    pub text: String,
    /// The text tokens decoded within the segment.
    pub tokens: Vec<u32>,
    pub token_logprobs: Vec<f32>,
    pub temperature: f32,
    pub avg_logprob: f32,
    pub compression_ratio: f32,
    pub no_speech_prob: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub words: Option<Vec<WordTiming>>,
}

impl TranscriptionSegment {
    /// An empty placeholder covering a window that failed every decode
    /// attempt. Keeps the timeline contiguous so downstream consumers see
    /// the gap.
    pub(crate) fn empty(id: usize, seek: usize, start: f32, end: f32) -> Self {
        Self {
            id,
            seek,
            start,
            end,
            text: String::new(),
            tokens: Vec::new(),
            token_logprobs: Vec::new(),
            temperature: 0.0,
            avg_logprob: 0.0,
            compression_ratio: 0.0,
            no_speech_prob: 0.0,
            words: None,
        }
    }
}

/// Wall-clock accounting for a transcription call.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct TranscriptionTimings {
    pub audio_seconds: f64,
    pub features_seconds: f64,
    pub encode_seconds: f64,
    pub decode_seconds: f64,
    pub total_seconds: f64,
    pub decoded_tokens: usize,
    pub tokens_per_second: f64,
    /// Audio seconds transcribed per wall-clock second.
    pub realtime_factor: f64,
}

impl TranscriptionTimings {
    pub(crate) fn finish(&mut self, total: f64) {
        self.total_seconds = total;
        if total > 0.0 {
            self.tokens_per_second = self.decoded_tokens as f64 / total;
            self.realtime_factor = self.audio_seconds / total;
        }
    }
}

/// The result of a whole transcription call.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct TranscriptionResult {
    /// Concatenation of the segment texts.
    pub text: String,
    pub segments: Vec<TranscriptionSegment>,
    /// ISO 639-1 code, detected or as requested.
    pub language: String,
    /// Softmax probabilities from language detection; empty when the
    /// language was given explicitly.
    pub language_probs: HashMap<String, f32>,
    pub timings: TranscriptionTimings,
    /// Sample offset the transcription stopped at, in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seek_time: Option<f64>,
}

/// Why a window's output was rejected and retried at a higher temperature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    CompressionRatio,
    AvgLogProb,
    FirstTokenLogProb,
}

/// Raw decoder output for one window attempt, before segment construction.
#[derive(Debug, Clone)]
pub struct DecodingResult {
    /// Sampled tokens, ending with end-of-text.
    pub tokens: Vec<u32>,
    pub token_logprobs: Vec<f32>,
    pub text: String,
    pub avg_logprob: f32,
    pub no_speech_prob: f32,
    pub compression_ratio: f32,
    pub temperature: f32,
    /// Language the window was decoded with.
    pub language: Option<String>,
    /// Set when an accepted attempt still tripped a quality gate (final
    /// attempt exhausted).
    pub fallback_reason: Option<FallbackReason>,
}

/// Snapshot handed to the progress callback after each sampled token.
#[derive(Debug, Clone, Serialize)]
pub struct TranscriptionProgress {
    /// Text of the current window so far.
    pub text: String,
    pub tokens: Vec<u32>,
    pub avg_logprob: f32,
    pub compression_ratio: f32,
    /// Start of the current window, in seconds.
    pub window_start: f32,
    pub temperature: f32,
}
