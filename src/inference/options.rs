use serde::{Deserialize, Serialize};

/// What the decoder is asked to produce.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Task {
    Transcribe,
    Translate,
}

/// How the audio is carved into windows between stretches of speech.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChunkingStrategy {
    /// Fixed 30 s windows back to back.
    #[default]
    None,
    /// After a silent window, jump the seek to the next voiced chunk
    /// reported by the voice-activity detector.
    Vad,
}

/// Options recognized by a single transcription call.
///
/// Thresholds left as `None` disable the corresponding quality gate.
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct DecodingOptions {
    pub task: Task,
    /// ISO 639-1 code, or `None`/"auto" for detection on the first window.
    pub language: Option<String>,
    pub temperature: f32,
    /// How many times a rejected window is retried at a higher temperature.
    pub temperature_fallback_count: usize,
    /// Temperature increment added on each retry.
    pub temperature_fallback_step: f32,
    /// Maximum sampled tokens per window, clamped to the decoder context.
    pub sample_length: usize,
    /// Candidate pool for multinomial sampling at temperature > 0.
    pub top_k: usize,
    pub without_timestamps: bool,
    pub word_timestamps: bool,
    /// Forbid an empty transcript at the first sampled position.
    pub suppress_blank: bool,
    /// Token ids masked at every step.
    pub suppress_tokens: Vec<u32>,
    /// Upper bound in seconds for the first sampled timestamp. Applied
    /// only when set.
    pub max_initial_timestamp: Option<f32>,
    pub no_speech_threshold: Option<f32>,
    pub logprob_threshold: Option<f32>,
    pub first_token_logprob_threshold: Option<f32>,
    pub compression_ratio_threshold: Option<f32>,
    /// (start, end) second pairs restricting which audio ranges are decoded.
    /// Empty means the whole input.
    pub clip_timestamps: Vec<(f32, f32)>,
    pub skip_special_tokens: bool,
    /// Caller-supplied context tokens placed before the start-of-transcript
    /// block, behind the previous-context marker.
    pub prompt_tokens: Option<Vec<u32>>,
    /// Caller-supplied forced start of the transcript, placed after the
    /// start-of-transcript block.
    pub prefix_tokens: Option<Vec<u32>>,
    pub chunking_strategy: ChunkingStrategy,
    /// Clips decoded in parallel when more than one clip is requested.
    /// Windows within a clip are always sequential.
    pub concurrent_worker_count: usize,
    /// Feed the previous window's text into the next window's prompt.
    pub condition_on_previous_text: bool,
    /// Stop after language detection and return an empty segment list.
    pub detect_language_only: bool,
    /// Seed for the multinomial sampler. A fixed default keeps reruns
    /// reproducible at any temperature.
    pub seed: u64,
}

impl Default for DecodingOptions {
    fn default() -> Self {
        Self {
            task: Task::Transcribe,
            language: None,
            temperature: 0.0,
            temperature_fallback_count: 5,
            temperature_fallback_step: 0.2,
            sample_length: 224,
            top_k: 5,
            without_timestamps: false,
            word_timestamps: false,
            suppress_blank: true,
            suppress_tokens: Vec::new(),
            max_initial_timestamp: None,
            no_speech_threshold: Some(0.6),
            logprob_threshold: Some(-1.0),
            first_token_logprob_threshold: Some(-1.5),
            compression_ratio_threshold: Some(2.4),
            clip_timestamps: Vec::new(),
            skip_special_tokens: true,
            prompt_tokens: None,
            prefix_tokens: None,
            chunking_strategy: ChunkingStrategy::None,
            concurrent_worker_count: 1,
            condition_on_previous_text: true,
            detect_language_only: false,
            seed: 299_792_458,
        }
    }
}

impl DecodingOptions {
    /// Temperature for the given fallback attempt (attempt 0 is the first try).
    pub fn temperature_for_attempt(&self, attempt: usize) -> f32 {
        self.temperature + self.temperature_fallback_step * attempt as f32
    }

    /// Requested language, with "auto" normalized to `None`.
    pub fn requested_language(&self) -> Option<&str> {
        match self.language.as_deref() {
            None | Some("auto") | Some("") => None,
            Some(code) => Some(code),
        }
    }
}
