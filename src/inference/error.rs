use thiserror::Error;

pub type Result<T, E = TranscribeError> = std::result::Result<T, E>;

/// Errors surfaced by the transcription engine.
///
/// Model and tokenizer load failures are fatal for the engine; everything
/// else is scoped to a single transcription or window and handled by the
/// orchestrator's propagation policy.
#[derive(Debug, Error)]
pub enum TranscribeError {
    /// Model weights are missing or failed to load.
    #[error("model is not available: {0}")]
    ModelUnavailable(String),

    /// Tokenizer artifacts are missing or failed to load.
    #[error("tokenizer is not available: {0}")]
    TokenizerUnavailable(String),

    /// Audio could not be decoded or brought to 16 kHz mono f32.
    #[error("audio processing failed: {0}")]
    AudioProcessingFailed(String),

    /// The log-mel transform rejected its input or could not allocate.
    #[error("feature extraction failed: {0}")]
    FeatureExtractionFailed(String),

    /// The encoder backend returned an error or a malformed embedding.
    #[error("audio encoder failed: {0}")]
    EncoderFailed(String),

    /// A decoder step failed to produce logits.
    #[error("failed to decode logits: {0}")]
    DecodingLogitsFailed(String),

    /// The prompt could not be assembled within the decoder context.
    #[error("failed to prepare decoder inputs: {0}")]
    PrepareDecoderInputsFailed(String),

    /// Segment construction or word alignment hit malformed tokens/shapes.
    #[error("segmenting failed: {0}")]
    SegmentingFailed(String),

    /// Unrecoverable orchestrator-level failure.
    #[error("transcription failed: {0}")]
    TranscriptionFailed(String),

    /// The transcription was cancelled cooperatively.
    #[error("transcription cancelled")]
    Cancelled,
}

impl TranscribeError {
    /// Maps an error to the process exit code contract used by the CLI:
    /// 2 model unavailable, 3 audio error, 4 transcription error.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::ModelUnavailable(_) | Self::TokenizerUnavailable(_) => 2,
            Self::AudioProcessingFailed(_) | Self::FeatureExtractionFailed(_) => 3,
            _ => 4,
        }
    }
}

impl From<candle_core::Error> for TranscribeError {
    fn from(err: candle_core::Error) -> Self {
        Self::DecodingLogitsFailed(err.to_string())
    }
}
