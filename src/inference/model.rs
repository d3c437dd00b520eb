use std::path::{Path, PathBuf};
use std::sync::Arc;

use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use hf_hub::api::sync::Api;
use hf_hub::{Repo, RepoType};
use serde::Deserialize;
use tokenizers::Tokenizer;
use tracing::info;

use crate::inference::decoder::WhisperDecoder;
use crate::inference::encoder::WhisperEncoder;
use crate::inference::error::{Result, TranscribeError};
use crate::inference::features::LogMelExtractor;
use crate::inference::tokens::WhisperTokenizer;
use crate::inference::N_AUDIO_CTX;

/// Model dimensions as stored in the artifact `config.json`.
#[derive(Deserialize, Debug, Clone, Copy)]
pub struct ModelConfig {
    pub n_mels: usize,
    pub n_audio_ctx: usize,
    pub n_audio_state: usize,
    pub n_audio_head: usize,
    pub n_audio_layer: usize,
    pub n_vocab: usize,
    pub n_text_ctx: usize,
    pub n_text_state: usize,
    pub n_text_head: usize,
    pub n_text_layer: usize,
}

/// The files making up one model artifact directory.
#[derive(Clone, Copy, Debug)]
enum DataFile {
    Config,
    Tokenizer,
    EncoderWeights,
    DecoderWeights,
    MelFilters80,
    MelFilters128,
}

impl DataFile {
    fn file_name(self) -> &'static str {
        match self {
            Self::Config => "config.json",
            Self::Tokenizer => "tokenizer.json",
            Self::EncoderWeights => "encoder.safetensors",
            Self::DecoderWeights => "decoder.safetensors",
            Self::MelFilters80 => "melfilters.bytes",
            Self::MelFilters128 => "melfilters128.bytes",
        }
    }
}

/// Where model artifacts come from: a local directory, or a Hugging Face
/// repository (cached by hf-hub).
#[derive(Debug, Clone)]
pub enum ModelSource {
    Directory(PathBuf),
    HuggingFace { repo_id: String, revision: String },
}

impl ModelSource {
    pub fn directory<P: AsRef<Path>>(path: P) -> Self {
        Self::Directory(path.as_ref().to_path_buf())
    }

    pub fn hugging_face(repo_id: impl Into<String>) -> Self {
        Self::HuggingFace {
            repo_id: repo_id.into(),
            revision: "main".into(),
        }
    }

    fn resolve(&self, file: DataFile) -> Result<PathBuf> {
        match self {
            Self::Directory(dir) => {
                let path = dir.join(file.file_name());
                if !path.exists() {
                    return Err(TranscribeError::ModelUnavailable(format!(
                        "missing {} in {}",
                        file.file_name(),
                        dir.display()
                    )));
                }
                Ok(path)
            }
            Self::HuggingFace { repo_id, revision } => {
                let api = Api::new()
                    .map_err(|e| TranscribeError::ModelUnavailable(e.to_string()))?;
                let repo = api.repo(Repo::with_revision(
                    repo_id.clone(),
                    RepoType::Model,
                    revision.clone(),
                ));
                repo.get(file.file_name()).map_err(|e| {
                    TranscribeError::ModelUnavailable(format!(
                        "{}: {e}",
                        file.file_name()
                    ))
                })
            }
        }
    }
}

/// A loaded Whisper model: feature extractor, encoder, decoder and
/// tokenizer, all read-only and shareable across transcriptions.
pub struct WhisperModel {
    pub config: ModelConfig,
    pub features: Arc<LogMelExtractor>,
    pub encoder: Arc<WhisperEncoder>,
    pub decoder: Arc<WhisperDecoder>,
    pub tokenizer: Arc<WhisperTokenizer>,
}

impl WhisperModel {
    #[tracing::instrument(level = "info", skip(device))]
    pub fn load(source: &ModelSource, device: &Device) -> Result<Self> {
        let config_path = source.resolve(DataFile::Config)?;
        let config: ModelConfig = serde_json::from_str(
            &std::fs::read_to_string(&config_path)
                .map_err(|e| TranscribeError::ModelUnavailable(e.to_string()))?,
        )
        .map_err(|e| {
            TranscribeError::ModelUnavailable(format!("malformed config.json: {e}"))
        })?;
        if config.n_audio_ctx != N_AUDIO_CTX {
            return Err(TranscribeError::ModelUnavailable(format!(
                "unsupported n_audio_ctx {} (expected {N_AUDIO_CTX})",
                config.n_audio_ctx
            )));
        }

        let mel_file = match config.n_mels {
            80 => DataFile::MelFilters80,
            128 => DataFile::MelFilters128,
            n => {
                return Err(TranscribeError::ModelUnavailable(format!(
                    "unexpected n_mels {n}"
                )))
            }
        };
        let mel_bytes = std::fs::read(source.resolve(mel_file)?)
            .map_err(|e| TranscribeError::ModelUnavailable(e.to_string()))?;
        let mut mel_filters = vec![0f32; mel_bytes.len() / 4];
        <byteorder::LittleEndian as byteorder::ByteOrder>::read_f32_into(
            &mel_bytes,
            &mut mel_filters,
        );
        let features = LogMelExtractor::new(config.n_mels, mel_filters)?;

        let tokenizer_path = source.resolve(DataFile::Tokenizer)?;
        let tokenizer = Tokenizer::from_file(&tokenizer_path).map_err(|e| {
            TranscribeError::TokenizerUnavailable(format!(
                "{}: {e}",
                tokenizer_path.display()
            ))
        })?;
        let tokenizer = WhisperTokenizer::new(tokenizer)?;

        let encoder_path = source.resolve(DataFile::EncoderWeights)?;
        let decoder_path = source.resolve(DataFile::DecoderWeights)?;
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(
                &[encoder_path, decoder_path],
                DType::F32,
                device,
            )
            .map_err(|e| TranscribeError::ModelUnavailable(e.to_string()))?
        };
        let encoder = WhisperEncoder::load(vb.pp("encoder"), &config)?;
        let decoder = WhisperDecoder::load(vb.pp("decoder"), &config)?;

        info!(
            n_mels = config.n_mels,
            n_vocab = config.n_vocab,
            n_audio_layer = config.n_audio_layer,
            n_text_layer = config.n_text_layer,
            multilingual = tokenizer.is_multilingual(),
            "model loaded"
        );

        Ok(Self {
            config,
            features: Arc::new(features),
            encoder: Arc::new(encoder),
            decoder: Arc::new(decoder),
            tokenizer: Arc::new(tokenizer),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_directory_reports_model_unavailable() {
        let source = ModelSource::directory("/nonexistent/model/dir");
        let err = WhisperModel::load(&source, &Device::Cpu).unwrap_err();
        assert!(matches!(err, TranscribeError::ModelUnavailable(_)));
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn config_parses_the_artifact_key_set() {
        let json = r#"{
            "n_mels": 80, "n_audio_ctx": 1500, "n_audio_state": 384,
            "n_audio_head": 6, "n_audio_layer": 4, "n_vocab": 51865,
            "n_text_ctx": 448, "n_text_state": 384, "n_text_head": 6,
            "n_text_layer": 4
        }"#;
        let config: ModelConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.n_text_ctx, 448);
        assert_eq!(config.n_mels, 80);
    }
}
