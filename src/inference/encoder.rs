use candle_core::{Device, Tensor};
use candle_nn::{conv1d, layer_norm, Conv1d, Conv1dConfig, LayerNorm, Module, VarBuilder};

use crate::inference::error::{Result, TranscribeError};
use crate::inference::features::MelSpectrogram;
use crate::inference::layers::{sinusoids, ResidualAttentionBlock};
use crate::inference::model::ModelConfig;
use crate::inference::N_AUDIO_CTX;

/// Encoder output for one window: `[1, n_audio_ctx, n_state]`.
#[derive(Debug, Clone)]
pub struct EncoderEmbedding {
    tensor: Tensor,
}

impl EncoderEmbedding {
    pub fn from_tensor(tensor: Tensor) -> Result<Self> {
        let (_, n_ctx, _) = tensor
            .dims3()
            .map_err(|e| TranscribeError::EncoderFailed(e.to_string()))?;
        if n_ctx != N_AUDIO_CTX {
            return Err(TranscribeError::EncoderFailed(format!(
                "encoder embedding has {n_ctx} positions, expected {N_AUDIO_CTX}"
            )));
        }
        Ok(Self { tensor })
    }

    /// All-zero embedding; used by tests that script the decoder.
    pub fn zeros(n_state: usize, device: &Device) -> Result<Self> {
        let tensor = Tensor::zeros((1, N_AUDIO_CTX, n_state), candle_core::DType::F32, device)
            .map_err(|e| TranscribeError::EncoderFailed(e.to_string()))?;
        Ok(Self { tensor })
    }

    pub fn n_audio_ctx(&self) -> usize {
        N_AUDIO_CTX
    }

    pub(crate) fn tensor(&self) -> &Tensor {
        &self.tensor
    }
}

/// Mel → encoder embedding seam.
pub trait AudioEncoder: Send + Sync {
    fn encode(&self, mel: &MelSpectrogram) -> Result<EncoderEmbedding>;
}

/// The Whisper audio encoder: two 1-D convolutions with GELU, sinusoidal
/// positions, a stack of residual self-attention blocks and a final layer
/// norm.
pub struct WhisperEncoder {
    conv1: Conv1d,
    conv2: Conv1d,
    positional_embedding: Tensor,
    blocks: Vec<ResidualAttentionBlock>,
    ln_post: LayerNorm,
    device: Device,
    n_mels: usize,
}

impl WhisperEncoder {
    pub fn load(vb: VarBuilder, config: &ModelConfig) -> Result<Self> {
        let map_err = |e: candle_core::Error| TranscribeError::ModelUnavailable(e.to_string());
        let n_state = config.n_audio_state;
        let cfg1 = Conv1dConfig {
            padding: 1,
            stride: 1,
            ..Default::default()
        };
        let cfg2 = Conv1dConfig {
            padding: 1,
            stride: 2,
            ..Default::default()
        };
        let conv1 = conv1d(config.n_mels, n_state, 3, cfg1, vb.pp("conv1")).map_err(map_err)?;
        let conv2 = conv1d(n_state, n_state, 3, cfg2, vb.pp("conv2")).map_err(map_err)?;
        let positional_embedding =
            sinusoids(config.n_audio_ctx, n_state, vb.device()).map_err(map_err)?;
        let blocks = (0..config.n_audio_layer)
            .map(|i| {
                ResidualAttentionBlock::new(n_state, config.n_audio_head, vb.pp(format!("blocks.{i}")))
            })
            .collect::<candle_core::Result<Vec<_>>>()
            .map_err(map_err)?;
        let ln_post = layer_norm(n_state, 1e-5, vb.pp("ln_post")).map_err(map_err)?;
        Ok(Self {
            conv1,
            conv2,
            positional_embedding,
            blocks,
            ln_post,
            device: vb.device().clone(),
            n_mels: config.n_mels,
        })
    }

    fn forward(&self, mel: &MelSpectrogram) -> candle_core::Result<Tensor> {
        let x = Tensor::from_slice(
            &mel.data,
            (1, mel.n_mels, mel.n_frames),
            &self.device,
        )?;
        let x = self.conv1.forward(&x)?.gelu_erf()?;
        let x = self.conv2.forward(&x)?.gelu_erf()?;
        // [1, n_state, n_audio_ctx] -> [1, n_audio_ctx, n_state]
        let x = x.transpose(1, 2)?.contiguous()?;
        let mut x = x.broadcast_add(&self.positional_embedding)?;
        for block in &self.blocks {
            x = block.forward(&x)?;
        }
        self.ln_post.forward(&x)
    }
}

impl AudioEncoder for WhisperEncoder {
    #[tracing::instrument(level = "debug", skip(self, mel))]
    fn encode(&self, mel: &MelSpectrogram) -> Result<EncoderEmbedding> {
        if mel.n_mels != self.n_mels {
            return Err(TranscribeError::EncoderFailed(format!(
                "spectrogram has {} mel bins, model expects {}",
                mel.n_mels, self.n_mels
            )));
        }
        let tensor = self
            .forward(mel)
            .map_err(|e| TranscribeError::EncoderFailed(e.to_string()))?;
        EncoderEmbedding::from_tensor(tensor)
    }
}
