use candle_core::{Device, IndexOp, Tensor};
use candle_nn::{embedding, layer_norm, Embedding, LayerNorm, Module, VarBuilder};

use crate::inference::encoder::EncoderEmbedding;
use crate::inference::error::{Result, TranscribeError};
use crate::inference::layers::{causal_mask, FeedForward, MultiHeadAttention};
use crate::inference::model::ModelConfig;

/// Per-attempt decoder state: self-attention keys/values per layer, the
/// per-window cross-attention projections, and (optionally) the recorded
/// cross-attention distributions used for word alignment.
///
/// `reset` clears the autoregressive state but keeps the cross-attention
/// projections, since temperature fallback re-decodes the same window.
pub struct KvCache {
    self_kv: Vec<Option<(Tensor, Tensor)>>,
    cross_kv: Vec<Option<(Tensor, Tensor)>>,
    seq_len: usize,
    capacity: usize,
    alignment: Option<Vec<Vec<f32>>>,
}

impl KvCache {
    pub fn new(n_layers: usize, capacity: usize, collect_alignment: bool) -> Self {
        Self {
            self_kv: (0..n_layers).map(|_| None).collect(),
            cross_kv: (0..n_layers).map(|_| None).collect(),
            seq_len: 0,
            capacity,
            alignment: collect_alignment.then(Vec::new),
        }
    }

    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn reset(&mut self) {
        for kv in &mut self.self_kv {
            *kv = None;
        }
        self.seq_len = 0;
        if let Some(rows) = &mut self.alignment {
            rows.clear();
        }
    }

    /// One head- and layer-averaged attention distribution over the audio
    /// positions per decoded position, in decode order.
    pub fn alignment_rows(&self) -> Option<&[Vec<f32>]> {
        self.alignment.as_deref()
    }

    /// Whether this cache was asked to record alignment weights.
    pub fn collects_alignment(&self) -> bool {
        self.alignment.is_some()
    }

    /// Bumps the cached sequence length. Backends that keep their state
    /// elsewhere still advance the shared position bookkeeping through
    /// this.
    pub fn advance(&mut self, positions: usize) {
        self.seq_len += positions;
    }

    /// Appends one recorded attention row; a no-op unless alignment
    /// collection was requested at construction.
    pub fn push_alignment_row(&mut self, row: Vec<f32>) {
        if let Some(rows) = &mut self.alignment {
            rows.push(row);
        }
    }
}

/// Autoregressive text decoder seam. One `step` consumes the token at the
/// current cache position and yields the next-token logits; `prefill` runs
/// a whole prompt in one batched pass.
pub trait TextDecoder: Send + Sync {
    fn new_cache(&self, collect_alignment: bool) -> KvCache;
    fn prefill(
        &self,
        tokens: &[u32],
        embedding: &EncoderEmbedding,
        cache: &mut KvCache,
    ) -> Result<Vec<f32>>;
    fn step(
        &self,
        token: u32,
        embedding: &EncoderEmbedding,
        cache: &mut KvCache,
    ) -> Result<Vec<f32>>;
    /// Hard bound on tokens per window (prompt + sampled).
    fn max_decoder_ctx(&self) -> usize;
    fn vocab_size(&self) -> usize;
}

struct DecoderBlock {
    attn: MultiHeadAttention,
    attn_ln: LayerNorm,
    cross_attn: MultiHeadAttention,
    cross_attn_ln: LayerNorm,
    mlp: FeedForward,
    mlp_ln: LayerNorm,
}

impl DecoderBlock {
    fn new(n_state: usize, n_head: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        Ok(Self {
            attn: MultiHeadAttention::new(n_state, n_head, vb.pp("attn"))?,
            attn_ln: layer_norm(n_state, 1e-5, vb.pp("attn_ln"))?,
            cross_attn: MultiHeadAttention::new(n_state, n_head, vb.pp("cross_attn"))?,
            cross_attn_ln: layer_norm(n_state, 1e-5, vb.pp("cross_attn_ln"))?,
            mlp: FeedForward::new(n_state, vb.pp("mlp"))?,
            mlp_ln: layer_norm(n_state, 1e-5, vb.pp("mlp_ln"))?,
        })
    }
}

/// The Whisper text decoder with an externally owned KV-cache.
pub struct WhisperDecoder {
    token_embedding: Embedding,
    positional_embedding: Tensor,
    blocks: Vec<DecoderBlock>,
    ln: LayerNorm,
    device: Device,
    n_vocab: usize,
    n_text_ctx: usize,
    n_layers: usize,
}

impl WhisperDecoder {
    pub fn load(vb: VarBuilder, config: &ModelConfig) -> Result<Self> {
        let map_err = |e: candle_core::Error| TranscribeError::ModelUnavailable(e.to_string());
        let n_state = config.n_text_state;
        let token_embedding =
            embedding(config.n_vocab, n_state, vb.pp("token_embedding")).map_err(map_err)?;
        let positional_embedding = vb
            .get((config.n_text_ctx, n_state), "positional_embedding")
            .map_err(map_err)?;
        let blocks = (0..config.n_text_layer)
            .map(|i| DecoderBlock::new(n_state, config.n_text_head, vb.pp(format!("blocks.{i}"))))
            .collect::<candle_core::Result<Vec<_>>>()
            .map_err(map_err)?;
        let ln = layer_norm(n_state, 1e-5, vb.pp("ln")).map_err(map_err)?;
        Ok(Self {
            token_embedding,
            positional_embedding,
            blocks,
            ln,
            device: vb.device().clone(),
            n_vocab: config.n_vocab,
            n_text_ctx: config.n_text_ctx,
            n_layers: config.n_text_layer,
        })
    }

    /// Runs `tokens` starting at the current cache position and returns the
    /// logits of the final position.
    fn forward(
        &self,
        tokens: &[u32],
        embedding: &EncoderEmbedding,
        cache: &mut KvCache,
    ) -> Result<Vec<f32>> {
        if tokens.is_empty() {
            return Err(TranscribeError::PrepareDecoderInputsFailed(
                "empty decoder input".into(),
            ));
        }
        let offset = cache.seq_len;
        if offset + tokens.len() > cache.capacity {
            return Err(TranscribeError::PrepareDecoderInputsFailed(format!(
                "decoder context overflow: {} + {} tokens exceeds {}",
                offset,
                tokens.len(),
                cache.capacity
            )));
        }

        let q_len = tokens.len();
        let ids = Tensor::new(tokens, &self.device)?.unsqueeze(0)?;
        let positions = self.positional_embedding.i(offset..offset + q_len)?;
        let mut x = self
            .token_embedding
            .forward(&ids)?
            .broadcast_add(&positions)?;

        let mask = if q_len > 1 {
            Some(causal_mask(q_len, offset, &self.device)?)
        } else {
            None
        };

        let record = cache.alignment.is_some();
        let mut recorded_rows: Option<Vec<Vec<f32>>> = None;
        for (i, block) in self.blocks.iter().enumerate() {
            let residual = x.clone();
            let attn_out = block.attn.forward_cached(
                &block.attn_ln.forward(&x)?,
                &mut cache.self_kv[i],
                mask.as_ref(),
            )?;
            x = (residual + attn_out)?;

            if cache.cross_kv[i].is_none() {
                cache.cross_kv[i] = Some(block.cross_attn.kv(embedding.tensor())?);
            }
            let (cross_k, cross_v) = cache.cross_kv[i].as_ref().unwrap();
            let (cross_out, weights) = block.cross_attn.forward_cross(
                &block.cross_attn_ln.forward(&x)?,
                cross_k,
                cross_v,
                record,
            )?;
            x = (&x + cross_out)?;
            if let Some(rows) = weights {
                match &mut recorded_rows {
                    None => recorded_rows = Some(rows),
                    Some(acc) => {
                        for (dst, src) in acc.iter_mut().zip(rows.iter()) {
                            for (d, s) in dst.iter_mut().zip(src.iter()) {
                                *d += s;
                            }
                        }
                    }
                }
            }

            x = (&x + block.mlp.forward(&block.mlp_ln.forward(&x)?)?)?;
        }

        if let (Some(acc), Some(rows)) = (recorded_rows, cache.alignment.as_mut()) {
            let scale = 1.0 / self.n_layers as f32;
            for mut row in acc {
                for value in &mut row {
                    *value *= scale;
                }
                rows.push(row);
            }
        }

        let x = self.ln.forward(&x)?;
        let last = x.i((.., q_len - 1..q_len))?;
        let w = self.token_embedding.embeddings().broadcast_left(1)?;
        let logits = last.matmul(&w.t()?)?.i(0)?.i(0)?;
        cache.seq_len = offset + q_len;
        Ok(logits.to_vec1::<f32>()?)
    }
}

impl TextDecoder for WhisperDecoder {
    fn new_cache(&self, collect_alignment: bool) -> KvCache {
        KvCache::new(self.n_layers, self.max_decoder_ctx(), collect_alignment)
    }

    #[tracing::instrument(level = "trace", skip_all, fields(prompt_len = tokens.len()))]
    fn prefill(
        &self,
        tokens: &[u32],
        embedding: &EncoderEmbedding,
        cache: &mut KvCache,
    ) -> Result<Vec<f32>> {
        self.forward(tokens, embedding, cache)
    }

    fn step(
        &self,
        token: u32,
        embedding: &EncoderEmbedding,
        cache: &mut KvCache,
    ) -> Result<Vec<f32>> {
        self.forward(&[token], embedding, cache)
    }

    fn max_decoder_ctx(&self) -> usize {
        self.n_text_ctx / 2
    }

    fn vocab_size(&self) -> usize {
        self.n_vocab
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    #[test]
    fn cache_grows_per_step_and_resets_cleanly() {
        let mut cache = KvCache::new(2, 8, true);
        assert_eq!(cache.seq_len(), 0);
        cache.advance(3);
        cache.advance(1);
        assert_eq!(cache.seq_len(), 4);
        cache.push_alignment_row(vec![0.5; 10]);
        assert_eq!(cache.alignment_rows().unwrap().len(), 1);

        cache.reset();
        assert_eq!(cache.seq_len(), 0);
        assert!(cache.alignment_rows().unwrap().is_empty());
        assert!(cache.collects_alignment());
    }

    #[test]
    fn reset_keeps_cross_attention_projections() {
        let device = Device::Cpu;
        let mut cache = KvCache::new(1, 8, false);
        let k = Tensor::zeros((1, 4, 2), DType::F32, &device).unwrap();
        let v = Tensor::zeros((1, 4, 2), DType::F32, &device).unwrap();
        cache.cross_kv[0] = Some((k, v));
        cache.self_kv[0] = Some((
            Tensor::zeros((1, 2, 2), DType::F32, &device).unwrap(),
            Tensor::zeros((1, 2, 2), DType::F32, &device).unwrap(),
        ));
        cache.advance(2);

        cache.reset();
        assert!(cache.self_kv[0].is_none());
        assert!(cache.cross_kv[0].is_some());
    }

    #[test]
    fn alignment_rows_only_collect_when_requested() {
        let mut cache = KvCache::new(1, 8, false);
        cache.push_alignment_row(vec![1.0]);
        assert!(cache.alignment_rows().is_none());
        assert!(!cache.collects_alignment());
    }
}
