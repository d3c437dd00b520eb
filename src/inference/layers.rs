use candle_core::{Result, Tensor, D};
use candle_nn::ops::softmax;
use candle_nn::{layer_norm, linear, linear_no_bias, LayerNorm, Linear, Module, VarBuilder};

/// Multi-head attention with the Whisper projection layout (key has no
/// bias). Query and key are each scaled by d_head^-0.25 so the product
/// carries the usual 1/sqrt(d_head) factor.
pub(crate) struct MultiHeadAttention {
    query: Linear,
    key: Linear,
    value: Linear,
    out: Linear,
    n_head: usize,
}

impl MultiHeadAttention {
    pub(crate) fn new(n_state: usize, n_head: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            query: linear(n_state, n_state, vb.pp("query"))?,
            key: linear_no_bias(n_state, n_state, vb.pp("key"))?,
            value: linear(n_state, n_state, vb.pp("value"))?,
            out: linear(n_state, n_state, vb.pp("out"))?,
            n_head,
        })
    }

    /// Key/value projections for a cross-attention source, computed once
    /// per window and cached by the caller.
    pub(crate) fn kv(&self, xa: &Tensor) -> Result<(Tensor, Tensor)> {
        let k = self.key.forward(xa)?;
        let v = self.value.forward(xa)?;
        Ok((k, v))
    }

    /// Self-attention over `x`, appending this call's keys/values to the
    /// caller-owned cache.
    pub(crate) fn forward_cached(
        &self,
        x: &Tensor,
        cache: &mut Option<(Tensor, Tensor)>,
        mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let q = self.query.forward(x)?;
        let k = self.key.forward(x)?;
        let v = self.value.forward(x)?;
        let (k, v) = match cache.take() {
            None => (k, v),
            Some((k_cache, v_cache)) => {
                let k = Tensor::cat(&[&k_cache, &k], 1)?;
                let v = Tensor::cat(&[&v_cache, &v], 1)?;
                (k, v)
            }
        };
        *cache = Some((k.clone(), v.clone()));
        let (output, _) = self.qkv_attention(&q, &k, &v, mask, false)?;
        Ok(output)
    }

    /// Plain self-attention without caching, used by the encoder.
    pub(crate) fn forward(&self, x: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let q = self.query.forward(x)?;
        let k = self.key.forward(x)?;
        let v = self.value.forward(x)?;
        let (output, _) = self.qkv_attention(&q, &k, &v, mask, false)?;
        Ok(output)
    }

    /// Cross-attention against precomputed keys/values. When
    /// `record_weights` is set, the head-averaged attention distribution is
    /// returned alongside the output, one row per query position.
    pub(crate) fn forward_cross(
        &self,
        x: &Tensor,
        k: &Tensor,
        v: &Tensor,
        record_weights: bool,
    ) -> Result<(Tensor, Option<Vec<Vec<f32>>>)> {
        let q = self.query.forward(x)?;
        self.qkv_attention(&q, k, v, None, record_weights)
    }

    fn qkv_attention(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
        record_weights: bool,
    ) -> Result<(Tensor, Option<Vec<Vec<f32>>>)> {
        let (batch, q_len, n_state) = q.dims3()?;
        let (_, kv_len, _) = k.dims3()?;
        let head_dim = n_state / self.n_head;
        let scale = (head_dim as f64).powf(-0.25);

        let q = (q.reshape((batch, q_len, self.n_head, head_dim))?
            .transpose(1, 2)?
            .contiguous()?
            * scale)?;
        let k = (k.reshape((batch, kv_len, self.n_head, head_dim))?
            .transpose(1, 2)?
            .contiguous()?
            * scale)?;
        let v = v
            .reshape((batch, kv_len, self.n_head, head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        let mut qk = q.matmul(&k.transpose(2, 3)?)?;
        if let Some(mask) = mask {
            qk = qk.broadcast_add(mask)?;
        }
        let weights = softmax(&qk, D::Minus1)?;

        let recorded = if record_weights {
            // Average over the head dimension; one distribution over the
            // audio positions per query position.
            let mean = weights.mean(1)?.squeeze(0)?;
            Some(mean.to_vec2::<f32>()?)
        } else {
            None
        };

        let output = weights
            .matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, q_len, n_state))?;
        Ok((self.out.forward(&output)?, recorded))
    }
}

/// Position-wise feed-forward block (`mlp.0` → GELU → `mlp.2`).
pub(crate) struct FeedForward {
    fc1: Linear,
    fc2: Linear,
}

impl FeedForward {
    pub(crate) fn new(n_state: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            fc1: linear(n_state, 4 * n_state, vb.pp("0"))?,
            fc2: linear(4 * n_state, n_state, vb.pp("2"))?,
        })
    }

    pub(crate) fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.fc2.forward(&self.fc1.forward(x)?.gelu_erf()?)
    }
}

/// Pre-norm residual self-attention block used by the encoder.
pub(crate) struct ResidualAttentionBlock {
    attn: MultiHeadAttention,
    attn_ln: LayerNorm,
    mlp: FeedForward,
    mlp_ln: LayerNorm,
}

impl ResidualAttentionBlock {
    pub(crate) fn new(n_state: usize, n_head: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            attn: MultiHeadAttention::new(n_state, n_head, vb.pp("attn"))?,
            attn_ln: layer_norm(n_state, 1e-5, vb.pp("attn_ln"))?,
            mlp: FeedForward::new(n_state, vb.pp("mlp"))?,
            mlp_ln: layer_norm(n_state, 1e-5, vb.pp("mlp_ln"))?,
        })
    }

    pub(crate) fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = (x + self.attn.forward(&self.attn_ln.forward(x)?, None)?)?;
        let x = (&x + self.mlp.forward(&self.mlp_ln.forward(&x)?)?)?;
        Ok(x)
    }
}

/// Fixed sinusoidal positional embedding of shape `[length, channels]`.
pub(crate) fn sinusoids(length: usize, channels: usize, device: &candle_core::Device) -> Result<Tensor> {
    let max_timescale = 10000f32;
    let log_timescale_increment = max_timescale.ln() / (channels / 2 - 1) as f32;
    let mut data = Vec::with_capacity(length * channels);
    for pos in 0..length {
        for i in 0..channels / 2 {
            let inv_timescale = (-(i as f32) * log_timescale_increment).exp();
            data.push((pos as f32 * inv_timescale).sin());
        }
        for i in 0..channels / 2 {
            let inv_timescale = (-(i as f32) * log_timescale_increment).exp();
            data.push((pos as f32 * inv_timescale).cos());
        }
    }
    Tensor::from_vec(data, (length, channels), device)
}

/// Additive causal mask of shape `[q_len, offset + q_len]`: position `i`
/// may attend to absolute positions `0..=offset + i`.
pub(crate) fn causal_mask(
    q_len: usize,
    offset: usize,
    device: &candle_core::Device,
) -> Result<Tensor> {
    let kv_len = offset + q_len;
    let mut data = Vec::with_capacity(q_len * kv_len);
    for i in 0..q_len {
        for j in 0..kv_len {
            data.push(if j <= offset + i { 0f32 } else { f32::NEG_INFINITY });
        }
    }
    Tensor::from_vec(data, (q_len, kv_len), device)
}
