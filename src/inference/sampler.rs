use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::inference::error::{Result, TranscribeError};

/// One sampled token with its logprob under the unscaled distribution.
#[derive(Debug, Clone, Copy)]
pub struct SamplingStep {
    pub token: u32,
    pub logprob: f32,
    /// The window is done: end-of-text, or the context bound was reached.
    pub completed: bool,
}

/// Logits → next-token policy. Greedy and top-k multinomial exist; other
/// policies plug in behind the same seam.
pub trait TokenSampler: Send {
    /// `tokens` is the full window token list, prompt included.
    fn update(&mut self, tokens: &[u32], logits: &[f32]) -> Result<SamplingStep>;

    /// Guarantees the sampled sequence ends with end-of-text; the appended
    /// token carries logprob 0.
    fn finalize(&self, tokens: Vec<u32>, logprobs: Vec<f32>) -> (Vec<u32>, Vec<f32>);
}

/// Builds the sampler matching the attempt temperature.
pub fn sampler_for_temperature(
    temperature: f32,
    top_k: usize,
    seed: u64,
    end_of_text: u32,
    max_tokens: usize,
) -> Box<dyn TokenSampler> {
    if temperature > 0.0 {
        Box::new(TopKSampler::new(top_k, temperature, seed, end_of_text, max_tokens))
    } else {
        Box::new(GreedySampler::new(end_of_text, max_tokens))
    }
}

pub struct GreedySampler {
    end_of_text: u32,
    max_tokens: usize,
}

impl GreedySampler {
    pub fn new(end_of_text: u32, max_tokens: usize) -> Self {
        Self {
            end_of_text,
            max_tokens,
        }
    }
}

impl TokenSampler for GreedySampler {
    fn update(&mut self, tokens: &[u32], logits: &[f32]) -> Result<SamplingStep> {
        let token = argmax(logits).ok_or_else(|| {
            TranscribeError::DecodingLogitsFailed("no finite logits to sample from".into())
        })?;
        let logprob = log_softmax_at(logits, token as usize);
        Ok(SamplingStep {
            token,
            logprob,
            completed: token == self.end_of_text || tokens.len() + 1 >= self.max_tokens,
        })
    }

    fn finalize(&self, tokens: Vec<u32>, logprobs: Vec<f32>) -> (Vec<u32>, Vec<f32>) {
        finalize_with_eot(tokens, logprobs, self.end_of_text)
    }
}

pub struct TopKSampler {
    k: usize,
    temperature: f32,
    end_of_text: u32,
    max_tokens: usize,
    rng: StdRng,
}

impl TopKSampler {
    pub fn new(k: usize, temperature: f32, seed: u64, end_of_text: u32, max_tokens: usize) -> Self {
        Self {
            k: k.max(1),
            temperature,
            end_of_text,
            max_tokens,
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl TokenSampler for TopKSampler {
    fn update(&mut self, tokens: &[u32], logits: &[f32]) -> Result<SamplingStep> {
        // Scale by temperature, softmax, then draw from the k most likely
        // candidates proportionally to their mass.
        let mut indexed: Vec<(usize, f32)> = logits
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, l)| l.is_finite())
            .collect();
        if indexed.is_empty() {
            return Err(TranscribeError::DecodingLogitsFailed(
                "no finite logits to sample from".into(),
            ));
        }
        indexed.sort_unstable_by(|a, b| b.1.total_cmp(&a.1));
        indexed.truncate(self.k);

        let max_scaled = indexed[0].1 / self.temperature;
        let weights: Vec<f32> = indexed
            .iter()
            .map(|(_, l)| (l / self.temperature - max_scaled).exp())
            .collect();
        let distribution = WeightedIndex::new(&weights)
            .map_err(|e| TranscribeError::DecodingLogitsFailed(e.to_string()))?;
        let choice = distribution.sample(&mut self.rng);
        let token = indexed[choice].0 as u32;
        let logprob = log_softmax_at(logits, token as usize);
        Ok(SamplingStep {
            token,
            logprob,
            completed: token == self.end_of_text || tokens.len() + 1 >= self.max_tokens,
        })
    }

    fn finalize(&self, tokens: Vec<u32>, logprobs: Vec<f32>) -> (Vec<u32>, Vec<f32>) {
        finalize_with_eot(tokens, logprobs, self.end_of_text)
    }
}

fn finalize_with_eot(
    mut tokens: Vec<u32>,
    mut logprobs: Vec<f32>,
    end_of_text: u32,
) -> (Vec<u32>, Vec<f32>) {
    if tokens.last() != Some(&end_of_text) {
        tokens.push(end_of_text);
        logprobs.push(0.0);
    }
    (tokens, logprobs)
}

fn argmax(logits: &[f32]) -> Option<u32> {
    logits
        .iter()
        .enumerate()
        .filter(|(_, l)| l.is_finite())
        .max_by(|(_, a), (_, b)| a.total_cmp(b))
        .map(|(i, _)| i as u32)
}

/// Logprob of one index under the softmax of the full (unscaled) logits.
fn log_softmax_at(logits: &[f32], index: usize) -> f32 {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let sum: f32 = logits
        .iter()
        .filter(|l| l.is_finite())
        .map(|l| (l - max).exp())
        .sum();
    logits[index] - max - sum.ln()
}
