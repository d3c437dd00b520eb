//! Scripted mock backends for driving the orchestrator without model
//! weights. The decoder plays back per-window token scripts through the
//! real filter/sampler/seeker pipeline.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use candle_core::Device;

use speech_runner::inference::decoder::{KvCache, TextDecoder};
use speech_runner::inference::encoder::{AudioEncoder, EncoderEmbedding};
use speech_runner::inference::error::Result;
use speech_runner::inference::features::{FeatureExtractor, MelSpectrogram};
use speech_runner::inference::tokens::{SpecialTokens, Vocabulary, WordPiece};
use speech_runner::inference::transcriber::{Transcriber, TranscriberBuilder};
use speech_runner::inference::{N_AUDIO_CTX, N_FRAMES, N_SAMPLES_PER_WINDOW, SECONDS_PER_TIME_TOKEN};

// Synthetic vocabulary: text 0..100, specials 100..200, timestamps from
// 200, mirroring the real id ordering at a small scale.
pub const EOT: u32 = 100;
pub const SOT: u32 = 101;
pub const TRANSCRIBE: u32 = 102;
pub const TRANSLATE: u32 = 103;
pub const NO_SPEECH: u32 = 104;
pub const SOT_PREV: u32 = 105;
pub const LANG_EN: u32 = 110;
pub const LANG_ES: u32 = 111;
pub const LANG_JA: u32 = 112;
pub const NO_TIMESTAMPS: u32 = 199;
pub const TIME_BEGIN: u32 = 200;
pub const VOCAB_SIZE: usize = TIME_BEGIN as usize + 1501;

pub fn special_tokens() -> SpecialTokens {
    SpecialTokens {
        start_of_transcript: SOT,
        end_of_text: EOT,
        transcribe: TRANSCRIBE,
        translate: TRANSLATE,
        no_speech: NO_SPEECH,
        no_timestamps: NO_TIMESTAMPS,
        start_of_prev: SOT_PREV,
        special_token_begin: EOT,
        time_token_begin: TIME_BEGIN,
    }
}

/// Timestamp token for the given second offset.
pub fn ts(seconds: f32) -> u32 {
    TIME_BEGIN + (seconds / SECONDS_PER_TIME_TOKEN).round() as u32
}

pub struct MockVocab {
    special: SpecialTokens,
}

impl MockVocab {
    pub fn new() -> Self {
        Self {
            special: special_tokens(),
        }
    }
}

impl Vocabulary for MockVocab {
    fn decode(&self, tokens: &[u32], skip_special: bool) -> Result<String> {
        let mut out = String::new();
        for &token in tokens {
            if token >= self.special.special_token_begin {
                if !skip_special {
                    out.push_str(&format!("<|{token}|>"));
                }
            } else {
                out.push_str(&format!(" w{token}"));
            }
        }
        Ok(out)
    }

    fn split_to_word_tokens(&self, tokens: &[u32], _language: &str) -> Result<Vec<WordPiece>> {
        Ok(tokens
            .iter()
            .map(|&token| WordPiece {
                text: format!(" w{token}"),
                tokens: vec![token],
            })
            .collect())
    }

    fn language_token(&self, code: &str) -> Option<u32> {
        match code {
            "en" => Some(LANG_EN),
            "es" => Some(LANG_ES),
            "ja" => Some(LANG_JA),
            _ => None,
        }
    }

    fn language_code(&self, token: u32) -> Option<String> {
        match token {
            LANG_EN => Some("en".into()),
            LANG_ES => Some("es".into()),
            LANG_JA => Some("ja".into()),
            _ => None,
        }
    }

    fn whitespace_token_ids(&self) -> &[u32] {
        &[]
    }

    fn special(&self) -> &SpecialTokens {
        &self.special
    }
}

pub struct MockFeatures;

impl FeatureExtractor for MockFeatures {
    fn log_mel_spectrogram(&self, samples: &[f32]) -> Result<MelSpectrogram> {
        // The orchestrator must always hand over a fully padded window.
        assert_eq!(samples.len(), N_SAMPLES_PER_WINDOW);
        Ok(MelSpectrogram {
            n_mels: 1,
            n_frames: N_FRAMES,
            data: vec![0.0; N_FRAMES],
        })
    }

    fn n_mels(&self) -> usize {
        1
    }
}

pub struct MockEncoder;

impl AudioEncoder for MockEncoder {
    fn encode(&self, _mel: &MelSpectrogram) -> Result<EncoderEmbedding> {
        EncoderEmbedding::zeros(4, &Device::Cpu)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ScriptedStep {
    pub token: u32,
    pub peak: f32,
}

/// A scripted step with a peak high enough to win against the filter
/// stack's timestamp-mass rule.
pub fn step(token: u32) -> ScriptedStep {
    ScriptedStep { token, peak: 10.0 }
}

#[derive(Clone, Debug, Default)]
pub struct WindowScript {
    pub steps: Vec<ScriptedStep>,
}

impl WindowScript {
    pub fn of(tokens: &[u32]) -> Self {
        Self {
            steps: tokens.iter().map(|&t| step(t)).collect(),
        }
    }
}

#[derive(Default)]
struct DecoderState {
    prefill_calls: usize,
    current_script: usize,
    prompt_len: usize,
    prompts: Vec<Vec<u32>>,
}

/// Plays back one [`WindowScript`] per prefill call (clamped to the last
/// script), emitting peaked logits the samplers will follow.
pub struct MockDecoder {
    scripts: Vec<WindowScript>,
    detection_language_token: Option<u32>,
    state: Mutex<DecoderState>,
}

impl MockDecoder {
    pub fn new(scripts: Vec<WindowScript>) -> Self {
        Self {
            scripts,
            detection_language_token: None,
            state: Mutex::new(DecoderState::default()),
        }
    }

    pub fn with_detected_language(mut self, token: u32) -> Self {
        self.detection_language_token = Some(token);
        self
    }

    /// Window prefills observed (language-detection probes excluded).
    pub fn prefill_calls(&self) -> usize {
        self.state.lock().unwrap().prefill_calls
    }

    /// The prompts of every window prefill, in order.
    pub fn prompts(&self) -> Vec<Vec<u32>> {
        self.state.lock().unwrap().prompts.clone()
    }

    fn flat_logits() -> Vec<f32> {
        vec![0.0; VOCAB_SIZE]
    }

    fn logits_at(&self, script: usize, sample_index: usize) -> Vec<f32> {
        let mut logits = Self::flat_logits();
        match self.scripts[script].steps.get(sample_index) {
            Some(scripted) => logits[scripted.token as usize] = scripted.peak,
            None => logits[EOT as usize] = 10.0,
        }
        logits
    }

    fn bright_row(column: usize) -> Vec<f32> {
        let mut row = vec![0.01; N_AUDIO_CTX];
        row[column.min(N_AUDIO_CTX - 1)] = 1.0;
        row
    }
}

impl TextDecoder for MockDecoder {
    fn new_cache(&self, collect_alignment: bool) -> KvCache {
        KvCache::new(2, self.max_decoder_ctx(), collect_alignment)
    }

    fn prefill(
        &self,
        tokens: &[u32],
        _embedding: &EncoderEmbedding,
        cache: &mut KvCache,
    ) -> Result<Vec<f32>> {
        // A bare start-of-transcript prompt is the language-detection
        // probe; it does not consume a window script.
        if tokens == [SOT] {
            if let Some(language_token) = self.detection_language_token {
                cache.advance(1);
                let mut logits = Self::flat_logits();
                logits[language_token as usize] = 10.0;
                return Ok(logits);
            }
        }

        let mut state = self.state.lock().unwrap();
        state.current_script = state.prefill_calls.min(self.scripts.len() - 1);
        state.prompt_len = tokens.len();
        state.prefill_calls += 1;
        state.prompts.push(tokens.to_vec());

        if cache.collects_alignment() {
            for _ in 0..tokens.len() {
                cache.push_alignment_row(Self::bright_row(0));
            }
        }
        cache.advance(tokens.len());
        Ok(self.logits_at(state.current_script, 0))
    }

    fn step(
        &self,
        _token: u32,
        _embedding: &EncoderEmbedding,
        cache: &mut KvCache,
    ) -> Result<Vec<f32>> {
        let state = self.state.lock().unwrap();
        let sampled_index = cache.seq_len() - state.prompt_len;
        if cache.collects_alignment() {
            // One second of audio per scripted token.
            cache.push_alignment_row(Self::bright_row(sampled_index * 50));
        }
        cache.advance(1);
        Ok(self.logits_at(state.current_script, sampled_index + 1))
    }

    fn max_decoder_ctx(&self) -> usize {
        224
    }

    fn vocab_size(&self) -> usize {
        VOCAB_SIZE
    }
}

/// Builds a transcriber over the mock backends, returning the decoder for
/// later inspection.
pub fn scripted_transcriber(scripts: Vec<WindowScript>) -> (Transcriber, Arc<MockDecoder>) {
    scripted_transcriber_with(MockDecoder::new(scripts))
}

pub fn scripted_transcriber_with(decoder: MockDecoder) -> (Transcriber, Arc<MockDecoder>) {
    let decoder = Arc::new(decoder);
    let transcriber = TranscriberBuilder::new(
        Arc::new(MockFeatures),
        Arc::new(MockEncoder),
        decoder.clone() as Arc<dyn TextDecoder>,
        Arc::new(MockVocab::new()),
    )
    .build();
    (transcriber, decoder)
}

/// Seconds of silence as engine-ready samples.
pub fn silence(seconds: f32) -> Vec<f32> {
    vec![0.0; (seconds * 16000.0) as usize]
}
