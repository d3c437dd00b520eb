use std::collections::HashMap;
use std::io::Write;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use flate2::write::ZlibEncoder;
use flate2::Compression;
use tracing::{debug, error, info};

use crate::inference::align::{self, AlignmentWeights};
use crate::inference::decoder::TextDecoder;
use crate::inference::encoder::AudioEncoder;
use crate::inference::error::{Result, TranscribeError};
use crate::inference::features::FeatureExtractor;
use crate::inference::filters::{
    LogitsFilter, LogitsFilterStack, SuppressBlank, SuppressTokens, TimestampRules,
};
use crate::inference::language::detect_language;
use crate::inference::model::WhisperModel;
use crate::inference::options::{ChunkingStrategy, DecodingOptions, Task};
use crate::inference::result::{
    DecodingResult, FallbackReason, TranscriptionProgress, TranscriptionResult,
    TranscriptionSegment, TranscriptionTimings,
};
use crate::inference::sampler::sampler_for_temperature;
use crate::inference::segment::{SegmentDraft, SegmentSeeker};
use crate::inference::tokens::Vocabulary;
use crate::inference::{N_SAMPLES_PER_WINDOW, SAMPLE_RATE, SECONDS_PER_TIME_TOKEN};

/// Called after each sampled token; returning `false` asks the engine to
/// stop decoding the current window. Must not block.
pub type ProgressCallback = Arc<dyn Fn(TranscriptionProgress) -> bool + Send + Sync>;

/// External supplier of voiced-region boundaries, consulted when
/// `chunking_strategy` is [`ChunkingStrategy::Vad`].
pub trait VoiceActivityDetector: Send + Sync {
    fn voiced_chunks(&self, samples: &[f32]) -> Vec<Range<usize>>;
}

/// Cooperative cancellation flags, one per in-flight transcription id.
#[derive(Default)]
pub struct EarlyStopRegistry {
    flags: Mutex<HashMap<u64, bool>>,
}

impl EarlyStopRegistry {
    fn register(&self, id: u64) {
        self.flags.lock().unwrap().insert(id, false);
    }

    /// Requests cancellation; returns false for unknown ids.
    pub fn request_stop(&self, id: u64) -> bool {
        match self.flags.lock().unwrap().get_mut(&id) {
            Some(flag) => {
                *flag = true;
                true
            }
            None => false,
        }
    }

    fn should_stop(&self, id: u64) -> bool {
        self.flags.lock().unwrap().get(&id).copied().unwrap_or(false)
    }

    fn remove(&self, id: u64) {
        self.flags.lock().unwrap().remove(&id);
    }
}

/// The shareable, read-only pieces a transcription runs on.
#[derive(Clone)]
struct Components {
    features: Arc<dyn FeatureExtractor>,
    encoder: Arc<dyn AudioEncoder>,
    decoder: Arc<dyn TextDecoder>,
    vocab: Arc<dyn Vocabulary>,
    vad: Option<Arc<dyn VoiceActivityDetector>>,
    early_stop: Arc<EarlyStopRegistry>,
}

/// Assembles a [`Transcriber`] from backend implementations. Models loaded
/// through [`WhisperModel`] use [`Transcriber::new`] instead.
pub struct TranscriberBuilder {
    features: Arc<dyn FeatureExtractor>,
    encoder: Arc<dyn AudioEncoder>,
    decoder: Arc<dyn TextDecoder>,
    vocab: Arc<dyn Vocabulary>,
    vad: Option<Arc<dyn VoiceActivityDetector>>,
}

impl TranscriberBuilder {
    pub fn new(
        features: Arc<dyn FeatureExtractor>,
        encoder: Arc<dyn AudioEncoder>,
        decoder: Arc<dyn TextDecoder>,
        vocab: Arc<dyn Vocabulary>,
    ) -> Self {
        Self {
            features,
            encoder,
            decoder,
            vocab,
            vad: None,
        }
    }

    pub fn vad(mut self, vad: Arc<dyn VoiceActivityDetector>) -> Self {
        self.vad = Some(vad);
        self
    }

    pub fn build(self) -> Transcriber {
        Transcriber {
            components: Components {
                features: self.features,
                encoder: self.encoder,
                decoder: self.decoder,
                vocab: self.vocab,
                vad: self.vad,
                early_stop: Arc::new(EarlyStopRegistry::default()),
            },
            next_id: AtomicU64::new(1),
        }
    }
}

/// Drives the whole pipeline: windowing, prompting, decoding with
/// temperature fallback, segment construction, word alignment and result
/// assembly.
pub struct Transcriber {
    components: Components,
    next_id: AtomicU64,
}

impl Transcriber {
    pub fn new(model: WhisperModel) -> Self {
        TranscriberBuilder::new(
            model.features,
            model.encoder,
            model.decoder,
            model.tokenizer,
        )
        .build()
    }

    /// Reserves an id so a transcription can be cancelled from another
    /// task via [`Transcriber::cancel`].
    pub fn next_transcription_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Requests cooperative cancellation; the transcription returns
    /// [`TranscribeError::Cancelled`] at the next step boundary.
    pub fn cancel(&self, id: u64) -> bool {
        self.components.early_stop.request_stop(id)
    }

    pub async fn transcribe(
        &self,
        audio: Vec<f32>,
        options: DecodingOptions,
        progress: Option<ProgressCallback>,
    ) -> Result<TranscriptionResult> {
        let id = self.next_transcription_id();
        self.transcribe_with_id(id, audio, options, progress).await
    }

    #[tracing::instrument(level = "info", skip_all, fields(id, samples = audio.len()))]
    pub async fn transcribe_with_id(
        &self,
        id: u64,
        audio: Vec<f32>,
        options: DecodingOptions,
        progress: Option<ProgressCallback>,
    ) -> Result<TranscriptionResult> {
        let started = Instant::now();
        self.components.early_stop.register(id);
        let outcome = run_transcription(
            self.components.clone(),
            id,
            Arc::new(audio),
            options,
            progress,
            started,
        )
        .await;
        self.components.early_stop.remove(id);
        outcome
    }
}

async fn run_transcription(
    components: Components,
    id: u64,
    audio: Arc<Vec<f32>>,
    options: DecodingOptions,
    progress: Option<ProgressCallback>,
    started: Instant,
) -> Result<TranscriptionResult> {
    let mut timings = TranscriptionTimings {
        audio_seconds: audio.len() as f64 / SAMPLE_RATE as f64,
        ..TranscriptionTimings::default()
    };

    let clips = resolve_clips(&options, audio.len());
    if clips.is_empty() {
        let mut result = empty_result(&options);
        timings.finish(started.elapsed().as_secs_f64());
        result.timings = timings;
        return Ok(result);
    }

    let (language, language_probs) =
        determine_language(&components, &audio, clips[0].clone(), &options).await?;
    if options.detect_language_only {
        let mut result = empty_result(&options);
        result.language = language;
        result.language_probs = language_probs;
        timings.finish(started.elapsed().as_secs_f64());
        result.timings = timings;
        return Ok(result);
    }

    let worker_count = options.concurrent_worker_count.max(1);
    let mut outputs: Vec<(usize, ClipOutput)> = Vec::with_capacity(clips.len());

    if clips.len() > 1 && worker_count > 1 {
        let semaphore = Arc::new(tokio::sync::Semaphore::new(worker_count));
        let mut join_set = tokio::task::JoinSet::new();
        for (index, clip) in clips.into_iter().enumerate() {
            let components = components.clone();
            let audio = Arc::clone(&audio);
            let options = options.clone();
            let language = language.clone();
            let progress = progress.clone();
            let semaphore = Arc::clone(&semaphore);
            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let output = run_clip(components, id, audio, clip, options, language, progress).await;
                (index, output)
            });
        }
        while let Some(joined) = join_set.join_next().await {
            let (index, output) = joined
                .map_err(|e| TranscribeError::TranscriptionFailed(format!("clip task: {e}")))?;
            outputs.push((index, output?));
        }
        outputs.sort_by_key(|(index, _)| *index);
    } else {
        for (index, clip) in clips.into_iter().enumerate() {
            let output = run_clip(
                components.clone(),
                id,
                Arc::clone(&audio),
                clip,
                options.clone(),
                language.clone(),
                progress.clone(),
            )
            .await?;
            outputs.push((index, output));
        }
    }

    let mut segments = Vec::new();
    let mut seek_time = None;
    for (_, output) in outputs {
        timings.features_seconds += output.features_seconds;
        timings.encode_seconds += output.encode_seconds;
        timings.decode_seconds += output.decode_seconds;
        timings.decoded_tokens += output.decoded_tokens;
        seek_time = Some(output.seek as f64 / SAMPLE_RATE as f64);
        segments.extend(output.segments);
    }
    for (index, segment) in segments.iter_mut().enumerate() {
        segment.id = index;
    }

    let text: String = segments.iter().map(|s| s.text.as_str()).collect();
    timings.finish(started.elapsed().as_secs_f64());
    info!(
        segments = segments.len(),
        tokens = timings.decoded_tokens,
        realtime_factor = timings.realtime_factor,
        "transcription finished"
    );

    Ok(TranscriptionResult {
        text,
        segments,
        language,
        language_probs,
        timings,
        seek_time,
    })
}

fn empty_result(options: &DecodingOptions) -> TranscriptionResult {
    TranscriptionResult {
        text: String::new(),
        segments: Vec::new(),
        language: options
            .requested_language()
            .unwrap_or("en")
            .to_string(),
        language_probs: HashMap::new(),
        timings: TranscriptionTimings::default(),
        seek_time: None,
    }
}

/// Converts `clip_timestamps` into sample ranges, clamped to the audio and
/// in input order. No clips requested means one clip spanning everything.
fn resolve_clips(options: &DecodingOptions, total_samples: usize) -> Vec<Range<usize>> {
    if total_samples == 0 {
        return Vec::new();
    }
    if options.clip_timestamps.is_empty() {
        return vec![0..total_samples];
    }
    options
        .clip_timestamps
        .iter()
        .filter_map(|&(start, end)| {
            let start = ((start.max(0.0) as f64) * SAMPLE_RATE as f64) as usize;
            let end = ((end.max(0.0) as f64) * SAMPLE_RATE as f64) as usize;
            let start = start.min(total_samples);
            let end = end.min(total_samples);
            (start < end).then_some(start..end)
        })
        .collect()
}

async fn determine_language(
    components: &Components,
    audio: &Arc<Vec<f32>>,
    first_clip: Range<usize>,
    options: &DecodingOptions,
) -> Result<(String, HashMap<String, f32>)> {
    let multilingual = components.vocab.language_token("en").is_some();
    if let Some(code) = options.requested_language() {
        if multilingual && components.vocab.language_token(code).is_none() {
            return Err(TranscribeError::PrepareDecoderInputsFailed(format!(
                "language {code} is not supported by this model"
            )));
        }
        return Ok((code.to_string(), HashMap::new()));
    }
    if !multilingual {
        return Ok(("en".to_string(), HashMap::new()));
    }

    let components = components.clone();
    let window = padded_window(
        audio,
        first_clip.start,
        (first_clip.end - first_clip.start).min(N_SAMPLES_PER_WINDOW),
    );
    let detection = tokio::task::spawn_blocking(move || {
        let mel = components.features.log_mel_spectrogram(&window)?;
        let embedding = components.encoder.encode(&mel)?;
        detect_language(
            components.decoder.as_ref(),
            &embedding,
            components.vocab.as_ref(),
        )
    })
    .await
    .map_err(|e| TranscribeError::TranscriptionFailed(format!("language task: {e}")))??;
    Ok((detection.language, detection.probs))
}

/// Per-clip accumulator returned by the sequential window loop.
struct ClipOutput {
    segments: Vec<TranscriptionSegment>,
    seek: usize,
    features_seconds: f64,
    encode_seconds: f64,
    decode_seconds: f64,
    decoded_tokens: usize,
}

async fn run_clip(
    components: Components,
    id: u64,
    audio: Arc<Vec<f32>>,
    clip: Range<usize>,
    options: DecodingOptions,
    language: String,
    progress: Option<ProgressCallback>,
) -> Result<ClipOutput> {
    let mut output = ClipOutput {
        segments: Vec::new(),
        seek: clip.start,
        features_seconds: 0.0,
        encode_seconds: 0.0,
        decode_seconds: 0.0,
        decoded_tokens: 0,
    };
    let mut previous_text_tokens: Vec<u32> = Vec::new();

    let vad_chunks: Option<Vec<Range<usize>>> =
        if options.chunking_strategy == ChunkingStrategy::Vad {
            components
                .vad
                .as_ref()
                .map(|vad| vad.voiced_chunks(&audio))
        } else {
            None
        };

    while output.seek < clip.end {
        if components.early_stop.should_stop(id) {
            return Err(TranscribeError::Cancelled);
        }

        let seek = output.seek;
        let window_len = (clip.end - seek).min(N_SAMPLES_PER_WINDOW);
        let window_start = seek as f32 / SAMPLE_RATE as f32;

        let window = padded_window(&audio, seek, window_len);
        let window_components = components.clone();
        let window_options = options.clone();
        let window_language = language.clone();
        let window_progress = progress.clone();
        let window_previous = previous_text_tokens.clone();
        let decoded = tokio::task::spawn_blocking(move || {
            decode_window(
                &window_components,
                id,
                &window,
                window_start,
                &window_options,
                &window_language,
                &window_previous,
                window_progress.as_ref(),
            )
        })
        .await
        .map_err(|e| TranscribeError::TranscriptionFailed(format!("window task: {e}")))?;

        let window = match decoded {
            Ok(window) => window,
            Err(TranscribeError::Cancelled) => return Err(TranscribeError::Cancelled),
            Err(err) => {
                // Every temperature attempt failed; keep the timeline
                // contiguous with an empty segment and move on.
                error!(seek, %err, "window failed on all attempts");
                output.segments.push(TranscriptionSegment::empty(
                    0,
                    seek,
                    window_start,
                    window_start + window_len as f32 / SAMPLE_RATE as f32,
                ));
                output.seek = seek + window_len;
                continue;
            }
        };

        output.features_seconds += window.features_seconds;
        output.encode_seconds += window.encode_seconds;
        output.decode_seconds += window.decode_seconds;
        output.decoded_tokens += window.result.tokens.len();

        let seeker = SegmentSeeker::new(components.vocab.as_ref());
        let outcome = match seeker.find_seek_and_segments(&window.result, &options, seek, window_len)
        {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(seek, %err, "segment construction failed");
                output.segments.push(TranscriptionSegment::empty(
                    0,
                    seek,
                    window_start,
                    window_start + window_len as f32 / SAMPLE_RATE as f32,
                ));
                output.seek = seek + window_len;
                continue;
            }
        };

        match outcome.segments {
            None => {
                debug!(seek, no_speech_prob = window.result.no_speech_prob, "skipping silent window");
                output.seek = advance_past_silence(outcome.seek, &vad_chunks, clip.end);
            }
            Some(drafts) => {
                let words = if options.word_timestamps && !drafts.is_empty() {
                    match align_window_words(
                        components.vocab.as_ref(),
                        &language,
                        &drafts,
                        &window,
                        window_start,
                        window_len,
                    ) {
                        Ok(words) => Some(words),
                        Err(err) => {
                            error!(seek, %err, "word alignment failed; keeping segment timestamps");
                            None
                        }
                    }
                } else {
                    None
                };

                for (index, draft) in drafts.into_iter().enumerate() {
                    let mut segment = TranscriptionSegment {
                        id: 0,
                        seek,
                        start: draft.start,
                        end: draft.end,
                        text: draft.text,
                        tokens: draft.tokens,
                        token_logprobs: draft.token_logprobs,
                        temperature: window.result.temperature,
                        avg_logprob: window.result.avg_logprob,
                        compression_ratio: window.result.compression_ratio,
                        no_speech_prob: window.result.no_speech_prob,
                        words: None,
                    };
                    if let Some(words) = &words {
                        if let Some(segment_words) = words.get(index) {
                            let mut segment_words = segment_words.clone();
                            for word in &mut segment_words {
                                word.start = word.start.clamp(segment.start, segment.end);
                                word.end = word.end.clamp(word.start, segment.end);
                            }
                            let (start, end) = align::reconcile_segment_bounds(
                                segment.start,
                                segment.end,
                                &segment_words,
                            );
                            segment.start = start;
                            segment.end = end;
                            segment.words = Some(segment_words);
                        }
                    }
                    info!(
                        start = segment.start,
                        end = segment.end,
                        text = %segment.text,
                        "segment"
                    );
                    previous_text_tokens.extend(&segment.tokens);
                    output.segments.push(segment);
                }
                output.seek = outcome.seek.max(seek + 1);
            }
        }
    }

    Ok(output)
}

/// After a silent window, jump to the next voiced chunk when one is known.
fn advance_past_silence(
    seek: usize,
    vad_chunks: &Option<Vec<Range<usize>>>,
    clip_end: usize,
) -> usize {
    let Some(chunks) = vad_chunks else {
        return seek;
    };
    for chunk in chunks {
        if chunk.end > seek {
            return seek.max(chunk.start).min(clip_end);
        }
    }
    clip_end
}

/// Everything the blocking section produces for one accepted window.
struct WindowOutput {
    result: DecodingResult,
    /// Cross-attention rows for every decoded position of the accepted
    /// attempt, prompt included.
    alignment_rows: Option<Vec<Vec<f32>>>,
    sample_begin: usize,
    features_seconds: f64,
    encode_seconds: f64,
    decode_seconds: f64,
}

#[allow(clippy::too_many_arguments)]
fn decode_window(
    components: &Components,
    id: u64,
    samples: &[f32],
    window_start: f32,
    options: &DecodingOptions,
    language: &str,
    previous_text_tokens: &[u32],
    progress: Option<&ProgressCallback>,
) -> Result<WindowOutput> {
    let features_started = Instant::now();
    let mel = components.features.log_mel_spectrogram(samples)?;
    let features_seconds = features_started.elapsed().as_secs_f64();

    let encode_started = Instant::now();
    let embedding = components.encoder.encode(&mel)?;
    let encode_seconds = encode_started.elapsed().as_secs_f64();

    let decode_started = Instant::now();
    let vocab = components.vocab.as_ref();
    let decoder = components.decoder.as_ref();
    let special = *vocab.special();
    let max_ctx = decoder.max_decoder_ctx();
    let mut cache = decoder.new_cache(options.word_timestamps);

    let mut attempt = 0usize;
    loop {
        let temperature = options.temperature_for_attempt(attempt);
        cache.reset();

        let prompt = build_prompt(
            vocab,
            options,
            language,
            previous_text_tokens,
            temperature,
            max_ctx,
        )?;
        let sample_begin = prompt.len();
        let filter_stack = build_filter_stack(vocab, options, sample_begin);
        let mut sampler = sampler_for_temperature(
            temperature,
            options.top_k,
            options.seed.wrapping_add(attempt as u64),
            special.end_of_text,
            max_ctx - 1,
        );

        let mut logits = decoder.prefill(&prompt, &embedding, &mut cache)?;
        let no_speech_prob = softmax_probability(&logits, special.no_speech as usize);

        let sample_budget = options.sample_length.min(max_ctx - 1 - sample_begin).max(1);
        let mut all_tokens = prompt;
        let mut sampled: Vec<u32> = Vec::new();
        let mut logprobs: Vec<f32> = Vec::new();
        let mut early_stopped = false;

        loop {
            if components.early_stop.should_stop(id) {
                return Err(TranscribeError::Cancelled);
            }
            filter_stack.apply(&mut logits, &all_tokens);
            let step = sampler.update(&all_tokens, &logits)?;
            all_tokens.push(step.token);
            sampled.push(step.token);
            logprobs.push(step.logprob);

            if let Some(callback) = progress {
                let text_tokens: Vec<u32> = sampled
                    .iter()
                    .copied()
                    .filter(|&t| special.is_text(t))
                    .collect();
                let text = vocab.decode(&text_tokens, true).unwrap_or_default();
                let avg = logprobs.iter().sum::<f32>() / logprobs.len() as f32;
                let snapshot = TranscriptionProgress {
                    compression_ratio: compression_ratio(&text),
                    text,
                    tokens: sampled.clone(),
                    avg_logprob: avg,
                    window_start,
                    temperature,
                };
                if !callback(snapshot) {
                    early_stopped = true;
                }
            }

            if step.completed || early_stopped || sampled.len() >= sample_budget {
                break;
            }
            logits = decoder.step(step.token, &embedding, &mut cache)?;
        }

        let (tokens, token_logprobs) = sampler.finalize(sampled, logprobs);
        let text_tokens: Vec<u32> = tokens
            .iter()
            .copied()
            .filter(|&t| special.is_text(t))
            .collect();
        let text = vocab.decode(&text_tokens, true)?;
        let avg_logprob =
            token_logprobs.iter().sum::<f32>() / token_logprobs.len().max(1) as f32;
        let compression_ratio = compression_ratio(&text);
        let first_token_logprob = token_logprobs.first().copied();

        let mut result = DecodingResult {
            tokens,
            token_logprobs,
            text,
            avg_logprob,
            no_speech_prob,
            compression_ratio,
            temperature,
            language: Some(language.to_string()),
            fallback_reason: None,
        };

        // A silent window is skipped, never retried.
        let silent = options
            .no_speech_threshold
            .is_some_and(|threshold| no_speech_prob > threshold)
            && options
                .logprob_threshold
                .map_or(true, |threshold| avg_logprob <= threshold);

        let reason = if silent || early_stopped {
            None
        } else {
            fallback_reason(&result, first_token_logprob, options)
        };

        match reason {
            Some(reason) if attempt < options.temperature_fallback_count => {
                debug!(
                    ?reason,
                    temperature,
                    next_temperature = options.temperature_for_attempt(attempt + 1),
                    "window rejected, retrying"
                );
                attempt += 1;
            }
            _ => {
                result.fallback_reason = reason;
                return Ok(WindowOutput {
                    result,
                    alignment_rows: cache.alignment_rows().map(<[Vec<f32>]>::to_vec),
                    sample_begin,
                    features_seconds,
                    encode_seconds,
                    decode_seconds: decode_started.elapsed().as_secs_f64(),
                });
            }
        }
    }
}

/// Quality gates, in their order of precedence.
fn fallback_reason(
    result: &DecodingResult,
    first_token_logprob: Option<f32>,
    options: &DecodingOptions,
) -> Option<FallbackReason> {
    if let Some(threshold) = options.compression_ratio_threshold {
        if result.compression_ratio > threshold {
            return Some(FallbackReason::CompressionRatio);
        }
    }
    if let Some(threshold) = options.logprob_threshold {
        if result.avg_logprob < threshold {
            return Some(FallbackReason::AvgLogProb);
        }
    }
    if let (Some(threshold), Some(logprob)) =
        (options.first_token_logprob_threshold, first_token_logprob)
    {
        if logprob < threshold {
            return Some(FallbackReason::FirstTokenLogProb);
        }
    }
    None
}

/// Prompt layout: `[<|startofprev|> context...] <|startoftranscript|>
/// [language task] [<|notimestamps|>] [prefix...]`.
fn build_prompt(
    vocab: &dyn Vocabulary,
    options: &DecodingOptions,
    language: &str,
    previous_text_tokens: &[u32],
    temperature: f32,
    max_ctx: usize,
) -> Result<Vec<u32>> {
    let special = *vocab.special();
    let mut prompt = Vec::new();

    // Higher fallback temperatures drop the carried context; it is the
    // most common driver of repetition loops.
    let use_previous = options.condition_on_previous_text
        && temperature <= 0.5
        && !previous_text_tokens.is_empty();
    let user_prompt = options.prompt_tokens.as_deref().unwrap_or(&[]);

    if use_previous || !user_prompt.is_empty() {
        prompt.push(special.start_of_prev);
        let mut context: Vec<u32> = Vec::new();
        context.extend_from_slice(user_prompt);
        if use_previous {
            context.extend_from_slice(previous_text_tokens);
        }
        let budget = max_ctx / 2 - 1;
        let tail = context.len().saturating_sub(budget);
        prompt.extend_from_slice(&context[tail..]);
    }

    prompt.push(special.start_of_transcript);
    if vocab.language_token("en").is_some() {
        let language_token = vocab.language_token(language).ok_or_else(|| {
            TranscribeError::PrepareDecoderInputsFailed(format!(
                "language {language} is not supported by this model"
            ))
        })?;
        prompt.push(language_token);
        prompt.push(match options.task {
            Task::Transcribe => special.transcribe,
            Task::Translate => special.translate,
        });
    }
    if options.without_timestamps {
        prompt.push(special.no_timestamps);
    }
    if let Some(prefix) = options.prefix_tokens.as_deref() {
        let budget = (max_ctx - 1).saturating_sub(prompt.len() + 1);
        let tail = prefix.len().saturating_sub(budget);
        prompt.extend_from_slice(&prefix[tail..]);
    }

    if prompt.len() >= max_ctx - 1 {
        return Err(TranscribeError::PrepareDecoderInputsFailed(format!(
            "prompt of {} tokens leaves no room to decode (context {})",
            prompt.len(),
            max_ctx
        )));
    }
    Ok(prompt)
}

fn build_filter_stack(
    vocab: &dyn Vocabulary,
    options: &DecodingOptions,
    sample_begin: usize,
) -> LogitsFilterStack {
    let special = *vocab.special();
    let mut filters: Vec<Box<dyn LogitsFilter>> = Vec::new();
    if options.suppress_blank {
        filters.push(Box::new(SuppressBlank::new(
            vocab.whitespace_token_ids().to_vec(),
            special.end_of_text,
            sample_begin,
        )));
    }
    if !options.suppress_tokens.is_empty() {
        filters.push(Box::new(SuppressTokens::new(
            options.suppress_tokens.clone(),
        )));
    }
    if !options.without_timestamps {
        let max_initial_index = options
            .max_initial_timestamp
            .map(|seconds| (seconds / SECONDS_PER_TIME_TOKEN).round() as u32);
        filters.push(Box::new(TimestampRules::new(
            special,
            sample_begin,
            max_initial_index,
        )));
    }
    LogitsFilterStack::new(filters)
}

/// Builds the contiguous f64 alignment matrix for the window's segment
/// tokens and runs the DTW word alignment.
fn align_window_words(
    vocab: &dyn Vocabulary,
    language: &str,
    drafts: &[SegmentDraft],
    window: &WindowOutput,
    window_start: f32,
    window_len: usize,
) -> Result<Vec<Vec<crate::inference::result::WordTiming>>> {
    let rows = window.alignment_rows.as_ref().ok_or_else(|| {
        TranscribeError::SegmentingFailed("no alignment weights recorded".into())
    })?;
    if rows.is_empty() {
        return Err(TranscribeError::SegmentingFailed(
            "empty alignment weights".into(),
        ));
    }
    // Padding silence attracts attention mass; align only against the
    // columns covered by real audio.
    let cols = rows[0]
        .len()
        .min((window_len / crate::inference::SAMPLES_PER_TIME_TOKEN).max(1));

    let segment_tokens: Vec<Vec<u32>> = drafts.iter().map(|d| d.tokens.clone()).collect();
    let segment_logprobs: Vec<Vec<f32>> =
        drafts.iter().map(|d| d.token_logprobs.clone()).collect();

    let mut data = Vec::new();
    for draft in drafts {
        for &token_index in &draft.text_token_indices {
            // The final sampled token is never fed back through the
            // decoder, so it has no recorded row; reuse the last one.
            let row_index = (window.sample_begin + token_index).min(rows.len() - 1);
            let row = &rows[row_index];
            if row.len() < cols {
                return Err(TranscribeError::SegmentingFailed(
                    "ragged alignment weights".into(),
                ));
            }
            data.extend(row[..cols].iter().map(|&w| f64::from(w)));
        }
    }

    let total: usize = segment_tokens.iter().map(Vec::len).sum();
    let weights = AlignmentWeights::new(total, cols, data)?;
    align::word_timings(
        vocab,
        language,
        &segment_tokens,
        &segment_logprobs,
        &weights,
        window_start,
    )
}

fn padded_window(audio: &[f32], start: usize, len: usize) -> Vec<f32> {
    let mut window = vec![0f32; N_SAMPLES_PER_WINDOW];
    window[..len].copy_from_slice(&audio[start..start + len]);
    window
}

fn softmax_probability(logits: &[f32], index: usize) -> f32 {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let denom: f32 = logits
        .iter()
        .filter(|l| l.is_finite())
        .map(|l| (l - max).exp())
        .sum();
    match logits.get(index) {
        Some(l) if l.is_finite() && denom > 0.0 => (l - max).exp() / denom,
        _ => 0.0,
    }
}

/// zlib ratio of the window text; hallucinated repetition compresses far
/// better than speech.
fn compression_ratio(text: &str) -> f32 {
    let bytes = text.as_bytes();
    if bytes.is_empty() {
        return 0.0;
    }
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    if encoder.write_all(bytes).is_err() {
        return 0.0;
    }
    match encoder.finish() {
        Ok(compressed) if !compressed.is_empty() => bytes.len() as f32 / compressed.len() as f32,
        _ => 0.0,
    }
}
