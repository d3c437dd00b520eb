use crate::inference::error::Result;
use crate::inference::options::DecodingOptions;
use crate::inference::result::DecodingResult;
use crate::inference::tokens::Vocabulary;
use crate::inference::{SAMPLES_PER_TIME_TOKEN, SAMPLE_RATE};

/// A segment cut out of one window, before ids and word timestamps are
/// attached.
#[derive(Debug, Clone)]
pub struct SegmentDraft {
    /// Absolute seconds.
    pub start: f32,
    pub end: f32,
    pub text: String,
    /// Text tokens only.
    pub tokens: Vec<u32>,
    pub token_logprobs: Vec<f32>,
    /// For each entry of `tokens`, its index within the window's sampled
    /// tokens. Used to look up alignment rows.
    pub text_token_indices: Vec<usize>,
}

/// Outcome of processing one decoded window.
#[derive(Debug, Clone)]
pub struct SeekOutcome {
    /// New absolute seek position in samples.
    pub seek: usize,
    /// `None` means the window was classified as silence and skipped.
    pub segments: Option<Vec<SegmentDraft>>,
}

/// Turns a window's sampled tokens into segments and decides how far the
/// seek advances.
pub struct SegmentSeeker<'a> {
    vocab: &'a dyn Vocabulary,
}

impl<'a> SegmentSeeker<'a> {
    pub fn new(vocab: &'a dyn Vocabulary) -> Self {
        Self { vocab }
    }

    #[tracing::instrument(level = "debug", skip_all, fields(seek = current_seek))]
    pub fn find_seek_and_segments(
        &self,
        result: &DecodingResult,
        options: &DecodingOptions,
        current_seek: usize,
        window_samples: usize,
    ) -> Result<SeekOutcome> {
        // Silent window: skip it wholesale unless confidence overrides.
        if let Some(threshold) = options.no_speech_threshold {
            if result.no_speech_prob > threshold {
                let overridden = options
                    .logprob_threshold
                    .is_some_and(|lt| result.avg_logprob > lt);
                if !overridden {
                    return Ok(SeekOutcome {
                        seek: current_seek + window_samples.max(1),
                        segments: None,
                    });
                }
            }
        }

        let special = *self.vocab.special();
        let mut tokens: &[u32] = &result.tokens;
        let mut logprobs: &[f32] = &result.token_logprobs;
        if tokens.last() == Some(&special.end_of_text) {
            tokens = &tokens[..tokens.len() - 1];
            logprobs = &logprobs[..logprobs.len().min(tokens.len())];
        }

        let time_offset = current_seek as f32 / SAMPLE_RATE as f32;
        let window_seconds = window_samples as f32 / SAMPLE_RATE as f32;
        let window_end = time_offset + window_seconds;

        let n = tokens.len();
        let is_ts: Vec<bool> = tokens.iter().map(|&t| special.is_timestamp(t)).collect();
        let mut boundaries: Vec<usize> = (1..n).filter(|&i| is_ts[i] && is_ts[i - 1]).collect();
        let single_timestamp_ending = n >= 2 && is_ts[n - 1] && !is_ts[n - 2];
        let no_timestamp_ending = n >= 1 && !is_ts[n - 1];

        let mut segments = Vec::new();
        let seek;

        if !boundaries.is_empty() || single_timestamp_ending {
            if single_timestamp_ending || no_timestamp_ending {
                // The final slice closes implicitly: on its lone trailing
                // timestamp, or on the end of the token stream.
                boundaries.push(n);
            }

            let mut previous = 0usize;
            for &boundary in &boundaries {
                let slice = previous..boundary;
                if let Some(draft) = self.build_draft(
                    tokens,
                    logprobs,
                    slice,
                    options,
                    time_offset,
                    window_end,
                )? {
                    segments.push(draft);
                }
                previous = boundary;
            }

            if no_timestamp_ending {
                // Content ran past the window without a closing timestamp;
                // nothing behind the seek is final yet, move a full window.
                seek = current_seek + window_samples;
            } else {
                let last_boundary = *boundaries.last().unwrap();
                let closing = tokens[last_boundary - 1];
                let advance = (closing.saturating_sub(special.time_token_begin)) as usize
                    * SAMPLES_PER_TIME_TOKEN;
                seek = current_seek + advance.clamp(1, window_samples);
            }
        } else {
            // No adjacent pairs: one segment spanning the window; a stray
            // timestamp, if any, still bounds the end.
            let max_ts = tokens
                .iter()
                .filter(|&&t| special.is_timestamp(t))
                .map(|&t| special.timestamp_seconds(t))
                .fold(f32::NEG_INFINITY, f32::max);
            let end = if max_ts.is_finite() && max_ts > 0.0 {
                time_offset + max_ts
            } else {
                window_end
            };
            if let Some(draft) = self.build_draft(
                tokens,
                logprobs,
                0..n,
                options,
                time_offset,
                window_end,
            )? {
                let mut draft = draft;
                draft.start = time_offset;
                draft.end = end.min(window_end);
                segments.push(draft);
            }
            seek = current_seek + window_samples.max(1);
        }

        Ok(SeekOutcome {
            seek,
            segments: Some(segments),
        })
    }

    /// Builds one segment from a slice of the sampled tokens. Returns
    /// `None` for slices with no content at all.
    fn build_draft(
        &self,
        tokens: &[u32],
        logprobs: &[f32],
        slice: std::ops::Range<usize>,
        options: &DecodingOptions,
        time_offset: f32,
        window_end: f32,
    ) -> Result<Option<SegmentDraft>> {
        let special = *self.vocab.special();
        if slice.is_empty() {
            return Ok(None);
        }

        let slice_tokens = &tokens[slice.clone()];
        let first_ts = slice_tokens.iter().find(|&&t| special.is_timestamp(t));
        let last_ts = slice_tokens.iter().rev().find(|&&t| special.is_timestamp(t));
        let mut start = match first_ts {
            Some(&t) => time_offset + special.timestamp_seconds(t),
            None => time_offset,
        };
        let mut end = match (first_ts, last_ts) {
            (Some(first), Some(last)) if first != last => {
                time_offset + special.timestamp_seconds(*last)
            }
            _ => window_end,
        };
        start = start.min(window_end);
        end = end.min(window_end);
        if end <= start {
            end = (start + crate::inference::SECONDS_PER_TIME_TOKEN).min(window_end);
        }

        let mut text_tokens = Vec::new();
        let mut token_logprobs = Vec::new();
        let mut text_token_indices = Vec::new();
        let mut non_timestamp = Vec::new();
        for (offset, &token) in slice_tokens.iter().enumerate() {
            let index = slice.start + offset;
            if special.is_timestamp(token) {
                continue;
            }
            non_timestamp.push(token);
            if special.is_text(token) {
                text_tokens.push(token);
                token_logprobs.push(logprobs.get(index).copied().unwrap_or(0.0));
                text_token_indices.push(index);
            }
        }
        // A slice without any text tokens carries no transcript content.
        if text_tokens.is_empty() {
            return Ok(None);
        }

        let text = if options.skip_special_tokens {
            self.vocab.decode(&text_tokens, true)?
        } else {
            self.vocab.decode(&non_timestamp, false)?
        };

        Ok(Some(SegmentDraft {
            start,
            end,
            text,
            tokens: text_tokens,
            token_logprobs,
            text_token_indices,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::tokens::{SpecialTokens, WordPiece};
    use crate::inference::N_SAMPLES_PER_WINDOW;

    // Text tokens 0..100, specials 100..200, timestamps from 200; one
    // timestamp token is 20 ms as in the real vocabulary.
    struct StubVocab {
        special: SpecialTokens,
    }

    impl StubVocab {
        fn new() -> Self {
            Self {
                special: SpecialTokens {
                    start_of_transcript: 101,
                    end_of_text: 100,
                    transcribe: 102,
                    translate: 103,
                    no_speech: 104,
                    no_timestamps: 199,
                    start_of_prev: 105,
                    special_token_begin: 100,
                    time_token_begin: 200,
                },
            }
        }
    }

    impl Vocabulary for StubVocab {
        fn decode(&self, tokens: &[u32], skip_special: bool) -> Result<String> {
            let mut out = String::new();
            for &t in tokens {
                if t >= self.special.special_token_begin {
                    if !skip_special {
                        out.push_str(&format!("<{t}>"));
                    }
                    continue;
                }
                out.push_str(&format!(" w{t}"));
            }
            Ok(out)
        }

        fn split_to_word_tokens(&self, tokens: &[u32], _language: &str) -> Result<Vec<WordPiece>> {
            tokens
                .iter()
                .map(|&t| {
                    Ok(WordPiece {
                        text: format!(" w{t}"),
                        tokens: vec![t],
                    })
                })
                .collect()
        }

        fn language_token(&self, _code: &str) -> Option<u32> {
            None
        }

        fn language_code(&self, _token: u32) -> Option<String> {
            None
        }

        fn whitespace_token_ids(&self) -> &[u32] {
            &[]
        }

        fn special(&self) -> &SpecialTokens {
            &self.special
        }
    }

    fn decoding_result(tokens: Vec<u32>) -> DecodingResult {
        let logprobs = vec![-0.1; tokens.len()];
        DecodingResult {
            token_logprobs: logprobs,
            tokens,
            text: String::new(),
            avg_logprob: -0.1,
            no_speech_prob: 0.0,
            compression_ratio: 1.0,
            temperature: 0.0,
            language: None,
            fallback_reason: None,
        }
    }

    fn ts(seconds: f32) -> u32 {
        200 + (seconds / 0.02) as u32
    }

    #[test]
    fn silent_window_skips_a_full_window() {
        let vocab = StubVocab::new();
        let seeker = SegmentSeeker::new(&vocab);
        let mut result = decoding_result(vec![1, 2, 100]);
        result.no_speech_prob = 0.9;
        result.avg_logprob = -2.0;
        let options = DecodingOptions::default();
        let outcome = seeker
            .find_seek_and_segments(&result, &options, 0, N_SAMPLES_PER_WINDOW)
            .unwrap();
        assert_eq!(outcome.seek, N_SAMPLES_PER_WINDOW);
        assert!(outcome.segments.is_none());
    }

    #[test]
    fn high_confidence_overrides_no_speech() {
        let vocab = StubVocab::new();
        let seeker = SegmentSeeker::new(&vocab);
        let mut result = decoding_result(vec![ts(0.0), 1, 2, ts(1.0), 100]);
        result.no_speech_prob = 0.9;
        result.avg_logprob = -0.05;
        let options = DecodingOptions::default();
        let outcome = seeker
            .find_seek_and_segments(&result, &options, 0, N_SAMPLES_PER_WINDOW)
            .unwrap();
        assert!(outcome.segments.is_some());
    }

    #[test]
    fn paired_timestamps_make_segments_and_anchor_seek() {
        let vocab = StubVocab::new();
        let seeker = SegmentSeeker::new(&vocab);
        // <|0.00|> w1 w2 <|2.00|><|2.00|> w3 <|4.00|><|4.00|> ...
        let tokens = vec![
            ts(0.0),
            1,
            2,
            ts(2.0),
            ts(2.0),
            3,
            ts(4.0),
            ts(4.0),
            100,
        ];
        let result = decoding_result(tokens);
        let options = DecodingOptions::default();
        let outcome = seeker
            .find_seek_and_segments(&result, &options, 0, N_SAMPLES_PER_WINDOW)
            .unwrap();
        let segments = outcome.segments.unwrap();
        assert_eq!(segments.len(), 2);
        assert!((segments[0].start - 0.0).abs() < 1e-4);
        assert!((segments[0].end - 2.0).abs() < 1e-4);
        assert_eq!(segments[0].tokens, vec![1, 2]);
        assert!((segments[1].start - 2.0).abs() < 1e-4);
        assert!((segments[1].end - 4.0).abs() < 1e-4);
        // Seek lands on the close of the last slice: 4 s.
        assert_eq!(outcome.seek, 4 * SAMPLE_RATE);
    }

    #[test]
    fn single_timestamp_ending_closes_the_last_slice() {
        let vocab = StubVocab::new();
        let seeker = SegmentSeeker::new(&vocab);
        // <|0.00|> w1 <|1.50|><|1.50|> w2 <|3.00|>
        let tokens = vec![ts(0.0), 1, ts(1.5), ts(1.5), 2, ts(3.0)];
        let result = decoding_result(tokens);
        let options = DecodingOptions::default();
        let outcome = seeker
            .find_seek_and_segments(&result, &options, 0, N_SAMPLES_PER_WINDOW)
            .unwrap();
        let segments = outcome.segments.unwrap();
        assert_eq!(segments.len(), 2);
        assert!((segments[1].end - 3.0).abs() < 1e-4);
        assert_eq!(outcome.seek, 3 * SAMPLE_RATE);
    }

    #[test]
    fn no_pairs_covers_whole_window() {
        let vocab = StubVocab::new();
        let seeker = SegmentSeeker::new(&vocab);
        let tokens = vec![ts(0.0), 1, 2, 3, 100];
        let result = decoding_result(tokens);
        let options = DecodingOptions::default();
        let start_seek = 5 * SAMPLE_RATE;
        let outcome = seeker
            .find_seek_and_segments(&result, &options, start_seek, N_SAMPLES_PER_WINDOW)
            .unwrap();
        let segments = outcome.segments.unwrap();
        assert_eq!(segments.len(), 1);
        assert!((segments[0].start - 5.0).abs() < 1e-4);
        assert!((segments[0].end - 35.0).abs() < 1e-4);
        assert_eq!(outcome.seek, start_seek + N_SAMPLES_PER_WINDOW);
    }

    #[test]
    fn seek_always_advances() {
        let vocab = StubVocab::new();
        let seeker = SegmentSeeker::new(&vocab);
        // A degenerate pair at 0.00 would otherwise anchor the seek at 0.
        let tokens = vec![ts(0.0), ts(0.0), 1, 100];
        let result = decoding_result(tokens);
        let options = DecodingOptions::default();
        let outcome = seeker
            .find_seek_and_segments(&result, &options, 0, N_SAMPLES_PER_WINDOW)
            .unwrap();
        assert!(outcome.seek >= 1);
    }

    #[test]
    fn text_token_indices_point_into_sampled_tokens() {
        let vocab = StubVocab::new();
        let seeker = SegmentSeeker::new(&vocab);
        let tokens = vec![ts(0.0), 7, 8, ts(1.0), ts(1.0), 9, ts(2.0), ts(2.0), 100];
        let result = decoding_result(tokens.clone());
        let options = DecodingOptions::default();
        let outcome = seeker
            .find_seek_and_segments(&result, &options, 0, N_SAMPLES_PER_WINDOW)
            .unwrap();
        let segments = outcome.segments.unwrap();
        for segment in &segments {
            for (&token, &index) in segment.tokens.iter().zip(segment.text_token_indices.iter()) {
                assert_eq!(tokens[index], token);
            }
        }
    }
}
