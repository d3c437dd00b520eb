use crate::inference::error::{Result, TranscribeError};
use crate::inference::result::WordTiming;
use crate::inference::tokens::Vocabulary;
use crate::inference::SECONDS_PER_TIME_TOKEN;

/// Punctuation attached to the following word.
pub const PREPEND_PUNCTUATIONS: &str = "\"'\u{201c}\u{00bf}([{-";
/// Punctuation attached to the previous word.
pub const APPEND_PUNCTUATIONS: &str = "\"'.\u{3002},\u{ff0c}!\u{ff01}?\u{ff1f}:\u{ff1a}\u{201d})]}\u{3001}";

/// Word durations above twice the (capped) median are treated as
/// pathological and clipped at sentence boundaries.
const MEDIAN_DURATION_CAP: f32 = 0.7;
const SENTENCE_END_PUNCTUATIONS: [&str; 6] = [".", "\u{3002}", "!", "\u{ff01}", "?", "\u{ff1f}"];

/// Cross-attention weights for one window, materialized contiguous:
/// one row per text token, one column per audio position (20 ms each).
#[derive(Debug, Clone)]
pub struct AlignmentWeights {
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<f64>,
}

impl AlignmentWeights {
    pub fn new(rows: usize, cols: usize, data: Vec<f64>) -> Result<Self> {
        if data.len() != rows * cols {
            return Err(TranscribeError::SegmentingFailed(format!(
                "alignment matrix has {} values, expected {rows} x {cols}",
                data.len()
            )));
        }
        Ok(Self { rows, cols, data })
    }

    fn get(&self, row: usize, col: usize) -> f64 {
        self.data[row * self.cols + col]
    }
}

/// Dynamic time warping over the negated weights. Returns, for each text
/// row, the first audio column the optimal path visits in that row.
/// Ties between moves resolve diagonal, then up, then left.
fn dtw_first_columns(weights: &AlignmentWeights) -> Result<Vec<usize>> {
    let n = weights.rows;
    let m = weights.cols;
    if n == 0 || m == 0 {
        return Err(TranscribeError::SegmentingFailed(
            "empty alignment matrix".into(),
        ));
    }

    const DIAG: u8 = 0;
    const UP: u8 = 1;
    const LEFT: u8 = 2;

    let width = m + 1;
    let mut cost = vec![f64::INFINITY; (n + 1) * width];
    let mut trace = vec![DIAG; (n + 1) * width];
    cost[0] = 0.0;
    for j in 0..=m {
        trace[j] = LEFT;
    }
    for i in 0..=n {
        trace[i * width] = UP;
    }

    for i in 1..=n {
        for j in 1..=m {
            let c_diag = cost[(i - 1) * width + (j - 1)];
            let c_up = cost[(i - 1) * width + j];
            let c_left = cost[i * width + (j - 1)];
            let (best, direction) = if c_diag <= c_up && c_diag <= c_left {
                (c_diag, DIAG)
            } else if c_up <= c_left {
                (c_up, UP)
            } else {
                (c_left, LEFT)
            };
            cost[i * width + j] = -weights.get(i - 1, j - 1) + best;
            trace[i * width + j] = direction;
        }
    }

    // Backtrack, recording the earliest column seen in each row.
    let mut first_col = vec![0usize; n];
    let mut i = n;
    let mut j = m;
    while i > 0 || j > 0 {
        if i > 0 && j > 0 {
            first_col[i - 1] = j - 1;
        }
        match trace[i * width + j] {
            DIAG => {
                i -= 1;
                j -= 1;
            }
            UP => i -= 1,
            _ => j -= 1,
        }
    }
    Ok(first_col)
}

/// Computes word timings for the segments of one window.
///
/// `segment_tokens` and `segment_logprobs` hold the text tokens (and their
/// logprobs) per segment; `weights.rows` must equal the total token count.
/// Times are absolute, offset by `window_start`.
#[tracing::instrument(level = "debug", skip_all, fields(rows = weights.rows))]
pub fn word_timings(
    vocab: &dyn Vocabulary,
    language: &str,
    segment_tokens: &[Vec<u32>],
    segment_logprobs: &[Vec<f32>],
    weights: &AlignmentWeights,
    window_start: f32,
) -> Result<Vec<Vec<WordTiming>>> {
    let total: usize = segment_tokens.iter().map(Vec::len).sum();
    if total == 0 {
        return Ok(vec![Vec::new(); segment_tokens.len()]);
    }
    if weights.rows != total {
        return Err(TranscribeError::SegmentingFailed(format!(
            "alignment matrix has {} rows for {total} tokens",
            weights.rows
        )));
    }

    let first_cols = dtw_first_columns(weights)?;
    let row_time =
        |row: usize| window_start + first_cols[row] as f32 * SECONDS_PER_TIME_TOKEN;
    let end_time = window_start + (weights.cols - 1) as f32 * SECONDS_PER_TIME_TOKEN;

    let mut all_words = Vec::with_capacity(segment_tokens.len());
    let mut row_offset = 0usize;
    for (tokens, logprobs) in segment_tokens.iter().zip(segment_logprobs.iter()) {
        if tokens.is_empty() {
            all_words.push(Vec::new());
            continue;
        }
        let pieces = vocab.split_to_word_tokens(tokens, language)?;
        let mut words = Vec::with_capacity(pieces.len());
        let mut token_cursor = 0usize;
        for piece in pieces {
            let first = row_offset + token_cursor;
            token_cursor += piece.tokens.len();
            let next = row_offset + token_cursor;
            let start = row_time(first);
            let end = if next < total { row_time(next) } else { end_time };
            let logprob_sum: f32 = logprobs
                [token_cursor - piece.tokens.len()..token_cursor]
                .iter()
                .sum();
            let mean_logprob = logprob_sum / piece.tokens.len() as f32;
            let probability = 10f32.powf(mean_logprob).clamp(f32::MIN_POSITIVE, 1.0);
            words.push(WordTiming {
                word: piece.text,
                tokens: piece.tokens,
                start,
                end: end.max(start),
                probability,
            });
        }
        merge_punctuations(&mut words);
        constrain_word_durations(&mut words);
        all_words.push(words);
        row_offset += tokens.len();
    }
    Ok(all_words)
}

/// Attaches leading punctuation to the following word and trailing
/// punctuation to the previous one.
fn merge_punctuations(words: &mut Vec<WordTiming>) {
    // Prepended: walk backwards, folding "(' -like pieces into their
    // successor.
    let mut i = 0;
    while i < words.len() {
        let trimmed = words[i].word.trim().to_string();
        if !trimmed.is_empty()
            && trimmed.chars().all(|c| PREPEND_PUNCTUATIONS.contains(c))
            && i + 1 < words.len()
        {
            let piece = words.remove(i);
            let next = &mut words[i];
            next.word = format!("{}{}", piece.word, next.word);
            let mut tokens = piece.tokens;
            tokens.extend(next.tokens.drain(..));
            next.tokens = tokens;
            next.start = piece.start.min(next.start);
        } else {
            i += 1;
        }
    }

    // Appended: fold ".,!?-like pieces into their predecessor.
    let mut i = 1;
    while i < words.len() {
        let trimmed = words[i].word.trim().to_string();
        if !trimmed.is_empty() && trimmed.chars().all(|c| APPEND_PUNCTUATIONS.contains(c)) {
            let piece = words.remove(i);
            let previous = &mut words[i - 1];
            previous.word.push_str(&piece.word);
            previous.tokens.extend(piece.tokens);
            previous.end = previous.end.max(piece.end);
        } else {
            i += 1;
        }
    }
}

fn ends_sentence(word: &str) -> bool {
    let trimmed = word.trim_end();
    SENTENCE_END_PUNCTUATIONS
        .iter()
        .any(|p| trimmed.ends_with(p))
}

/// Clips implausibly long words against the median duration, using
/// sentence boundaries as the cut points.
fn constrain_word_durations(words: &mut [WordTiming]) {
    let mut durations: Vec<f32> = words
        .iter()
        .map(|w| w.end - w.start)
        .filter(|d| *d > 0.0)
        .collect();
    if durations.is_empty() {
        return;
    }
    durations.sort_by(f32::total_cmp);
    let median = durations[durations.len() / 2].min(MEDIAN_DURATION_CAP);
    let max_duration = 2.0 * median;

    for i in 0..words.len() {
        let duration = words[i].end - words[i].start;
        if duration <= max_duration {
            continue;
        }
        if ends_sentence(&words[i].word) {
            words[i].end = words[i].start + max_duration;
        } else if i > 0 && ends_sentence(&words[i - 1].word) {
            words[i].start = words[i].end - max_duration;
        }
    }
}

/// Pulls segment boundaries onto the first/last word, unless the aligned
/// time drifted more than half a second from the timestamp-token value.
pub fn reconcile_segment_bounds(start: f32, end: f32, words: &[WordTiming]) -> (f32, f32) {
    const MAX_SHIFT: f32 = 0.5;
    let mut new_start = start;
    let mut new_end = end;
    if let Some(first) = words.first() {
        if (first.start - start).abs() <= MAX_SHIFT {
            new_start = first.start;
        }
    }
    if let Some(last) = words.last() {
        if (last.end - end).abs() <= MAX_SHIFT {
            new_end = last.end;
        }
    }
    if new_end < new_start {
        (start, end)
    } else {
        (new_start, new_end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::tokens::{SpecialTokens, WordPiece};

    struct StubVocab;

    impl Vocabulary for StubVocab {
        fn decode(&self, tokens: &[u32], _skip_special: bool) -> Result<String> {
            Ok(tokens
                .iter()
                .map(|t| format!(" w{t}"))
                .collect::<String>())
        }

        fn split_to_word_tokens(&self, tokens: &[u32], _language: &str) -> Result<Vec<WordPiece>> {
            Ok(tokens
                .iter()
                .map(|&t| WordPiece {
                    text: match t {
                        90 => ".".to_string(),
                        91 => "\"".to_string(),
                        _ => format!(" w{t}"),
                    },
                    tokens: vec![t],
                })
                .collect())
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
            unimplemented!("not used by alignment")
        }
    }

    /// Weights with a bright block diagonal: token row k attends to
    /// columns [k * span, (k + 1) * span).
    fn block_diagonal(rows: usize, cols: usize, span: usize) -> AlignmentWeights {
        let mut data = vec![0.01f64; rows * cols];
        for r in 0..rows {
            for c in r * span..((r + 1) * span).min(cols) {
                data[r * cols + c] = 1.0;
            }
        }
        AlignmentWeights::new(rows, cols, data).unwrap()
    }

    #[test]
    fn dtw_follows_a_block_diagonal() {
        let weights = block_diagonal(4, 40, 10);
        let first = dtw_first_columns(&weights).unwrap();
        assert_eq!(first.len(), 4);
        for (row, &col) in first.iter().enumerate() {
            assert!(
                col >= row * 10 && col < (row + 1) * 10,
                "row {row} landed at column {col}"
            );
        }
        // First columns are non-decreasing by construction of the path.
        for pair in first.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
    }

    #[test]
    fn word_times_are_ordered_and_probabilities_valid() {
        let weights = block_diagonal(6, 120, 20);
        let tokens = vec![vec![1, 2, 3], vec![4, 5, 6]];
        let logprobs = vec![vec![-0.2, -0.1, -0.3], vec![-0.4, -0.2, -0.1]];
        let words = word_timings(&StubVocab, "en", &tokens, &logprobs, &weights, 10.0).unwrap();
        assert_eq!(words.len(), 2);
        let flat: Vec<&WordTiming> = words.iter().flatten().collect();
        assert_eq!(flat.len(), 6);
        for pair in flat.windows(2) {
            assert!(pair[1].start >= pair[0].start);
        }
        for word in &flat {
            assert!(word.end >= word.start);
            assert!(word.probability > 0.0 && word.probability <= 1.0);
            assert!(word.start >= 10.0 - 1e-4);
        }
    }

    #[test]
    fn row_count_mismatch_is_an_error() {
        let weights = block_diagonal(3, 30, 10);
        let tokens = vec![vec![1, 2, 3, 4]];
        let logprobs = vec![vec![-0.1; 4]];
        let err = word_timings(&StubVocab, "en", &tokens, &logprobs, &weights, 0.0).unwrap_err();
        assert!(matches!(err, TranscribeError::SegmentingFailed(_)));
    }

    #[test]
    fn punctuation_merges_into_neighbours() {
        let mut words = vec![
            WordTiming {
                word: "\"".into(),
                tokens: vec![91],
                start: 0.0,
                end: 0.1,
                probability: 0.9,
            },
            WordTiming {
                word: " hello".into(),
                tokens: vec![1],
                start: 0.1,
                end: 0.4,
                probability: 0.9,
            },
            WordTiming {
                word: ".".into(),
                tokens: vec![90],
                start: 0.4,
                end: 0.5,
                probability: 0.9,
            },
        ];
        merge_punctuations(&mut words);
        assert_eq!(words.len(), 1);
        assert_eq!(words[0].word, "\" hello.");
        assert_eq!(words[0].tokens, vec![91, 1, 90]);
        assert!((words[0].start - 0.0).abs() < 1e-6);
        assert!((words[0].end - 0.5).abs() < 1e-6);
    }

    #[test]
    fn long_word_after_sentence_end_is_clipped() {
        let mut words = vec![
            WordTiming {
                word: " done.".into(),
                tokens: vec![1],
                start: 0.0,
                end: 0.3,
                probability: 0.9,
            },
            WordTiming {
                word: " next".into(),
                tokens: vec![2],
                start: 0.3,
                end: 5.0,
                probability: 0.9,
            },
            WordTiming {
                word: " ok".into(),
                tokens: vec![3],
                start: 5.0,
                end: 5.2,
                probability: 0.9,
            },
        ];
        constrain_word_durations(&mut words);
        let duration = words[1].end - words[1].start;
        assert!(duration <= 2.0 * MEDIAN_DURATION_CAP + 1e-4);
    }

    #[test]
    fn segment_bounds_follow_words_within_half_second() {
        let words = vec![WordTiming {
            word: " a".into(),
            tokens: vec![1],
            start: 1.2,
            end: 2.8,
            probability: 0.8,
        }];
        let (start, end) = reconcile_segment_bounds(1.0, 3.0, &words);
        assert!((start - 1.2).abs() < 1e-6);
        assert!((end - 2.8).abs() < 1e-6);

        // Drifted alignment keeps the timestamp-token bounds.
        let (start, end) = reconcile_segment_bounds(5.0, 9.0, &words);
        assert!((start - 5.0).abs() < 1e-6);
        assert!((end - 9.0).abs() < 1e-6);
    }
}
