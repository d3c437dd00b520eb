use crate::inference::tokens::SpecialTokens;

/// In-place logit mask. `tokens` is the full token list for the window,
/// prompt included; filters that care about the sampled region know the
/// prompt length.
pub trait LogitsFilter: Send + Sync {
    fn apply(&self, logits: &mut [f32], tokens: &[u32]);
}

/// Ordered filter pipeline; order of application is significant.
pub struct LogitsFilterStack {
    filters: Vec<Box<dyn LogitsFilter>>,
}

impl LogitsFilterStack {
    pub fn new(filters: Vec<Box<dyn LogitsFilter>>) -> Self {
        Self { filters }
    }

    pub fn apply(&self, logits: &mut [f32], tokens: &[u32]) {
        for filter in &self.filters {
            filter.apply(logits, tokens);
        }
    }
}

/// Forbids an empty transcript: at the first sampled position the
/// whitespace tokens and end-of-text are masked.
pub struct SuppressBlank {
    whitespace: Vec<u32>,
    end_of_text: u32,
    sample_begin: usize,
}

impl SuppressBlank {
    pub fn new(whitespace: Vec<u32>, end_of_text: u32, sample_begin: usize) -> Self {
        Self {
            whitespace,
            end_of_text,
            sample_begin,
        }
    }
}

impl LogitsFilter for SuppressBlank {
    fn apply(&self, logits: &mut [f32], tokens: &[u32]) {
        if tokens.len() != self.sample_begin {
            return;
        }
        for &token in self.whitespace.iter().chain(std::iter::once(&self.end_of_text)) {
            if let Some(logit) = logits.get_mut(token as usize) {
                *logit = f32::NEG_INFINITY;
            }
        }
    }
}

/// Masks a fixed token list at every step.
pub struct SuppressTokens {
    tokens: Vec<u32>,
}

impl SuppressTokens {
    pub fn new(tokens: Vec<u32>) -> Self {
        Self { tokens }
    }
}

impl LogitsFilter for SuppressTokens {
    fn apply(&self, logits: &mut [f32], _tokens: &[u32]) {
        for &token in &self.tokens {
            if let Some(logit) = logits.get_mut(token as usize) {
                *logit = f32::NEG_INFINITY;
            }
        }
    }
}

/// Enforces the timestamp grammar: timestamps come in non-decreasing pairs,
/// a lone timestamp must be closed before more text, and when the
/// probability mass on timestamps beats every text token the next token is
/// forced to be a timestamp.
pub struct TimestampRules {
    special: SpecialTokens,
    sample_begin: usize,
    /// Highest timestamp index allowed at the first sampled position, when
    /// a bound was requested.
    max_initial_timestamp_index: Option<u32>,
}

impl TimestampRules {
    pub fn new(
        special: SpecialTokens,
        sample_begin: usize,
        max_initial_timestamp_index: Option<u32>,
    ) -> Self {
        Self {
            special,
            sample_begin,
            max_initial_timestamp_index,
        }
    }
}

impl LogitsFilter for TimestampRules {
    fn apply(&self, logits: &mut [f32], tokens: &[u32]) {
        let ts_begin = self.special.time_token_begin as usize;
        let eot = self.special.end_of_text as usize;

        if let Some(logit) = logits.get_mut(self.special.no_timestamps as usize) {
            *logit = f32::NEG_INFINITY;
        }

        let sampled = &tokens[self.sample_begin.min(tokens.len())..];
        let last_was_timestamp = sampled
            .last()
            .is_some_and(|&t| self.special.is_timestamp(t));
        // A lone leading timestamp counts as a closed pair, so text may
        // follow the segment opener.
        let penultimate_was_timestamp = sampled.len() < 2
            || self.special.is_timestamp(sampled[sampled.len() - 2]);

        if last_was_timestamp {
            if penultimate_was_timestamp {
                // Pair closed; the next token must be text.
                for logit in &mut logits[ts_begin..] {
                    *logit = f32::NEG_INFINITY;
                }
            } else {
                // Open pair; only its closing timestamp or end-of-text may
                // follow.
                for (i, logit) in logits[..ts_begin].iter_mut().enumerate() {
                    if i != eot {
                        *logit = f32::NEG_INFINITY;
                    }
                }
            }
        }

        // Timestamps never go backwards, and a closed pair forbids reusing
        // its end timestamp so segments stay nonzero.
        if let Some(&last_ts) = sampled
            .iter()
            .rev()
            .find(|&&t| self.special.is_timestamp(t))
        {
            let floor = if last_was_timestamp && !penultimate_was_timestamp {
                last_ts
            } else {
                last_ts + 1
            } as usize;
            let end = floor.min(logits.len());
            for logit in &mut logits[ts_begin..end] {
                *logit = f32::NEG_INFINITY;
            }
        }

        if sampled.is_empty() {
            if let Some(max_index) = self.max_initial_timestamp_index {
                let last_allowed = ts_begin + max_index as usize;
                if last_allowed + 1 < logits.len() {
                    for logit in &mut logits[last_allowed + 1..] {
                        *logit = f32::NEG_INFINITY;
                    }
                }
            }
        }

        // When the combined timestamp mass outweighs every text token,
        // sampling anything but a timestamp would be inconsistent.
        let timestamp_logprob = log_sum_exp(&logits[ts_begin..]);
        let max_text = logits[..ts_begin]
            .iter()
            .copied()
            .fold(f32::NEG_INFINITY, f32::max);
        if timestamp_logprob > max_text {
            for logit in &mut logits[..ts_begin] {
                *logit = f32::NEG_INFINITY;
            }
        }
    }
}

/// Detection-only filter: everything that is not a language token is
/// masked.
pub struct LanguageOnly {
    language_tokens: Vec<u32>,
}

impl LanguageOnly {
    pub fn new(mut language_tokens: Vec<u32>) -> Self {
        language_tokens.sort_unstable();
        Self { language_tokens }
    }
}

impl LogitsFilter for LanguageOnly {
    fn apply(&self, logits: &mut [f32], _tokens: &[u32]) {
        for (i, logit) in logits.iter_mut().enumerate() {
            if self.language_tokens.binary_search(&(i as u32)).is_err() {
                *logit = f32::NEG_INFINITY;
            }
        }
    }
}

fn log_sum_exp(logits: &[f32]) -> f32 {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        return f32::NEG_INFINITY;
    }
    let sum: f32 = logits.iter().map(|l| (l - max).exp()).sum();
    max + sum.ln()
}

#[cfg(test)]
mod tests {
    use super::*;

    // Tiny synthetic vocabulary: text 0..10, specials 10..20, timestamps
    // 20..30.
    fn special() -> SpecialTokens {
        SpecialTokens {
            start_of_transcript: 11,
            end_of_text: 10,
            transcribe: 12,
            translate: 13,
            no_speech: 14,
            no_timestamps: 19,
            start_of_prev: 15,
            special_token_begin: 10,
            time_token_begin: 20,
        }
    }

    fn flat_logits() -> Vec<f32> {
        vec![0.0; 30]
    }

    #[test]
    fn suppress_blank_only_at_first_position() {
        let filter = SuppressBlank::new(vec![5], 10, 3);
        let mut logits = flat_logits();
        filter.apply(&mut logits, &[11, 12, 19]);
        assert_eq!(logits[5], f32::NEG_INFINITY);
        assert_eq!(logits[10], f32::NEG_INFINITY);

        let mut logits = flat_logits();
        filter.apply(&mut logits, &[11, 12, 19, 4]);
        assert_eq!(logits[5], 0.0);
    }

    #[test]
    fn closed_pair_forces_text() {
        let rules = TimestampRules::new(special(), 2, None);
        let mut logits = flat_logits();
        // Prompt of 2, then text, then a closed timestamp pair.
        rules.apply(&mut logits, &[11, 12, 3, 21, 21]);
        for logit in &logits[20..] {
            assert_eq!(*logit, f32::NEG_INFINITY);
        }
        assert!(logits[3].is_finite());
    }

    #[test]
    fn open_pair_forces_timestamp_or_eot() {
        let rules = TimestampRules::new(special(), 2, None);
        let mut logits = flat_logits();
        // End-of-text carries enough mass that the timestamp-sum rule does
        // not fire on top of the pair rule.
        logits[10] = 5.0;
        rules.apply(&mut logits, &[11, 12, 21, 3, 22]);
        for (i, logit) in logits.iter().enumerate() {
            if i < 20 && i != 10 {
                assert_eq!(*logit, f32::NEG_INFINITY, "token {i} should be masked");
            }
        }
        assert!(logits[10].is_finite());
        // Non-decreasing: timestamps below the open one are masked too.
        assert_eq!(logits[21], f32::NEG_INFINITY);
        assert!(logits[22].is_finite());
    }

    #[test]
    fn closed_pair_floor_excludes_reuse() {
        let rules = TimestampRules::new(special(), 2, None);
        let mut logits = flat_logits();
        // Pair 21..21 closed, then text; next timestamp must be > 21.
        rules.apply(&mut logits, &[11, 12, 21, 3, 21, 5]);
        assert_eq!(logits[20], f32::NEG_INFINITY);
        assert_eq!(logits[21], f32::NEG_INFINITY);
        assert!(logits[22].is_finite());
    }

    #[test]
    fn timestamp_mass_forces_timestamp() {
        let rules = TimestampRules::new(special(), 2, None);
        let mut logits = flat_logits();
        // Lift every timestamp slightly; their combined mass beats any
        // single text token.
        for logit in &mut logits[20..] {
            *logit = 0.5;
        }
        rules.apply(&mut logits, &[11, 12, 21, 21, 4]);
        for logit in &logits[..20] {
            assert_eq!(*logit, f32::NEG_INFINITY);
        }
    }

    #[test]
    fn max_initial_timestamp_clamps_first_position() {
        let rules = TimestampRules::new(special(), 2, Some(3));
        let mut logits = flat_logits();
        rules.apply(&mut logits, &[11, 12]);
        assert!(logits[23].is_finite());
        // Tokens above begin+3 are masked.
        for logit in &logits[24..] {
            assert_eq!(*logit, f32::NEG_INFINITY);
        }
    }

    #[test]
    fn language_only_masks_everything_else() {
        let filter = LanguageOnly::new(vec![16, 17]);
        let mut logits = flat_logits();
        filter.apply(&mut logits, &[]);
        for (i, logit) in logits.iter().enumerate() {
            if i == 16 || i == 17 {
                assert!(logit.is_finite());
            } else {
                assert_eq!(*logit, f32::NEG_INFINITY);
            }
        }
    }

    #[test]
    fn no_timestamps_token_always_masked() {
        let rules = TimestampRules::new(special(), 2, None);
        let mut logits = flat_logits();
        rules.apply(&mut logits, &[11, 12, 4]);
        assert_eq!(logits[19], f32::NEG_INFINITY);
    }
}
