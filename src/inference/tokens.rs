use std::collections::HashMap;

use tokenizers::Tokenizer;

use crate::inference::error::{Result, TranscribeError};
use crate::inference::language::LANGUAGES;
use crate::inference::SECONDS_PER_TIME_TOKEN;

pub const SOT_TOKEN: &str = "<|startoftranscript|>";
pub const EOT_TOKEN: &str = "<|endoftext|>";
pub const TRANSCRIBE_TOKEN: &str = "<|transcribe|>";
pub const TRANSLATE_TOKEN: &str = "<|translate|>";
pub const NO_TIMESTAMPS_TOKEN: &str = "<|notimestamps|>";
pub const SOT_PREV_TOKEN: &str = "<|startofprev|>";
pub const NO_SPEECH_TOKENS: [&str; 2] = ["<|nocaptions|>", "<|nospeech|>"];

/// The fixed points of the Whisper vocabulary. Text tokens sit below
/// `special_token_begin`, timestamp tokens at and above `time_token_begin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecialTokens {
    pub start_of_transcript: u32,
    pub end_of_text: u32,
    pub transcribe: u32,
    pub translate: u32,
    pub no_speech: u32,
    pub no_timestamps: u32,
    pub start_of_prev: u32,
    pub special_token_begin: u32,
    pub time_token_begin: u32,
}

impl SpecialTokens {
    pub fn is_timestamp(&self, token: u32) -> bool {
        token >= self.time_token_begin
    }

    pub fn is_text(&self, token: u32) -> bool {
        token < self.special_token_begin
    }

    /// Seconds encoded by a timestamp token.
    pub fn timestamp_seconds(&self, token: u32) -> f32 {
        (token.saturating_sub(self.time_token_begin)) as f32 * SECONDS_PER_TIME_TOKEN
    }
}

/// One word (or attached punctuation group) with the tokens that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct WordPiece {
    pub text: String,
    pub tokens: Vec<u32>,
}

/// The tokenizer contract the engine relies on. Kept behind a trait so the
/// segmenting and alignment code can be exercised without tokenizer
/// artifacts on disk.
pub trait Vocabulary: Send + Sync {
    fn decode(&self, tokens: &[u32], skip_special: bool) -> Result<String>;
    /// Groups text tokens into display words for word-level timestamps.
    fn split_to_word_tokens(&self, tokens: &[u32], language: &str) -> Result<Vec<WordPiece>>;
    fn language_token(&self, code: &str) -> Option<u32>;
    fn language_code(&self, token: u32) -> Option<String>;
    /// Token ids whose text is pure whitespace, masked by the blank filter.
    fn whitespace_token_ids(&self) -> &[u32];
    fn special(&self) -> &SpecialTokens;
}

/// Languages written without spaces between words; word grouping falls back
/// to per-codepoint splits for these.
const NO_SPACE_LANGUAGES: [&str; 6] = ["zh", "ja", "th", "lo", "my", "yue"];

/// `tokenizers`-backed implementation of [`Vocabulary`].
pub struct WhisperTokenizer {
    inner: Tokenizer,
    special: SpecialTokens,
    whitespace: Vec<u32>,
    language_by_code: HashMap<String, u32>,
    code_by_token: HashMap<u32, String>,
}

impl WhisperTokenizer {
    pub fn new(inner: Tokenizer) -> Result<Self> {
        let token_id = |name: &str| -> Result<u32> {
            inner.token_to_id(name).ok_or_else(|| {
                TranscribeError::TokenizerUnavailable(format!("no token id for {name}"))
            })
        };
        let end_of_text = token_id(EOT_TOKEN)?;
        let no_timestamps = token_id(NO_TIMESTAMPS_TOKEN)?;
        let no_speech = NO_SPEECH_TOKENS
            .iter()
            .find_map(|name| inner.token_to_id(name))
            .ok_or_else(|| {
                TranscribeError::TokenizerUnavailable("no no-speech token in vocabulary".into())
            })?;
        let special = SpecialTokens {
            start_of_transcript: token_id(SOT_TOKEN)?,
            end_of_text,
            transcribe: token_id(TRANSCRIBE_TOKEN)?,
            translate: token_id(TRANSLATE_TOKEN)?,
            no_speech,
            no_timestamps,
            start_of_prev: token_id(SOT_PREV_TOKEN)?,
            special_token_begin: end_of_text,
            time_token_begin: no_timestamps + 1,
        };

        let whitespace = [" ", "  ", "\n", "\t"]
            .iter()
            .filter_map(|s| {
                let encoding = inner.encode(*s, false).ok()?;
                match encoding.get_ids() {
                    [single] => Some(*single),
                    _ => None,
                }
            })
            .collect();

        let mut language_by_code = HashMap::new();
        let mut code_by_token = HashMap::new();
        for (code, _) in LANGUAGES {
            if let Some(id) = inner.token_to_id(&format!("<|{code}|>")) {
                language_by_code.insert((*code).to_string(), id);
                code_by_token.insert(id, (*code).to_string());
            }
        }

        Ok(Self {
            inner,
            special,
            whitespace,
            language_by_code,
            code_by_token,
        })
    }

    pub fn is_multilingual(&self) -> bool {
        !self.language_by_code.is_empty()
    }

    /// Splits tokens into the smallest groups that decode to valid UTF-8,
    /// so multi-token codepoints stay together.
    fn split_tokens_on_unicode(&self, tokens: &[u32]) -> Result<Vec<WordPiece>> {
        let mut pieces = Vec::new();
        let mut current: Vec<u32> = Vec::new();
        for &token in tokens {
            current.push(token);
            let text = self.decode(&current, false)?;
            if !text.contains('\u{FFFD}') {
                pieces.push(WordPiece {
                    text,
                    tokens: std::mem::take(&mut current),
                });
            }
        }
        if !current.is_empty() {
            let text = self.decode(&current, false)?;
            pieces.push(WordPiece {
                text,
                tokens: current,
            });
        }
        Ok(pieces)
    }
}

fn is_punctuation_piece(text: &str) -> bool {
    let trimmed = text.trim();
    !trimmed.is_empty()
        && trimmed
            .chars()
            .all(|c| c.is_ascii_punctuation() || "。，！？、．·".contains(c))
}

impl Vocabulary for WhisperTokenizer {
    fn decode(&self, tokens: &[u32], skip_special: bool) -> Result<String> {
        self.inner
            .decode(tokens, skip_special)
            .map_err(|e| TranscribeError::TranscriptionFailed(format!("token decode failed: {e}")))
    }

    fn split_to_word_tokens(&self, tokens: &[u32], language: &str) -> Result<Vec<WordPiece>> {
        let pieces = self.split_tokens_on_unicode(tokens)?;
        if NO_SPACE_LANGUAGES.contains(&language) {
            return Ok(pieces);
        }

        let mut words: Vec<WordPiece> = Vec::new();
        for piece in pieces {
            let is_special = piece
                .tokens
                .first()
                .is_some_and(|&t| t >= self.special.special_token_begin);
            let starts_with_space = piece.text.starts_with(' ');
            let new_word = is_special
                || starts_with_space
                || is_punctuation_piece(&piece.text)
                || words.is_empty();
            if new_word {
                words.push(piece);
            } else {
                let last = words.last_mut().unwrap();
                last.text.push_str(&piece.text);
                last.tokens.extend(piece.tokens);
            }
        }
        Ok(words)
    }

    fn language_token(&self, code: &str) -> Option<u32> {
        self.language_by_code.get(code).copied()
    }

    fn language_code(&self, token: u32) -> Option<String> {
        self.code_by_token.get(&token).cloned()
    }

    fn whitespace_token_ids(&self) -> &[u32] {
        &self.whitespace
    }

    fn special(&self) -> &SpecialTokens {
        &self.special
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_classification() {
        let special = SpecialTokens {
            start_of_transcript: 50258,
            end_of_text: 50257,
            transcribe: 50359,
            translate: 50358,
            no_speech: 50362,
            no_timestamps: 50363,
            start_of_prev: 50361,
            special_token_begin: 50257,
            time_token_begin: 50364,
        };
        assert!(special.is_text(100));
        assert!(!special.is_text(50258));
        assert!(special.is_timestamp(50364));
        assert!(!special.is_timestamp(50363));
        assert!((special.timestamp_seconds(50364 + 50) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn punctuation_pieces() {
        assert!(is_punctuation_piece("."));
        assert!(is_punctuation_piece(" ?"));
        assert!(is_punctuation_piece("！"));
        assert!(!is_punctuation_piece(" hello"));
        assert!(!is_punctuation_piece(""));
    }
}
