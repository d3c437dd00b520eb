use std::collections::HashMap;

use crate::inference::decoder::TextDecoder;
use crate::inference::encoder::EncoderEmbedding;
use crate::inference::error::{Result, TranscribeError};
use crate::inference::filters::{LanguageOnly, LogitsFilter};
use crate::inference::tokens::Vocabulary;

/// ISO 639-1 codes and display names of the languages Whisper was trained
/// on, in model order.
pub const LANGUAGES: &[(&str, &str)] = &[
    ("en", "english"),
    ("zh", "chinese"),
    ("de", "german"),
    ("es", "spanish"),
    ("ru", "russian"),
    ("ko", "korean"),
    ("fr", "french"),
    ("ja", "japanese"),
    ("pt", "portuguese"),
    ("tr", "turkish"),
    ("pl", "polish"),
    ("ca", "catalan"),
    ("nl", "dutch"),
    ("ar", "arabic"),
    ("sv", "swedish"),
    ("it", "italian"),
    ("id", "indonesian"),
    ("hi", "hindi"),
    ("fi", "finnish"),
    ("vi", "vietnamese"),
    ("he", "hebrew"),
    ("uk", "ukrainian"),
    ("el", "greek"),
    ("ms", "malay"),
    ("cs", "czech"),
    ("ro", "romanian"),
    ("da", "danish"),
    ("hu", "hungarian"),
    ("ta", "tamil"),
    ("no", "norwegian"),
    ("th", "thai"),
    ("ur", "urdu"),
    ("hr", "croatian"),
    ("bg", "bulgarian"),
    ("lt", "lithuanian"),
    ("la", "latin"),
    ("mi", "maori"),
    ("ml", "malayalam"),
    ("cy", "welsh"),
    ("sk", "slovak"),
    ("te", "telugu"),
    ("fa", "persian"),
    ("lv", "latvian"),
    ("bn", "bengali"),
    ("sr", "serbian"),
    ("az", "azerbaijani"),
    ("sl", "slovenian"),
    ("kn", "kannada"),
    ("et", "estonian"),
    ("mk", "macedonian"),
    ("br", "breton"),
    ("eu", "basque"),
    ("is", "icelandic"),
    ("hy", "armenian"),
    ("ne", "nepali"),
    ("mn", "mongolian"),
    ("bs", "bosnian"),
    ("kk", "kazakh"),
    ("sq", "albanian"),
    ("sw", "swahili"),
    ("gl", "galician"),
    ("mr", "marathi"),
    ("pa", "punjabi"),
    ("si", "sinhala"),
    ("km", "khmer"),
    ("sn", "shona"),
    ("yo", "yoruba"),
    ("so", "somali"),
    ("af", "afrikaans"),
    ("oc", "occitan"),
    ("ka", "georgian"),
    ("be", "belarusian"),
    ("tg", "tajik"),
    ("sd", "sindhi"),
    ("gu", "gujarati"),
    ("am", "amharic"),
    ("yi", "yiddish"),
    ("lo", "lao"),
    ("uz", "uzbek"),
    ("fo", "faroese"),
    ("ht", "haitian creole"),
    ("ps", "pashto"),
    ("tk", "turkmen"),
    ("nn", "nynorsk"),
    ("mt", "maltese"),
    ("sa", "sanskrit"),
    ("lb", "luxembourgish"),
    ("my", "myanmar"),
    ("bo", "tibetan"),
    ("tl", "tagalog"),
    ("mg", "malagasy"),
    ("as", "assamese"),
    ("tt", "tatar"),
    ("haw", "hawaiian"),
    ("ln", "lingala"),
    ("ha", "hausa"),
    ("ba", "bashkir"),
    ("jw", "javanese"),
    ("su", "sundanese"),
    ("yue", "cantonese"),
];

/// Detected language plus the softmax distribution over all language
/// tokens.
#[derive(Debug, Clone)]
pub struct LanguageDetection {
    pub language: String,
    pub probs: HashMap<String, f32>,
}

/// Runs one decoder step from start-of-transcript with every non-language
/// token masked, and reads the distribution over language tokens.
#[tracing::instrument(level = "debug", skip_all)]
pub fn detect_language(
    decoder: &dyn TextDecoder,
    embedding: &EncoderEmbedding,
    vocab: &dyn Vocabulary,
) -> Result<LanguageDetection> {
    let special = *vocab.special();
    let mut cache = decoder.new_cache(false);
    let prompt = [special.start_of_transcript];
    let mut logits = decoder.prefill(&prompt, embedding, &mut cache)?;

    let language_tokens: Vec<u32> = LANGUAGES
        .iter()
        .filter_map(|(code, _)| vocab.language_token(code))
        .collect();
    if language_tokens.is_empty() {
        return Err(TranscribeError::PrepareDecoderInputsFailed(
            "model has no language tokens to detect from".into(),
        ));
    }
    LanguageOnly::new(language_tokens).apply(&mut logits, &prompt);

    // Softmax over what survived the mask.
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let denom: f32 = logits
        .iter()
        .filter(|l| l.is_finite())
        .map(|l| (l - max).exp())
        .sum();
    let mut probs: HashMap<String, f32> = HashMap::new();
    for (code, _) in LANGUAGES {
        if let Some(token) = vocab.language_token(code) {
            if let Some(&logit) = logits.get(token as usize) {
                if logit.is_finite() {
                    probs.insert((*code).to_string(), (logit - max).exp() / denom);
                }
            }
        }
    }

    let language = probs
        .iter()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(code, _)| code.clone())
        .unwrap_or_else(|| "en".to_string());
    tracing::debug!(language, "detected language");
    Ok(LanguageDetection { language, probs })
}
