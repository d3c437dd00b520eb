use serde::{Deserialize, Serialize};

use crate::inference::result::{TranscriptionSegment, WordTiming};
use crate::inference::{DecodingOptions, Task, TranscriptionResult};

/// Response shapes of the transcription endpoint.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResponseFormat {
    Text,
    #[default]
    Json,
    VerboseJson,
}

/// Fields accepted in the multipart transcription request, next to the
/// audio `file` part.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct TranscribeRequest {
    pub model: Option<String>,
    pub language: Option<String>,
    pub task: Option<Task>,
    #[serde(default)]
    pub response_format: ResponseFormat,
    pub temperature: Option<f32>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub word_timestamps: bool,
}

impl TranscribeRequest {
    /// Applies one multipart text field. Unknown names are rejected so
    /// typos surface instead of being ignored.
    pub fn set_field(&mut self, name: &str, value: &str) -> Result<(), String> {
        match name {
            "model" => self.model = Some(value.to_string()),
            "language" => self.language = Some(value.to_string()),
            "task" => {
                self.task = Some(match value {
                    "transcribe" => Task::Transcribe,
                    "translate" => Task::Translate,
                    other => return Err(format!("unknown task {other}")),
                });
            }
            "response_format" => {
                self.response_format = match value {
                    "text" => ResponseFormat::Text,
                    "json" => ResponseFormat::Json,
                    "verbose_json" => ResponseFormat::VerboseJson,
                    other => return Err(format!("unknown response_format {other}")),
                };
            }
            "temperature" => {
                self.temperature = Some(
                    value
                        .parse::<f32>()
                        .map_err(|e| format!("invalid temperature: {e}"))?,
                );
            }
            "stream" => {
                self.stream = value
                    .parse::<bool>()
                    .map_err(|e| format!("invalid stream flag: {e}"))?;
            }
            "timestamp_granularities" | "timestamp_granularities[]" => {
                if value == "word" {
                    self.word_timestamps = true;
                }
            }
            other => return Err(format!("unknown field {other}")),
        }
        Ok(())
    }

    pub fn decoding_options(&self) -> DecodingOptions {
        DecodingOptions {
            task: self.task.unwrap_or(Task::Transcribe),
            language: self.language.clone(),
            temperature: self.temperature.unwrap_or(0.0),
            word_timestamps: self.word_timestamps,
            ..DecodingOptions::default()
        }
    }
}

/// Seconds rounded to two decimals; the wire contract for every timestamp.
fn round_seconds(value: f32) -> f32 {
    (value * 100.0).round() / 100.0
}

#[derive(Serialize, Debug)]
pub struct TranscriptionJson {
    pub text: String,
}

#[derive(Serialize, Debug)]
pub struct SegmentJson {
    pub id: usize,
    pub seek: usize,
    pub start: f32,
    pub end: f32,
    pub text: String,
    pub tokens: Vec<u32>,
    pub temperature: f32,
    pub avg_logprob: f32,
    pub compression_ratio: f32,
    pub no_speech_prob: f32,
}

#[derive(Serialize, Debug)]
pub struct WordJson {
    pub word: String,
    pub start: f32,
    pub end: f32,
    pub probability: f32,
}

#[derive(Serialize, Debug)]
pub struct VerboseTranscriptionJson {
    pub task: String,
    pub language: String,
    pub duration: f32,
    pub text: String,
    pub segments: Vec<SegmentJson>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub words: Option<Vec<WordJson>>,
}

impl From<&TranscriptionSegment> for SegmentJson {
    fn from(segment: &TranscriptionSegment) -> Self {
        Self {
            id: segment.id,
            seek: segment.seek,
            start: round_seconds(segment.start),
            end: round_seconds(segment.end),
            text: segment.text.clone(),
            tokens: segment.tokens.clone(),
            temperature: segment.temperature,
            avg_logprob: segment.avg_logprob,
            compression_ratio: segment.compression_ratio,
            no_speech_prob: segment.no_speech_prob,
        }
    }
}

impl From<&WordTiming> for WordJson {
    fn from(word: &WordTiming) -> Self {
        Self {
            word: word.word.trim().to_string(),
            start: round_seconds(word.start),
            end: round_seconds(word.end),
            probability: word.probability,
        }
    }
}

impl VerboseTranscriptionJson {
    pub fn from_result(result: &TranscriptionResult, task: Task) -> Self {
        let words: Vec<WordJson> = result
            .segments
            .iter()
            .filter_map(|s| s.words.as_ref())
            .flatten()
            .map(WordJson::from)
            .collect();
        Self {
            task: match task {
                Task::Transcribe => "transcribe".to_string(),
                Task::Translate => "translate".to_string(),
            },
            language: result.language.clone(),
            duration: round_seconds(result.timings.audio_seconds as f32),
            text: result.text.clone(),
            segments: result.segments.iter().map(SegmentJson::from).collect(),
            words: (!words.is_empty()).then_some(words),
        }
    }
}

/// Server-sent events for `stream=true`. Delta events carry the cumulative
/// text so far; the stream closes after the done event.
#[derive(Serialize, Debug, Clone)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "transcript.text.delta")]
    Delta {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        logprobs: Option<Vec<f32>>,
    },
    #[serde(rename = "transcript.text.done")]
    Done { text: String },
}
