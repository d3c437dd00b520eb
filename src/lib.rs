#![warn(
    clippy::correctness,
    clippy::complexity,
    clippy::suspicious,
    clippy::pedantic,
    clippy::cargo,
    clippy::perf,
    clippy::style,
    clippy::nursery
)]
#![allow(
    clippy::missing_errors_doc,
    clippy::module_name_repetitions,
    clippy::multiple_crate_versions,
    clippy::cargo_common_metadata
)]

pub mod api;
pub mod config;
pub mod error;
pub mod inference;
pub mod telemetry;

pub use inference::{
    DecodingOptions, ModelSource, Task, TranscribeError, Transcriber, TranscriptionResult,
    WhisperModel,
};
