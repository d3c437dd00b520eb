use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use candle_core::Device;
use clap::Parser;
use clap::Subcommand;
use tracing::error;
use tracing_subscriber::EnvFilter;

use speech_runner::inference::pcm_decode::pcm_decode_file;
use speech_runner::inference::result::TranscriptionSegment;
use speech_runner::inference::SAMPLE_RATE;
use speech_runner::{
    DecodingOptions, ModelSource, Task, TranscribeError, Transcriber, TranscriptionResult,
    WhisperModel,
};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory containing the model artifacts
    #[arg(short, long, env, default_value = "models/whisper-base")]
    model_dir: String,

    /// Hugging Face repository to fetch the model artifacts from
    #[arg(long, env)]
    model_repo: Option<String>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Transcribe (or translate) an audio file
    Transcribe {
        /// Input audio file, 16 kHz mono
        file: PathBuf,

        /// ISO 639-1 language code, or "auto"
        #[clap(short, long, default_value = "auto")]
        language: String,

        /// Translate to English instead of transcribing
        #[clap(long)]
        translate: bool,

        /// Decode without timestamp tokens
        #[clap(long)]
        without_timestamps: bool,

        /// Align per-word timestamps
        #[clap(long)]
        word_timestamps: bool,

        /// Initial sampling temperature
        #[clap(short, long, default_value_t = 0.0)]
        temperature: f32,

        /// Output format
        #[clap(short = 'f', long, value_parser = ["txt", "json", "srt"], default_value = "txt")]
        format: String,

        /// Write the output to a file instead of stdout
        #[clap(short, long)]
        output: Option<PathBuf>,
    },
    /// Detect the spoken language of an audio file
    DetectLanguage {
        /// Input audio file, 16 kHz mono
        file: PathBuf,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or(EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    // Usage problems exit with 1; transcription failures map through
    // TranscribeError::exit_code.
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let _ = err.print();
            return ExitCode::from(1);
        }
    };

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::from(err.exit_code())
        }
    }
}

fn run(args: Args) -> Result<(), TranscribeError> {
    let source = match &args.model_repo {
        Some(repo) => ModelSource::hugging_face(repo.clone()),
        None => ModelSource::directory(&args.model_dir),
    };
    let model = WhisperModel::load(&source, &Device::Cpu)?;
    let transcriber = Transcriber::new(model);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| TranscribeError::TranscriptionFailed(e.to_string()))?;

    match args.cmd {
        Commands::Transcribe {
            file,
            language,
            translate,
            without_timestamps,
            word_timestamps,
            temperature,
            format,
            output,
        } => {
            let samples = load_audio(&file)?;
            let options = DecodingOptions {
                task: if translate {
                    Task::Translate
                } else {
                    Task::Transcribe
                },
                language: Some(language),
                temperature,
                without_timestamps,
                word_timestamps,
                ..DecodingOptions::default()
            };
            let result = runtime.block_on(transcriber.transcribe(samples, options, None))?;
            let rendered = match format.as_str() {
                "json" => serde_json::to_string_pretty(&result)
                    .map_err(|e| TranscribeError::TranscriptionFailed(e.to_string()))?,
                "srt" => render_srt(&result.segments),
                _ => format!("{}\n", result.text.trim()),
            };
            write_output(output.as_deref(), &rendered)?;
        }
        Commands::DetectLanguage { file } => {
            let samples = load_audio(&file)?;
            let options = DecodingOptions {
                language: None,
                detect_language_only: true,
                ..DecodingOptions::default()
            };
            let result = runtime.block_on(transcriber.transcribe(samples, options, None))?;
            print_language(&result);
        }
    }
    Ok(())
}

fn load_audio(file: &std::path::Path) -> Result<Vec<f32>, TranscribeError> {
    let (samples, sample_rate) = pcm_decode_file(file)?;
    if sample_rate as usize != SAMPLE_RATE {
        return Err(TranscribeError::AudioProcessingFailed(format!(
            "input must have a {SAMPLE_RATE} Hz sampling rate, got {sample_rate}"
        )));
    }
    Ok(samples)
}

fn print_language(result: &TranscriptionResult) {
    let probability = result
        .language_probs
        .get(&result.language)
        .copied()
        .unwrap_or(1.0);
    println!("{} ({:.1}%)", result.language, probability * 100.0);
}

fn write_output(path: Option<&std::path::Path>, rendered: &str) -> Result<(), TranscribeError> {
    match path {
        Some(path) => std::fs::write(path, rendered)
            .map_err(|e| TranscribeError::TranscriptionFailed(format!("{}: {e}", path.display()))),
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout
                .write_all(rendered.as_bytes())
                .map_err(|e| TranscribeError::TranscriptionFailed(e.to_string()))
        }
    }
}

fn render_srt(segments: &[TranscriptionSegment]) -> String {
    let mut out = String::new();
    for (index, segment) in segments.iter().enumerate() {
        out.push_str(&format!(
            "{}\n{} --> {}\n{}\n\n",
            index + 1,
            srt_timestamp(segment.start),
            srt_timestamp(segment.end),
            segment.text.trim()
        ));
    }
    out
}

fn srt_timestamp(seconds: f32) -> String {
    let total_millis = (f64::from(seconds) * 1000.0).round() as u64;
    let millis = total_millis % 1000;
    let total_seconds = total_millis / 1000;
    format!(
        "{:02}:{:02}:{:02},{:03}",
        total_seconds / 3600,
        (total_seconds / 60) % 60,
        total_seconds % 60,
        millis
    )
}
