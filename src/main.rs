use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::extract::{DefaultBodyLimit, MatchedPath, Multipart, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use candle_core::Device;
use clap::Parser;
use clap_serde_derive::ClapSerde;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tracing::{error, info, instrument};

#[cfg(unix)]
use tikv_jemallocator::Jemalloc;

use speech_runner::api::transcribe::{
    ResponseFormat, StreamEvent, TranscribeRequest, TranscriptionJson, VerboseTranscriptionJson,
};
use speech_runner::config::Config;
use speech_runner::error::HttpResult;
use speech_runner::inference::pcm_decode::pcm_decode_bytes;
use speech_runner::inference::result::TranscriptionProgress;
use speech_runner::inference::transcriber::ProgressCallback;
use speech_runner::inference::SAMPLE_RATE;
use speech_runner::telemetry::init_telemetry;
use speech_runner::{bail_runner, DecodingOptions, ModelSource, Transcriber, WhisperModel};

#[cfg(unix)]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env, default_value = "SpeechRunner.toml")]
    config_file: String,

    /// Configuration options
    #[command(flatten)]
    pub opt_config: <Config as ClapSerde>::Opt,
}

#[derive(Clone)]
struct AppState {
    transcriber: Arc<Transcriber>,
}

#[tokio::main]
#[instrument]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = match Config::from_toml(&args.config_file) {
        Ok(conf) => conf.merge(args.opt_config),
        Err(err) => {
            if args.config_file == "SpeechRunner.toml" {
                Config::default().merge(args.opt_config)
            } else {
                exit_err!(
                    1,
                    "Failed to read configuration file {} with error: {}",
                    args.config_file,
                    err
                );
            }
        }
    };

    let _guards = init_telemetry(&config.otel_endpoint, config.console, config.trace_local);

    info!(
        "speech_runner v{}",
        option_env!("CARGO_PKG_VERSION").unwrap_or("unknown")
    );
    info!(
        "Supported features: avx: {}, neon: {}, simd128: {}, f16c: {}",
        candle_core::utils::with_avx(),
        candle_core::utils::with_neon(),
        candle_core::utils::with_simd128(),
        candle_core::utils::with_f16c()
    );

    let source = match &config.model_repo {
        Some(repo) => ModelSource::hugging_face(repo.clone()),
        None => ModelSource::directory(&config.model_dir),
    };
    let device = select_device();
    let model = match WhisperModel::load(&source, &device) {
        Ok(model) => model,
        Err(err) => exit_err!(2, "Failed to load model: {}", err),
    };
    let app_state = AppState {
        transcriber: Arc::new(Transcriber::new(model)),
    };

    let audio_router = Router::new()
        .route("/transcriptions", post(handle_transcribe_request))
        // 50 MB limit
        .layer(DefaultBodyLimit::max(50_000_000));

    let router = Router::new()
        .nest("/v1/audio", audio_router)
        .route("/health", get(handle_health_request))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(middleware::from_fn(track_request))
        .with_state(app_state);

    let addr = format!("{}:{}", config.address, config.port)
        .parse::<SocketAddr>()
        .context("Failed to create socket from address and port")?;
    info!("Listening on {}", addr);

    let shutdown_handle = Handle::new();
    tokio::spawn(shutdown_handler(shutdown_handle.clone()));

    match (config.tls.certificate, config.tls.private_key) {
        (Some(certificate), Some(private_key)) => {
            let tls_config = RustlsConfig::from_pem_file(certificate, private_key)
                .await
                .context("Failed to create TLS configuration")?;
            info!("TLS support for HTTPS enabled");
            axum_server::bind_rustls(addr, tls_config)
                .handle(shutdown_handle)
                .serve(router.into_make_service())
                .await?;
        }
        (None, None) => {
            axum_server::bind(addr)
                .handle(shutdown_handle)
                .serve(router.into_make_service())
                .await?;
        }
        _ => exit_err!(
            1,
            "Both certificate and private key must be provided to enable TLS support."
        ),
    };

    Ok(())
}

fn select_device() -> Device {
    if let Ok(device) = Device::new_cuda(0) {
        info!("Using CUDA acceleration");
        device
    } else if let Ok(device) = Device::new_metal(0) {
        info!("Using Metal acceleration");
        device
    } else {
        info!("Using CPU");
        Device::Cpu
    }
}

#[allow(clippy::redundant_pub_crate)]
#[tracing::instrument(level = "info", skip(handle))]
async fn shutdown_handler(handle: Handle) {
    let ctrl_c_signal = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to create ctrl-c signal");
    };

    #[cfg(unix)]
    let terminate_signal = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
                info!("Received terminate signal");
            }
            Err(e) => error!("Failed to listen for terminate signal: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate_signal = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c_signal => handle.graceful_shutdown(Some(Duration::from_secs(45))),
        () = terminate_signal => handle.graceful_shutdown(Some(Duration::from_secs(45))),
    }
}

#[tracing::instrument(level = "trace", skip(request))]
fn get_path(request: &Request) -> String {
    request.extensions().get::<MatchedPath>().map_or_else(
        || request.uri().path().to_string(),
        |matched_path| matched_path.as_str().to_string(),
    )
}

#[instrument(skip_all)]
async fn track_request(req: Request, next: Next) -> HttpResult<Response> {
    let start = Instant::now();
    let method = req.method().to_owned();
    let path = get_path(&req);
    let version = req.version();

    info!(counter.http.server.active_requests = 1, ?method);
    let response = next.run(req).await;
    info!(counter.http.server.active_requests = -1, ?method);
    info!(
        histogram.http.server.request.duration = start.elapsed().as_secs_f64(),
        ?method,
        path,
        ?version
    );

    Ok(response)
}

#[tracing::instrument(level = "trace", skip())]
#[axum_macros::debug_handler]
async fn handle_health_request() -> HttpResult<StatusCode> {
    Ok(StatusCode::OK)
}

#[tracing::instrument(level = "trace", skip(state, multipart))]
#[axum_macros::debug_handler]
async fn handle_transcribe_request(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> HttpResult<Response> {
    let mut request = TranscribeRequest::default();
    let mut file_bytes = None;

    while let Some(field) = multipart.next_field().await? {
        let Some(name) = field.name().map(ToString::to_string) else {
            continue;
        };
        if name == "file" {
            file_bytes = Some(field.bytes().await?);
        } else {
            let value = field.text().await?;
            if let Err(err) = request.set_field(&name, &value) {
                bail_runner!(StatusCode::BAD_REQUEST, err);
            }
        }
    }
    let Some(file_bytes) = file_bytes else {
        bail_runner!(
            StatusCode::BAD_REQUEST,
            "Missing field file in multipart form"
        );
    };

    let (samples, sample_rate) = pcm_decode_bytes(file_bytes.to_vec().into_boxed_slice())?;
    if sample_rate as usize != SAMPLE_RATE {
        bail_runner!(
            StatusCode::BAD_REQUEST,
            "Input audio must have a {} Hz sampling rate, got {}",
            SAMPLE_RATE,
            sample_rate
        );
    }

    let options = request.decoding_options();
    let task = options.task;

    if request.stream {
        return Ok(stream_transcription(state, samples, options).await);
    }

    let result = state
        .transcriber
        .transcribe(samples, options, None)
        .await?;
    let response = match request.response_format {
        ResponseFormat::Text => (
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            result.text,
        )
            .into_response(),
        ResponseFormat::Json => Json(TranscriptionJson { text: result.text }).into_response(),
        ResponseFormat::VerboseJson => {
            Json(VerboseTranscriptionJson::from_result(&result, task)).into_response()
        }
    };
    Ok(response)
}

/// Cumulative text tracker for the SSE stream: committed text from finished
/// windows plus the live partial of the current window.
struct StreamState {
    committed: String,
    window_start: f32,
    window_text: String,
}

async fn stream_transcription(
    state: AppState,
    samples: Vec<f32>,
    options: DecodingOptions,
) -> Response {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<StreamEvent>();

    let stream_state = Arc::new(Mutex::new(StreamState {
        committed: String::new(),
        window_start: 0.0,
        window_text: String::new(),
    }));
    let delta_tx = tx.clone();
    let callback: ProgressCallback = Arc::new(move |progress: TranscriptionProgress| {
        let mut state = stream_state.lock().unwrap();
        if progress.window_start > state.window_start {
            let window_text = std::mem::take(&mut state.window_text);
            state.committed.push_str(&window_text);
            state.window_start = progress.window_start;
        }
        state.window_text = progress.text;
        let cumulative = format!("{}{}", state.committed, state.window_text);
        delta_tx
            .send(StreamEvent::Delta {
                text: cumulative,
                logprobs: None,
            })
            .is_ok()
    });

    let transcriber = Arc::clone(&state.transcriber);
    tokio::spawn(async move {
        match transcriber.transcribe(samples, options, Some(callback)).await {
            Ok(result) => {
                let _ = tx.send(StreamEvent::Done { text: result.text });
            }
            Err(err) => {
                error!(%err, "streamed transcription failed");
                let _ = tx.send(StreamEvent::Done {
                    text: String::new(),
                });
            }
        }
    });

    let events = UnboundedReceiverStream::new(rx).map(|event| {
        let name = match &event {
            StreamEvent::Delta { .. } => "transcript.text.delta",
            StreamEvent::Done { .. } => "transcript.text.done",
        };
        Ok::<Event, Infallible>(
            Event::default()
                .event(name)
                .json_data(&event)
                .unwrap_or_default(),
        )
    });
    Sse::new(events).keep_alive(KeepAlive::default()).into_response()
}

#[macro_export]
macro_rules! exit_err {
    ($msg:expr) => {
        {
            error!($msg);
            std::process::exit(1);
        }
    };
    ($code:expr, $msg:expr) => {
        {
            error!($msg);
            std::process::exit($code);
        }
    };
    ($code:expr, $fmt:expr $(, $arg:expr)*) => {
        {
            error!($fmt $(, $arg)*);
            std::process::exit($code);
        }
    };
}
