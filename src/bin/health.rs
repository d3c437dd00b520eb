use reqwest::Url;
use std::{env, process::ExitCode, time::Duration};

/// Container health probe: exits 0 when the server's /health endpoint
/// answers with a success status.
fn main() -> ExitCode {
    let url = env::args()
        .nth(1)
        .or_else(|| env::var("SPEECH_RUNNER_HEALTH_URL").ok())
        .unwrap_or_else(|| "http://127.0.0.1:25560/health".to_string());
    let url = match Url::parse(&url) {
        Ok(url) => url,
        Err(err) => {
            eprintln!("Invalid health URL {url}: {err}");
            return ExitCode::from(1);
        }
    };

    let client = match reqwest::blocking::Client::builder()
        .use_rustls_tls()
        .timeout(Duration::from_secs(5))
        .build()
    {
        Ok(client) => client,
        Err(err) => {
            eprintln!("Failed to build HTTP client: {err}");
            return ExitCode::from(1);
        }
    };

    match client.get(url).send() {
        Ok(response) if response.status().is_success() => ExitCode::SUCCESS,
        Ok(response) => {
            eprintln!("Health endpoint returned {}", response.status());
            ExitCode::from(1)
        }
        Err(err) => {
            eprintln!("Health request failed: {err}");
            ExitCode::from(1)
        }
    }
}
