mod common;

use common::*;
use speech_runner::inference::N_SAMPLES_PER_WINDOW;
use speech_runner::DecodingOptions;

/// A window of hallucinated repetition: compresses extremely well.
fn repetitive_script() -> WindowScript {
    let mut tokens = vec![5u32; 20];
    tokens.push(EOT);
    WindowScript::of(&tokens)
}

#[tokio::test]
async fn silent_window_is_skipped_and_seek_advances_one_window() {
    // The no-speech token peaks at prefill while everything decoded is
    // low-confidence.
    let script = WindowScript {
        steps: vec![ScriptedStep {
            token: NO_SPEECH,
            peak: 8.0,
        }],
    };
    let (transcriber, decoder) = scripted_transcriber(vec![script]);
    let options = DecodingOptions {
        language: Some("en".into()),
        no_speech_threshold: Some(0.6),
        // Nothing the mock emits is confident enough to override the skip.
        logprob_threshold: Some(10.0),
        ..DecodingOptions::default()
    };

    let result = transcriber
        .transcribe(vec![0.0; N_SAMPLES_PER_WINDOW], options, None)
        .await
        .unwrap();

    assert!(result.segments.is_empty());
    assert!(result.text.is_empty());
    // Exactly one full window was consumed.
    assert_eq!(result.seek_time, Some(30.0));
    assert_eq!(decoder.prefill_calls(), 1);
}

#[tokio::test]
async fn repetitive_window_retries_at_higher_temperature() {
    let scripts = vec![
        repetitive_script(),
        WindowScript::of(&[1, 2, 3, EOT]),
    ];
    let (transcriber, decoder) = scripted_transcriber(scripts);
    let options = DecodingOptions {
        language: Some("en".into()),
        compression_ratio_threshold: Some(1.5),
        temperature_fallback_step: 0.2,
        ..DecodingOptions::default()
    };

    let result = transcriber
        .transcribe(silence(30.0), options, None)
        .await
        .unwrap();

    // The retry produced a different token sequence than the greedy pass.
    assert_eq!(result.text, " w1 w2 w3");
    assert_eq!(decoder.prefill_calls(), 2);
    assert_eq!(result.segments.len(), 1);
    assert!((result.segments[0].temperature - 0.2).abs() < 1e-6);
}

#[tokio::test]
async fn fallback_attempts_are_bounded() {
    // Every attempt trips the compression gate; the final one is accepted
    // anyway.
    let (transcriber, decoder) = scripted_transcriber(vec![repetitive_script()]);
    let options = DecodingOptions {
        language: Some("en".into()),
        compression_ratio_threshold: Some(1.5),
        temperature_fallback_count: 2,
        temperature_fallback_step: 0.2,
        ..DecodingOptions::default()
    };

    let result = transcriber
        .transcribe(silence(30.0), options, None)
        .await
        .unwrap();

    assert_eq!(decoder.prefill_calls(), 3);
    assert_eq!(result.segments.len(), 1);
    assert!((result.segments[0].temperature - 0.4).abs() < 1e-6);
    assert!(result.segments[0].compression_ratio > 1.5);
}

#[tokio::test]
async fn disabled_gates_accept_the_first_attempt() {
    let (transcriber, decoder) = scripted_transcriber(vec![repetitive_script()]);
    let options = DecodingOptions {
        language: Some("en".into()),
        compression_ratio_threshold: None,
        logprob_threshold: None,
        first_token_logprob_threshold: None,
        no_speech_threshold: None,
        ..DecodingOptions::default()
    };

    let result = transcriber
        .transcribe(silence(30.0), options, None)
        .await
        .unwrap();
    assert_eq!(decoder.prefill_calls(), 1);
    assert_eq!(result.segments.len(), 1);
    assert_eq!(result.segments[0].temperature, 0.0);
}
