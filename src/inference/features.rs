use std::f64::consts::PI;

use crate::inference::error::{Result, TranscribeError};
use crate::inference::{HOP_LENGTH, N_FFT, N_FRAMES, N_SAMPLES_PER_WINDOW};

/// Dense log-mel spectrogram, row-major `[n_mels, n_frames]`.
#[derive(Debug, Clone)]
pub struct MelSpectrogram {
    pub n_mels: usize,
    pub n_frames: usize,
    pub data: Vec<f32>,
}

impl MelSpectrogram {
    pub fn get(&self, mel: usize, frame: usize) -> f32 {
        self.data[mel * self.n_frames + frame]
    }
}

/// PCM → log-mel seam. One full 30 s window in, one spectrogram out;
/// shorter windows are zero-padded by the caller.
pub trait FeatureExtractor: Send + Sync {
    fn log_mel_spectrogram(&self, samples: &[f32]) -> Result<MelSpectrogram>;
    fn n_mels(&self) -> usize;
}

/// CPU reference implementation of the Whisper mel front end: Hann-windowed
/// STFT with reflect padding, fixed mel filterbank, log10 with an 8 dB
/// dynamic-range floor, rescaled to roughly [-1.5, 1.5].
pub struct LogMelExtractor {
    n_mels: usize,
    /// `[n_mels, N_FFT / 2 + 1]`, row-major.
    filters: Vec<f32>,
    window: Vec<f32>,
}

impl LogMelExtractor {
    pub fn new(n_mels: usize, filters: Vec<f32>) -> Result<Self> {
        let n_bins = N_FFT / 2 + 1;
        if filters.len() != n_mels * n_bins {
            return Err(TranscribeError::ModelUnavailable(format!(
                "mel filterbank has {} coefficients, expected {} ({n_mels} x {n_bins})",
                filters.len(),
                n_mels * n_bins
            )));
        }
        // Periodic Hann window, matching the torch.hann_window default.
        let window = (0..N_FFT)
            .map(|i| (0.5 * (1.0 - f64::cos(2.0 * PI * i as f64 / N_FFT as f64))) as f32)
            .collect();
        Ok(Self {
            n_mels,
            filters,
            window,
        })
    }
}

impl FeatureExtractor for LogMelExtractor {
    #[tracing::instrument(level = "debug", skip(self, samples))]
    fn log_mel_spectrogram(&self, samples: &[f32]) -> Result<MelSpectrogram> {
        if samples.len() != N_SAMPLES_PER_WINDOW {
            return Err(TranscribeError::FeatureExtractionFailed(format!(
                "expected {} samples per window, got {}",
                N_SAMPLES_PER_WINDOW,
                samples.len()
            )));
        }

        // Reflect-pad by n_fft/2 on both sides so frame centers line up
        // with sample positions.
        let half = N_FFT / 2;
        let mut padded = Vec::with_capacity(samples.len() + N_FFT);
        padded.extend((1..=half).rev().map(|i| samples[i]));
        padded.extend_from_slice(samples);
        padded.extend((0..half).map(|i| samples[samples.len() - 2 - i]));

        let n_bins = N_FFT / 2 + 1;
        let mut power = vec![0f32; n_bins];
        let mut windowed = vec![0f32; N_FFT];
        let mut mel = vec![0f32; self.n_mels * N_FRAMES];

        for frame in 0..N_FRAMES {
            let offset = frame * HOP_LENGTH;
            for (i, value) in windowed.iter_mut().enumerate() {
                *value = padded[offset + i] * self.window[i];
            }
            let spectrum = fft(&windowed);
            for (bin, value) in power.iter_mut().enumerate() {
                let re = spectrum[2 * bin];
                let im = spectrum[2 * bin + 1];
                *value = re * re + im * im;
            }
            for m in 0..self.n_mels {
                let row = &self.filters[m * n_bins..(m + 1) * n_bins];
                let mut acc = 0f32;
                for (weight, p) in row.iter().zip(power.iter()) {
                    acc += weight * p;
                }
                mel[m * N_FRAMES + frame] = acc.max(1e-10).log10();
            }
        }

        let max = mel.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let floor = max - 8.0;
        for value in &mut mel {
            *value = (value.max(floor) + 4.0) / 4.0;
        }

        Ok(MelSpectrogram {
            n_mels: self.n_mels,
            n_frames: N_FRAMES,
            data: mel,
        })
    }

    fn n_mels(&self) -> usize {
        self.n_mels
    }
}

/// Radix-2 decimation-in-time FFT with a naive DFT base case for odd
/// lengths. Input is real; output is interleaved re/im pairs.
fn fft(input: &[f32]) -> Vec<f32> {
    let n = input.len();
    if n == 1 {
        return vec![input[0], 0.0];
    }
    if n % 2 == 1 {
        return dft(input);
    }

    let even: Vec<f32> = input.iter().step_by(2).copied().collect();
    let odd: Vec<f32> = input.iter().skip(1).step_by(2).copied().collect();
    let even_fft = fft(&even);
    let odd_fft = fft(&odd);

    let mut output = vec![0f32; 2 * n];
    for k in 0..n / 2 {
        let theta = -2.0 * PI * k as f64 / n as f64;
        let (sin, cos) = theta.sin_cos();
        let re = cos as f32 * odd_fft[2 * k] - sin as f32 * odd_fft[2 * k + 1];
        let im = cos as f32 * odd_fft[2 * k + 1] + sin as f32 * odd_fft[2 * k];
        output[2 * k] = even_fft[2 * k] + re;
        output[2 * k + 1] = even_fft[2 * k + 1] + im;
        output[2 * (k + n / 2)] = even_fft[2 * k] - re;
        output[2 * (k + n / 2) + 1] = even_fft[2 * k + 1] - im;
    }
    output
}

fn dft(input: &[f32]) -> Vec<f32> {
    let n = input.len();
    let mut output = Vec::with_capacity(2 * n);
    for k in 0..n {
        let mut re = 0f64;
        let mut im = 0f64;
        for (j, &x) in input.iter().enumerate() {
            let theta = -2.0 * PI * (k * j) as f64 / n as f64;
            re += x as f64 * theta.cos();
            im += x as f64 * theta.sin();
        }
        output.push(re as f32);
        output.push(im as f32);
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_filters(n_mels: usize) -> Vec<f32> {
        vec![1.0 / (N_FFT / 2 + 1) as f32; n_mels * (N_FFT / 2 + 1)]
    }

    #[test]
    fn rejects_wrong_length() {
        let extractor = LogMelExtractor::new(2, flat_filters(2)).unwrap();
        let err = extractor.log_mel_spectrogram(&[0.0; 100]).unwrap_err();
        assert!(matches!(err, TranscribeError::FeatureExtractionFailed(_)));
    }

    #[test]
    fn silence_maps_to_constant_floor() {
        let extractor = LogMelExtractor::new(2, flat_filters(2)).unwrap();
        let mel = extractor
            .log_mel_spectrogram(&vec![0.0; N_SAMPLES_PER_WINDOW])
            .unwrap();
        assert_eq!(mel.n_frames, N_FRAMES);
        assert_eq!(mel.data.len(), 2 * N_FRAMES);
        // Zero power clamps to 1e-10, log10 gives -10, rescale gives -1.5.
        for &value in &mel.data {
            assert!((value + 1.5).abs() < 1e-5);
        }
    }

    #[test]
    fn tone_raises_energy_above_floor() {
        let extractor = LogMelExtractor::new(4, flat_filters(4)).unwrap();
        let samples: Vec<f32> = (0..N_SAMPLES_PER_WINDOW)
            .map(|i| (2.0 * std::f32::consts::PI * 440.0 * i as f32 / 16000.0).sin() * 0.5)
            .collect();
        let mel = extractor.log_mel_spectrogram(&samples).unwrap();
        let max = mel.data.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let min = mel.data.iter().copied().fold(f32::INFINITY, f32::min);
        assert!(max > min, "a pure tone must not produce a flat spectrogram");
        // The dynamic-range clamp keeps everything within 8 dB of the peak.
        assert!(max - min <= 8.0 / 4.0 + 1e-5);
    }

    #[test]
    fn fft_matches_dft_on_even_sizes() {
        let input: Vec<f32> = (0..8).map(|i| (i as f32 * 0.7).sin()).collect();
        let a = fft(&input);
        let b = dft(&input);
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < 1e-3, "{x} vs {y}");
        }
    }
}
