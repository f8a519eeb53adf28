//! FFT helpers used by the detectors and the spectrogram pane.

use std::f64::consts::PI;

use ndarray::Array2;
use rustfft::FftPlanner;
use rustfft::num_complex::Complex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SleepError};

/// Magnitude of the analytic signal.
pub fn hilbert_envelope(x: &[f32]) -> Vec<f32> {
    let n = x.len();
    if n == 0 {
        return Vec::new();
    }
    let mut planner = FftPlanner::<f64>::new();
    let forward = planner.plan_fft_forward(n);
    let inverse = planner.plan_fft_inverse(n);

    let mut buffer: Vec<Complex<f64>> = x.iter().map(|&v| Complex::new(f64::from(v), 0.0)).collect();
    forward.process(&mut buffer);
    // keep DC (and Nyquist for even n), double positive, zero negative frequencies
    let half = n.div_ceil(2);
    for (k, c) in buffer.iter_mut().enumerate() {
        if k == 0 || (n % 2 == 0 && k == n / 2) {
            continue;
        }
        if k < half {
            *c *= 2.0;
        } else {
            *c = Complex::new(0.0, 0.0);
        }
    }
    inverse.process(&mut buffer);
    let scale = 1.0 / n as f64;
    buffer.iter().map(|c| (c.norm() * scale) as f32).collect()
}

fn hann(n: usize) -> Vec<f64> {
    if n < 2 {
        return vec![1.0; n];
    }
    (0..n)
        .map(|i| 0.5 - 0.5 * (2.0 * PI * i as f64 / n as f64).cos())
        .collect()
}

/// One-sided power spectral density of `x` (Hann window), with its frequencies.
pub fn periodogram(x: &[f32], sf: f64) -> (Vec<f64>, Vec<f64>) {
    let n = x.len();
    if n == 0 {
        return (Vec::new(), Vec::new());
    }
    let window = hann(n);
    let mean = x.iter().map(|&v| f64::from(v)).sum::<f64>() / n as f64;
    let mut buffer: Vec<Complex<f64>> = x
        .iter()
        .zip(&window)
        .map(|(&v, w)| Complex::new((f64::from(v) - mean) * w, 0.0))
        .collect();
    FftPlanner::<f64>::new().plan_fft_forward(n).process(&mut buffer);
    let norm = sf * window.iter().map(|w| w * w).sum::<f64>();
    let n_freqs = n / 2 + 1;
    let freqs = (0..n_freqs).map(|k| k as f64 * sf / n as f64).collect();
    let psd = buffer[..n_freqs]
        .iter()
        .enumerate()
        .map(|(k, c)| {
            let one_sided = if k == 0 || (n % 2 == 0 && k == n / 2) { 1.0 } else { 2.0 };
            one_sided * c.norm_sqr() / norm
        })
        .collect();
    (freqs, psd)
}

/// Integrated power between `lo` and `hi` Hz.
pub fn band_power(x: &[f32], sf: f64, lo: f64, hi: f64) -> f64 {
    let (freqs, psd) = periodogram(x, sf);
    let df = freqs.get(1).copied().unwrap_or(0.0);
    freqs
        .iter()
        .zip(&psd)
        .filter(|(f, _)| **f >= lo && **f <= hi)
        .map(|(_, p)| p * df)
        .sum()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpectrogramSettings {
    pub channel: usize,
    /// FFT length in seconds.
    pub nfft_s: f64,
    /// Overlap between consecutive segments, in seconds.
    pub overlap_s: f64,
    pub fstart: f64,
    pub fend: f64,
    pub cmap: String,
    pub visible: bool,
}

impl Default for SpectrogramSettings {
    fn default() -> Self {
        Self {
            channel: 0,
            nfft_s: 30.0,
            overlap_s: 0.0,
            fstart: 0.5,
            fend: 20.0,
            cmap: "rainbow".to_owned(),
            visible: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Spectrogram {
    pub freqs: Vec<f64>,
    /// Segment centres, in seconds.
    pub times: Vec<f64>,
    /// `(n_freqs, n_segments)` power in dB.
    pub power_db: Array2<f64>,
}

pub fn spectrogram(x: &[f32], sf: f64, settings: &SpectrogramSettings) -> Result<Spectrogram> {
    let nfft = (settings.nfft_s * sf).round() as usize;
    let overlap = (settings.overlap_s * sf).round() as usize;
    if nfft < 2 || nfft > x.len() {
        return Err(SleepError::OutOfRange {
            what: "spectrogram nfft",
            value: settings.nfft_s,
        });
    }
    if overlap >= nfft {
        return Err(SleepError::OutOfRange {
            what: "spectrogram overlap",
            value: settings.overlap_s,
        });
    }
    if settings.fstart >= settings.fend {
        return Err(SleepError::OutOfRange {
            what: "spectrogram fstart",
            value: settings.fstart,
        });
    }
    let step = nfft - overlap;
    let starts: Vec<usize> = (0..=x.len() - nfft).step_by(step).collect();
    let mut freqs = Vec::new();
    let mut columns = Vec::with_capacity(starts.len());
    for &start in &starts {
        let (f, psd) = periodogram(&x[start..start + nfft], sf);
        let kept: Vec<f64> = f
            .iter()
            .zip(psd)
            .filter(|(f, _)| **f >= settings.fstart && **f <= settings.fend)
            .map(|(_, p)| 10.0 * p.max(1e-20).log10())
            .collect();
        if freqs.is_empty() {
            freqs = f
                .into_iter()
                .filter(|f| *f >= settings.fstart && *f <= settings.fend)
                .collect();
        }
        columns.push(kept);
    }
    let power_db = Array2::from_shape_fn((freqs.len(), columns.len()), |(i, j)| columns[j][i]);
    let times = starts
        .iter()
        .map(|&s| (s as f64 + nfft as f64 / 2.0) / sf)
        .collect();
    Ok(Spectrogram {
        freqs,
        times,
        power_db,
    })
}
