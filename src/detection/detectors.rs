//! Built-in detectors. Each one thresholds a band-limited feature of the
//! channel and returns candidate events; hypnogram gating is skipped while
//! the hypnogram is still unscored (all Wake).

use serde::{Deserialize, Serialize};

use super::{DetectorOutput, mask_runs};
use crate::error::{Result, SleepError};
use crate::iir::{self, FilterBand, FilterMethod};
use crate::spectral::{band_power, hilbert_envelope};

const N1: i32 = 1;
const N2: i32 = 2;
const N3: i32 = 3;
const REM: i32 = 4;
const WAKE: i32 = 0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpindleParams {
    /// Envelope threshold in standard deviations above the mean.
    pub threshold: f64,
    pub fmin: f64,
    pub fmax: f64,
    pub tmin: f64,
    pub tmax: f64,
    /// Runs closer than this (seconds) are merged.
    pub min_gap: f64,
    pub nrem_only: bool,
}

impl Default for SpindleParams {
    fn default() -> Self {
        Self {
            threshold: 3.0,
            fmin: 12.0,
            fmax: 14.0,
            tmin: 0.5,
            tmax: 2.0,
            min_gap: 0.5,
            nrem_only: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KComplexParams {
    /// Negative deflection, in µV, the delta band must reach.
    pub amplitude: f64,
    pub tmin: f64,
    pub tmax: f64,
    pub nrem_only: bool,
}

impl Default for KComplexParams {
    fn default() -> Self {
        Self {
            amplitude: 75.0,
            tmin: 0.5,
            tmax: 1.5,
            nrem_only: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlowWaveParams {
    /// Minimum delta / broadband power ratio.
    pub threshold: f64,
    /// Minimum peak-to-peak amplitude, µV.
    pub amplitude: f64,
    /// Length of the analysis blocks, seconds.
    pub window: f64,
}

impl Default for SlowWaveParams {
    fn default() -> Self {
        Self {
            threshold: 0.75,
            amplitude: 75.0,
            window: 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemParams {
    /// Derivative threshold in standard deviations.
    pub threshold: f64,
    pub tmin: f64,
    pub min_gap: f64,
    pub rem_only: bool,
}

impl Default for RemParams {
    fn default() -> Self {
        Self {
            threshold: 2.5,
            tmin: 0.1,
            min_gap: 0.1,
            rem_only: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MuscleTwitchParams {
    pub threshold: f64,
    /// High-pass corner of the EMG band.
    pub fmin: f64,
    pub tmin: f64,
    pub tmax: f64,
    pub rem_only: bool,
}

impl Default for MuscleTwitchParams {
    fn default() -> Self {
        Self {
            threshold: 3.0,
            fmin: 10.0,
            tmin: 0.02,
            tmax: 0.25,
            rem_only: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeakKind {
    Max,
    Min,
    Both,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeakParams {
    /// Seconds to look ahead before confirming an extremum.
    pub lookahead: f64,
    /// Minimum drop after a peak, µV.
    pub delta: f64,
    pub kind: PeakKind,
}

impl Default for PeakParams {
    fn default() -> Self {
        Self {
            lookahead: 0.2,
            delta: 0.0,
            kind: PeakKind::Max,
        }
    }
}

/// Parameters of every built-in detector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorParams {
    pub spindles: SpindleParams,
    pub kcomplexes: KComplexParams,
    pub slow_waves: SlowWaveParams,
    pub rems: RemParams,
    pub muscle_twitches: MuscleTwitchParams,
    pub peaks: PeakParams,
}

fn filtered(x: &[f32], sf: f64, band: FilterBand, fstart: f64, fend: f64) -> Result<Vec<f32>> {
    let sos = iir::design(FilterMethod::Butterworth, band, 3, fstart, fend, sf)?;
    let mut y = x.to_vec();
    if !iir::filtfilt(&sos, &mut y) {
        return Err(SleepError::InvalidArgument(format!(
            "{} samples are too few to filter",
            x.len()
        )));
    }
    Ok(y)
}

fn mean_std(x: &[f32]) -> (f64, f64) {
    if x.is_empty() {
        return (0.0, 0.0);
    }
    let n = x.len() as f64;
    let mean = x.iter().map(|&v| f64::from(v)).sum::<f64>() / n;
    let var = x.iter().map(|&v| (f64::from(v) - mean).powi(2)).sum::<f64>() / n;
    (mean, var.sqrt())
}

fn merge_close(events: Vec<[usize; 2]>, gap: usize) -> Vec<[usize; 2]> {
    let mut merged: Vec<[usize; 2]> = Vec::with_capacity(events.len());
    for e in events {
        match merged.last_mut() {
            Some(last) if e[0] <= last[1] + gap => last[1] = last[1].max(e[1]),
            _ => merged.push(e),
        }
    }
    merged
}

fn keep_durations(events: Vec<[usize; 2]>, sf: f64, tmin: f64, tmax: f64) -> Vec<[usize; 2]> {
    events
        .into_iter()
        .filter(|e| {
            let d = (e[1] - e[0] + 1) as f64 / sf;
            d >= tmin && d <= tmax
        })
        .collect()
}

fn is_scored(hypno: &[i32]) -> bool {
    hypno.iter().any(|&v| v != WAKE)
}

/// Keeps events starting in one of `allowed` stages, unless the hypnogram is unscored.
fn gate(events: Vec<[usize; 2]>, hypno: &[i32], allowed: &[i32]) -> Vec<[usize; 2]> {
    if !is_scored(hypno) {
        return events;
    }
    events
        .into_iter()
        .filter(|e| hypno.get(e[0]).is_some_and(|s| allowed.contains(s)))
        .collect()
}

fn seconds(s: f64, sf: f64) -> usize {
    (s * sf).round().max(0.0) as usize
}

pub fn spindles(x: &[f32], sf: f64, _time: &[f64], hypno: &[i32], p: &SpindleParams) -> Result<DetectorOutput> {
    let sigma = filtered(x, sf, FilterBand::Bandpass, p.fmin, p.fmax)?;
    let envelope = hilbert_envelope(&sigma);
    let (mean, std) = mean_std(&envelope);
    let thr = mean + p.threshold * std;
    let mask: Vec<bool> = envelope.iter().map(|&v| f64::from(v) > thr).collect();
    let mut events = merge_close(mask_runs(&mask), seconds(p.min_gap, sf));
    events = keep_durations(events, sf, p.tmin, p.tmax);
    if p.nrem_only {
        events = gate(events, hypno, &[N1, N2, N3]);
    }
    log::debug!("spindles: {} events above {thr:.2} µV", events.len());
    Ok(DetectorOutput::Intervals(events))
}

pub fn kcomplexes(x: &[f32], sf: f64, _time: &[f64], hypno: &[i32], p: &KComplexParams) -> Result<DetectorOutput> {
    let delta = filtered(x, sf, FilterBand::Bandpass, 0.5, 4.0)?;
    let troughs = mask_runs(
        &delta
            .iter()
            .map(|&v| f64::from(v) < -p.amplitude)
            .collect::<Vec<_>>(),
    );
    // widen each trough to the surrounding zero crossings
    let mut events: Vec<[usize; 2]> = troughs
        .into_iter()
        .map(|[s, e]| {
            let start = delta[..s].iter().rposition(|&v| v >= 0.0).map_or(0, |i| i + 1);
            let end = delta[e..]
                .iter()
                .position(|&v| v >= 0.0)
                .map_or(delta.len() - 1, |i| e + i - 1);
            [start, end]
        })
        .collect();
    events.dedup();
    events = keep_durations(events, sf, p.tmin, p.tmax);
    if p.nrem_only {
        events = gate(events, hypno, &[N2, N3]);
    }
    Ok(DetectorOutput::Intervals(events))
}

pub fn slow_waves(x: &[f32], sf: f64, _time: &[f64], hypno: &[i32], p: &SlowWaveParams) -> Result<DetectorOutput> {
    let block = seconds(p.window, sf).max(2);
    let broadband_hi = (sf / 2.0 - 0.5).min(30.0);
    let mut mask = vec![false; x.len()];
    for (k, chunk) in x.chunks(block).enumerate() {
        if chunk.len() < block {
            break;
        }
        let stage = hypno.get(k * block).copied().unwrap_or(WAKE);
        if is_scored(hypno) && stage == REM {
            continue;
        }
        let delta = band_power(chunk, sf, 0.5, 4.0);
        let total = band_power(chunk, sf, 0.5, broadband_hi);
        let (lo, hi) = chunk
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        if total > 0.0 && delta / total >= p.threshold && f64::from(hi - lo) >= p.amplitude {
            mask[k * block..(k + 1) * block].fill(true);
        }
    }
    Ok(DetectorOutput::Mask(mask))
}

pub fn rems(x: &[f32], sf: f64, _time: &[f64], hypno: &[i32], p: &RemParams) -> Result<DetectorOutput> {
    if x.len() < 2 {
        return Ok(DetectorOutput::Intervals(Vec::new()));
    }
    let eog = filtered(x, sf, FilterBand::Lowpass, 0.0, 5.0_f64.min(sf / 2.0 - 0.1))?;
    let mut deriv: Vec<f32> = eog.windows(2).map(|w| (w[1] - w[0]).abs()).collect();
    deriv.push(0.0);
    let (mean, std) = mean_std(&deriv);
    let thr = mean + p.threshold * std;
    let mask: Vec<bool> = deriv.iter().map(|&v| f64::from(v) > thr).collect();
    let mut events = merge_close(mask_runs(&mask), seconds(p.min_gap, sf));
    events = keep_durations(events, sf, p.tmin, f64::INFINITY);
    if p.rem_only {
        events = gate(events, hypno, &[REM, WAKE]);
    }
    Ok(DetectorOutput::Intervals(events))
}

pub fn muscle_twitches(
    x: &[f32],
    sf: f64,
    _time: &[f64],
    hypno: &[i32],
    p: &MuscleTwitchParams,
) -> Result<DetectorOutput> {
    let emg = filtered(x, sf, FilterBand::Highpass, p.fmin, 0.0)?;
    let envelope = hilbert_envelope(&emg);
    let (mean, std) = mean_std(&envelope);
    let thr = mean + p.threshold * std;
    let mask: Vec<bool> = envelope.iter().map(|&v| f64::from(v) > thr).collect();
    let mut events = keep_durations(mask_runs(&mask), sf, p.tmin, p.tmax);
    if p.rem_only {
        events = gate(events, hypno, &[REM]);
    }
    Ok(DetectorOutput::Intervals(events))
}

/// Local extrema confirmed by `lookahead` and `delta`, as point events.
pub fn peaks(x: &[f32], sf: f64, _time: &[f64], _hypno: &[i32], p: &PeakParams) -> Result<DetectorOutput> {
    let lookahead = seconds(p.lookahead, sf).max(1);
    let delta = p.delta as f32;
    let mut events = Vec::new();
    let (mut mx, mut mn) = (f32::NEG_INFINITY, f32::INFINITY);
    let (mut mx_pos, mut mn_pos) = (0, 0);
    // true while hunting for a maximum
    let mut hunting_max = true;
    let limit = x.len().saturating_sub(lookahead);
    for i in 0..limit {
        let v = x[i];
        if v > mx {
            mx = v;
            mx_pos = i;
        }
        if v < mn {
            mn = v;
            mn_pos = i;
        }
        let ahead = &x[i + 1..i + 1 + lookahead];
        if hunting_max && v < mx - delta && mx.is_finite() {
            if ahead.iter().all(|&a| a < mx) {
                if p.kind != PeakKind::Min {
                    events.push([mx_pos, mx_pos]);
                }
                hunting_max = false;
                mx = v;
                mn = v;
                mn_pos = i;
            }
        } else if !hunting_max && v > mn + delta && mn.is_finite() && ahead.iter().all(|&a| a > mn) {
            if p.kind != PeakKind::Max {
                events.push([mn_pos, mn_pos]);
            }
            hunting_max = true;
            mx = v;
            mn = v;
            mx_pos = i;
        }
    }
    events.sort_unstable();
    events.dedup();
    Ok(DetectorOutput::Intervals(events))
}

#[cfg(test)]
mod tests {
    use std::f64::consts::PI;

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;
    use crate::detection::normalize;

    const SF: f64 = 100.0;

    fn noise(n: usize, amp: f64, seed: u64) -> Vec<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n).map(|_| rng.gen_range(-amp..amp) as f32).collect()
    }

    fn add_burst(x: &mut [f32], f: f64, start_s: f64, dur_s: f64, amp: f64) {
        let (s, e) = ((start_s * SF) as usize, ((start_s + dur_s) * SF) as usize);
        for (i, v) in x[s..e].iter_mut().enumerate() {
            *v += (amp * (2.0 * PI * f * i as f64 / SF).sin()) as f32;
        }
    }

    fn centre_in(events: &[[usize; 2]], lo_s: f64, hi_s: f64) -> bool {
        events.iter().any(|e| {
            let c = (e[0] + e[1]) as f64 / 2.0 / SF;
            c >= lo_s && c <= hi_s
        })
    }

    fn intervals(out: DetectorOutput, n: usize) -> Vec<[usize; 2]> {
        normalize(out, n).unwrap()
    }

    #[test]
    fn spindle_burst_is_found() {
        let n = 60 * SF as usize;
        let mut x = noise(n, 5.0, 1);
        add_burst(&mut x, 13.0, 20.0, 1.0, 40.0);
        let hypno = vec![0; n];
        let out = spindles(&x, SF, &[], &hypno, &SpindleParams::default()).unwrap();
        let events = intervals(out, n);
        assert!(centre_in(&events, 20.0, 21.0), "{events:?}");
        assert!(events.len() <= 2);
    }

    #[test]
    fn spindles_are_gated_to_nrem() {
        let n = 60 * SF as usize;
        let mut x = noise(n, 5.0, 2);
        add_burst(&mut x, 13.0, 20.0, 1.0, 40.0);
        let hypno = vec![REM; n];
        let out = spindles(&x, SF, &[], &hypno, &SpindleParams::default()).unwrap();
        assert!(intervals(out, n).is_empty());
    }

    #[test]
    fn slow_wave_blocks_are_masked() {
        let n = 40 * SF as usize;
        let mut x = noise(n, 2.0, 3);
        add_burst(&mut x, 1.0, 10.0, 4.0, 100.0);
        let out = slow_waves(&x, SF, &[], &vec![0; n], &SlowWaveParams::default()).unwrap();
        let DetectorOutput::Mask(mask) = &out else {
            panic!("slow waves answer with a mask");
        };
        assert!(mask[(11.0 * SF) as usize]);
        assert!(!mask[(30.0 * SF) as usize]);
    }

    #[test]
    fn kcomplex_needs_a_deep_trough() {
        let n = 30 * SF as usize;
        let mut x = noise(n, 2.0, 4);
        // one negative half-wave of 1 s at 0.5 Hz
        let s = 10 * SF as usize;
        for i in 0..SF as usize {
            x[s + i] -= (200.0 * (PI * i as f64 / SF).sin()) as f32;
        }
        let out = kcomplexes(&x, SF, &[], &vec![0; n], &KComplexParams::default()).unwrap();
        let events = intervals(out, n);
        assert!(centre_in(&events, 10.0, 11.0), "{events:?}");
    }

    #[test]
    fn rem_saccade_and_twitch() {
        let n = 60 * SF as usize;
        let mut eog = noise(n, 1.0, 5);
        for v in &mut eog[(30.0 * SF) as usize..] {
            *v += 200.0;
        }
        let params = RemParams {
            tmin: 0.05,
            ..Default::default()
        };
        let out = rems(&eog, SF, &[], &vec![0; n], &params).unwrap();
        assert!(centre_in(&intervals(out, n), 29.5, 30.5));

        let mut emg = noise(n, 1.0, 6);
        add_burst(&mut emg, 30.0, 40.0, 0.1, 50.0);
        let out = muscle_twitches(&emg, SF, &[], &vec![0; n], &MuscleTwitchParams::default()).unwrap();
        assert!(centre_in(&intervals(out, n), 39.9, 40.2));
    }

    #[test]
    fn peaks_of_a_sine() {
        let n = 1000;
        let x: Vec<f32> = (0..n)
            .map(|i| (2.0 * PI * i as f64 / SF).sin() as f32)
            .collect();
        let out = peaks(&x, SF, &[], &[], &PeakParams::default()).unwrap();
        let events = intervals(out, n);
        // maxima at 0.25 s + k
        assert_eq!(events.len(), 10);
        assert_eq!(events[0], [25, 25]);
        assert!(events.iter().all(|e| e[0] % 100 == 25));
    }

    #[test]
    fn short_signal_is_a_detector_error() {
        let x = vec![0.0f32; 5];
        assert!(spindles(&x, SF, &[], &[0; 5], &SpindleParams::default()).is_err());
    }
}
