//! IIR filter design as second-order sections, applied forward-backward.
//!
//! Butterworth designs come straight from `sci-rs`. Bessel designs are built
//! here: analog prototype from the reverse Bessel polynomial (phase
//! normalised), band transform, bilinear transform, then pairing into
//! biquads.

use nalgebra::{Complex, DMatrix};
use sci_rs::signal::filter::design::{
    DigitalFilter, FilterBandType, FilterOutputType, Sos, butter_dyn,
};
use sci_rs::signal::filter::sosfiltfilt_dyn;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SleepError};

pub const MAX_ORDER: usize = 12;

type C64 = Complex<f64>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterBand {
    Bandpass,
    Bandstop,
    Lowpass,
    Highpass,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterMethod {
    Butterworth,
    Bessel,
}

/// Checks the cutoffs for `band` and returns the ones that matter, in Hz.
pub fn cutoffs(band: FilterBand, fstart: f64, fend: f64, sf: f64) -> Result<Vec<f64>> {
    let nyquist = sf / 2.0;
    let check = |what: &'static str, f: f64| {
        if f > 0.0 && f < nyquist {
            Ok(f)
        } else {
            Err(SleepError::OutOfRange { what, value: f })
        }
    };
    match band {
        FilterBand::Lowpass => Ok(vec![check("fend", fend)?]),
        FilterBand::Highpass => Ok(vec![check("fstart", fstart)?]),
        FilterBand::Bandpass | FilterBand::Bandstop => {
            let (lo, hi) = (check("fstart", fstart)?, check("fend", fend)?);
            if lo >= hi {
                return Err(SleepError::OutOfRange {
                    what: "fstart (must be below fend)",
                    value: lo,
                });
            }
            Ok(vec![lo, hi])
        }
    }
}

/// Designs a digital filter at sampling rate `sf`.
pub fn design(
    method: FilterMethod,
    band: FilterBand,
    order: usize,
    fstart: f64,
    fend: f64,
    sf: f64,
) -> Result<Vec<Sos<f64>>> {
    if order == 0 || order > MAX_ORDER {
        return Err(SleepError::OutOfRange {
            what: "filter order",
            value: order as f64,
        });
    }
    let wn = cutoffs(band, fstart, fend, sf)?;
    match method {
        FilterMethod::Butterworth => {
            let btype = match band {
                FilterBand::Bandpass => FilterBandType::Bandpass,
                FilterBand::Bandstop => FilterBandType::Bandstop,
                FilterBand::Lowpass => FilterBandType::Lowpass,
                FilterBand::Highpass => FilterBandType::Highpass,
            };
            let filter = butter_dyn(
                order,
                wn,
                Some(btype),
                Some(false),
                Some(FilterOutputType::Sos),
                Some(sf),
            );
            match filter {
                DigitalFilter::Sos(sos) => Ok(sos.sos),
                _ => Err(SleepError::InvalidArgument(
                    "butterworth design did not return sections".to_owned(),
                )),
            }
        }
        FilterMethod::Bessel => Ok(bessel(order, band, &wn, sf)
            .into_iter()
            .map(|q| Sos::new(q.b, q.a))
            .collect()),
    }
}

/// Zero-phase filtering in place. Signals too short for the edge padding
/// are left untouched.
pub fn filtfilt(sos: &[Sos<f64>], data: &mut [f32]) -> bool {
    let padlen = 3 * (2 * sos.len() + 1);
    if sos.is_empty() || data.len() <= padlen {
        return false;
    }
    let filtered = sosfiltfilt_dyn(data.iter().map(|&v| f64::from(v)), sos);
    for (dst, src) in data.iter_mut().zip(filtered) {
        *dst = src as f32;
    }
    true
}

/// One biquad `b[0] + b[1] z^-1 + b[2] z^-2` over `1 + a[1] z^-1 + a[2] z^-2`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Biquad {
    pub b: [f64; 3],
    pub a: [f64; 3],
}

impl Biquad {
    /// Complex gain at normalised angular frequency `w` (rad/sample).
    #[cfg(test)]
    fn response(&self, w: f64) -> C64 {
        let z1 = C64::new(w.cos(), -w.sin());
        let z2 = z1 * z1;
        let num = C64::new(self.b[0], 0.0) + z1 * self.b[1] + z2 * self.b[2];
        let den = C64::new(self.a[0], 0.0) + z1 * self.a[1] + z2 * self.a[2];
        num / den
    }
}

/// Coefficients of the reverse Bessel polynomial, lowest degree first.
fn reverse_bessel(n: usize) -> Vec<f64> {
    let factorial = |k: usize| (1..=k).map(|i| i as f64).product::<f64>();
    (0..=n)
        .map(|k| factorial(2 * n - k) / (2f64.powi((n - k) as i32) * factorial(k) * factorial(n - k)))
        .collect()
}

/// Roots of a monic polynomial via its companion matrix.
fn poly_roots(coeffs: &[f64]) -> Vec<C64> {
    let n = coeffs.len() - 1;
    let lead = coeffs[n];
    let companion = DMatrix::from_fn(n, n, |i, j| {
        if i == 0 {
            -coeffs[n - 1 - j] / lead
        } else if i == j + 1 {
            1.0
        } else {
            0.0
        }
    });
    companion.complex_eigenvalues().iter().copied().collect()
}

/// Analog prototype poles with unity DC gain and phase normalisation.
fn bessel_prototype(n: usize) -> (Vec<C64>, f64) {
    let coeffs = reverse_bessel(n);
    let scale = coeffs[0].powf(-1.0 / n as f64);
    let poles: Vec<C64> = poly_roots(&coeffs).into_iter().map(|p| p * scale).collect();
    let gain = prod(&poles, |p| -p).re;
    (poles, gain)
}

fn prod(values: &[C64], f: impl Fn(C64) -> C64) -> C64 {
    values.iter().fold(C64::new(1.0, 0.0), |acc, &v| acc * f(v))
}

fn bessel(order: usize, band: FilterBand, wn: &[f64], sf: f64) -> Vec<Biquad> {
    let (poles, gain) = bessel_prototype(order);
    let warp = |f: f64| 2.0 * sf * (std::f64::consts::PI * f / sf).tan();
    let degree = poles.len();
    let (zeros, poles, gain) = match band {
        FilterBand::Lowpass => {
            let wo = warp(wn[0]);
            let poles = poles.iter().map(|&p| p * wo).collect();
            (Vec::new(), poles, gain * wo.powi(degree as i32))
        }
        FilterBand::Highpass => {
            let wo = warp(wn[0]);
            let k = gain * (C64::new(1.0, 0.0) / prod(&poles, |p| -p)).re;
            let poles = poles.iter().map(|&p| C64::new(wo, 0.0) / p).collect();
            (vec![C64::new(0.0, 0.0); degree], poles, k)
        }
        FilterBand::Bandpass => {
            let (w1, w2) = (warp(wn[0]), warp(wn[1]));
            let (wo, bw) = ((w1 * w2).sqrt(), w2 - w1);
            let mut out = Vec::with_capacity(2 * degree);
            for &p in &poles {
                let p_lp = p * (bw / 2.0);
                let root = (p_lp * p_lp - wo * wo).sqrt();
                out.push(p_lp + root);
                out.push(p_lp - root);
            }
            (vec![C64::new(0.0, 0.0); degree], out, gain * bw.powi(degree as i32))
        }
        FilterBand::Bandstop => {
            let (w1, w2) = (warp(wn[0]), warp(wn[1]));
            let (wo, bw) = ((w1 * w2).sqrt(), w2 - w1);
            let k = gain * (C64::new(1.0, 0.0) / prod(&poles, |p| -p)).re;
            let mut out = Vec::with_capacity(2 * degree);
            for &p in &poles {
                let p_hp = C64::new(bw / 2.0, 0.0) / p;
                let root = (p_hp * p_hp - wo * wo).sqrt();
                out.push(p_hp + root);
                out.push(p_hp - root);
            }
            let mut zeros = Vec::with_capacity(2 * degree);
            for _ in 0..degree {
                zeros.push(C64::new(0.0, wo));
                zeros.push(C64::new(0.0, -wo));
            }
            (zeros, out, k)
        }
    };
    let (zeros, poles, gain) = bilinear(&zeros, &poles, gain, sf);
    to_sections(&zeros, &poles, gain)
}

fn bilinear(zeros: &[C64], poles: &[C64], gain: f64, sf: f64) -> (Vec<C64>, Vec<C64>, f64) {
    let fs2 = C64::new(2.0 * sf, 0.0);
    let mut z: Vec<C64> = zeros.iter().map(|&z| (fs2 + z) / (fs2 - z)).collect();
    let p: Vec<C64> = poles.iter().map(|&p| (fs2 + p) / (fs2 - p)).collect();
    z.resize(p.len(), C64::new(-1.0, 0.0));
    let k = gain * (prod(zeros, |z| fs2 - z) / prod(poles, |p| fs2 - p)).re;
    (z, p, k)
}

/// Groups roots into conjugate pairs, then pairs of real roots.
fn pair_roots(roots: &[C64]) -> Vec<(C64, Option<C64>)> {
    const EPS: f64 = 1e-9;
    let mut complex: Vec<C64> = roots.iter().copied().filter(|r| r.im > EPS).collect();
    complex.sort_by(|a, b| b.norm().total_cmp(&a.norm()));
    let mut real: Vec<f64> = roots
        .iter()
        .filter(|r| r.im.abs() <= EPS)
        .map(|r| r.re)
        .collect();
    real.sort_by(f64::total_cmp);

    let mut pairs: Vec<(C64, Option<C64>)> = complex.into_iter().map(|r| (r, Some(r.conj()))).collect();
    for chunk in real.chunks(2) {
        let first = C64::new(chunk[0], 0.0);
        pairs.push((first, chunk.get(1).map(|&r| C64::new(r, 0.0))));
    }
    pairs
}

fn quadratic(pair: (C64, Option<C64>)) -> [f64; 3] {
    match pair {
        (a, Some(b)) => [1.0, -(a + b).re, (a * b).re],
        (a, None) => [1.0, -a.re, 0.0],
    }
}

fn to_sections(zeros: &[C64], poles: &[C64], gain: f64) -> Vec<Biquad> {
    let zero_pairs = pair_roots(zeros);
    let pole_pairs = pair_roots(poles);
    let mut sections: Vec<Biquad> = pole_pairs
        .into_iter()
        .enumerate()
        .map(|(i, p)| Biquad {
            b: zero_pairs.get(i).copied().map_or([1.0, 0.0, 0.0], quadratic),
            a: quadratic(p),
        })
        .collect();
    if let Some(first) = sections.first_mut() {
        for b in &mut first.b {
            *b *= gain;
        }
    }
    sections
}

#[cfg(test)]
mod tests {
    use std::f64::consts::PI;

    use super::*;

    fn gain_at(sections: &[Biquad], f: f64, sf: f64) -> f64 {
        let w = 2.0 * PI * f / sf;
        sections
            .iter()
            .fold(C64::new(1.0, 0.0), |acc, s| acc * s.response(w))
            .norm()
    }

    #[test]
    fn reverse_bessel_coefficients() {
        assert_eq!(reverse_bessel(2), vec![3.0, 3.0, 1.0]);
        assert_eq!(reverse_bessel(3), vec![15.0, 15.0, 6.0, 1.0]);
    }

    #[test]
    fn prototype_is_stable_with_unity_dc() {
        for n in 1..=8 {
            let (poles, gain) = bessel_prototype(n);
            assert_eq!(poles.len(), n);
            assert!(poles.iter().all(|p| p.re < 0.0), "order {n}: {poles:?}");
            let dc = gain / prod(&poles, |p| -p).re;
            assert!((dc - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn bessel_lowpass_passes_dc_and_stops_high() {
        let sf = 200.0;
        let sections = bessel(4, FilterBand::Lowpass, &[10.0], sf);
        assert_eq!(sections.len(), 2);
        assert!((gain_at(&sections, 0.0, sf) - 1.0).abs() < 1e-6);
        assert!(gain_at(&sections, 60.0, sf) < 0.01);
    }

    #[test]
    fn bessel_band_shapes() {
        let sf = 100.0;
        let bp = bessel(3, FilterBand::Bandpass, &[8.0, 14.0], sf);
        assert!(gain_at(&bp, 0.0, sf) < 1e-6);
        assert!(gain_at(&bp, 11.0, sf) > 0.8);
        assert!(gain_at(&bp, 45.0, sf) < 0.05);

        let bs = bessel(3, FilterBand::Bandstop, &[45.0, 49.0], 200.0);
        assert!((gain_at(&bs, 0.0, 200.0) - 1.0).abs() < 1e-6);
        let warped = |f: f64| (PI * f / 200.0).tan();
        let notch = 200.0 / PI * (warped(45.0) * warped(49.0)).sqrt().atan();
        assert!(gain_at(&bs, notch, 200.0) < 1e-6);

        let hp = bessel(2, FilterBand::Highpass, &[1.0], sf);
        assert!(gain_at(&hp, 0.0, sf) < 1e-9);
        assert!((gain_at(&hp, 49.9, sf) - 1.0).abs() < 1e-3);
    }

    #[test]
    fn cutoffs_are_validated() {
        assert!(cutoffs(FilterBand::Bandpass, 12.0, 10.0, 100.0).is_err());
        assert!(cutoffs(FilterBand::Bandpass, 0.0, 10.0, 100.0).is_err());
        assert!(cutoffs(FilterBand::Lowpass, 0.0, 60.0, 100.0).is_err());
        assert_eq!(cutoffs(FilterBand::Lowpass, -5.0, 30.0, 100.0).unwrap(), vec![30.0]);
        assert_eq!(cutoffs(FilterBand::Highpass, 0.5, 500.0, 100.0).unwrap(), vec![0.5]);
        assert!(design(FilterMethod::Bessel, FilterBand::Lowpass, 0, 0.0, 10.0, 100.0).is_err());
    }

    #[test]
    fn filtfilt_leaves_short_signals_alone() {
        let sos = design(FilterMethod::Butterworth, FilterBand::Lowpass, 4, 0.0, 10.0, 100.0).unwrap();
        let mut short = vec![1.0f32; 10];
        assert!(!filtfilt(&sos, &mut short));
        assert!(short.iter().all(|&v| v == 1.0));
    }
}
