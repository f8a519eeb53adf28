//! Semi-automatic event detection.
//!
//! A detector sees one whole channel at a time, `(data, sf, time, hypno)`,
//! and may answer with intervals, a boolean mask or a run of indices. The
//! engine normalises all three to inclusive `[start, end]` sample pairs
//! before they reach the [`DetectionStore`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use ndarray::{Array2, Axis};
use rayon::prelude::*;

use crate::error::{Result, SleepError};

pub mod detectors;
mod store;

pub use detectors::DetectorParams;
pub use store::{DetectionKey, DetectionStore, EventRow};

pub const SPINDLES: &str = "Spindles";
pub const KCOMPLEXES: &str = "K-complexes";
pub const SLOW_WAVES: &str = "Slow waves";
pub const REMS: &str = "REMs";
pub const MUSCLE_TWITCHES: &str = "Muscle twitches";
pub const PEAKS: &str = "Peaks";

/// Event representations a detector may return.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetectorOutput {
    /// `(n_events, 2)` start/end samples, used as is.
    Intervals(Vec<[usize; 2]>),
    /// One flag per sample; each maximal run of `true` is an event.
    Mask(Vec<bool>),
    /// Consecutive indices forming a single event.
    Indices(Vec<usize>),
}

pub type DetectorFn = Arc<dyn Fn(&[f32], f64, &[f64], &[i32]) -> Result<DetectorOutput> + Send + Sync>;

/// Inclusive `[start, end]` of every maximal run of `true`.
pub fn mask_runs(mask: &[bool]) -> Vec<[usize; 2]> {
    let mut events = Vec::new();
    let mut start = None;
    for (i, &on) in mask.iter().enumerate() {
        match (on, start) {
            (true, None) => start = Some(i),
            (false, Some(s)) => {
                events.push([s, i - 1]);
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        events.push([s, mask.len() - 1]);
    }
    events
}

/// Sorted, bounds-checked, non-overlapping intervals.
pub fn normalize(output: DetectorOutput, n_points: usize) -> Result<Vec<[usize; 2]>> {
    let mut events = match output {
        DetectorOutput::Intervals(events) => events,
        DetectorOutput::Mask(mask) => {
            if mask.len() != n_points {
                return Err(SleepError::InvalidArgument(format!(
                    "detection mask has {} samples, expected {n_points}",
                    mask.len()
                )));
            }
            mask_runs(&mask)
        }
        DetectorOutput::Indices(indices) => match (indices.iter().min(), indices.iter().max()) {
            (Some(&lo), Some(&hi)) => vec![[lo, hi]],
            _ => Vec::new(),
        },
    };
    for &[start, end] in &events {
        if start > end || end >= n_points {
            return Err(SleepError::InvalidArgument(format!(
                "event [{start}, {end}] outside [0, {n_points})"
            )));
        }
    }
    events.sort_unstable_by_key(|e| e[0]);
    if let Some(pair) = events.windows(2).find(|w| w[1][0] <= w[0][1]) {
        return Err(SleepError::InvalidArgument(format!(
            "overlapping events [{}, {}] and [{}, {}]",
            pair[0][0], pair[0][1], pair[1][0], pair[1][1]
        )));
    }
    Ok(events)
}

/// Cooperative cancellation flag shared with worker threads.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Method name -> detector function.
#[derive(Clone)]
pub struct DetectorRegistry {
    entries: BTreeMap<String, DetectorFn>,
}

impl Default for DetectorRegistry {
    fn default() -> Self {
        Self::with_builtins(&DetectorParams::default())
    }
}

impl DetectorRegistry {
    pub fn empty() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    pub fn with_builtins(params: &DetectorParams) -> Self {
        let mut registry = Self::empty();
        let p = params.spindles.clone();
        registry.register(SPINDLES, move |x, sf, t, h| detectors::spindles(x, sf, t, h, &p));
        let p = params.kcomplexes.clone();
        registry.register(KCOMPLEXES, move |x, sf, t, h| detectors::kcomplexes(x, sf, t, h, &p));
        let p = params.slow_waves.clone();
        registry.register(SLOW_WAVES, move |x, sf, t, h| detectors::slow_waves(x, sf, t, h, &p));
        let p = params.rems.clone();
        registry.register(REMS, move |x, sf, t, h| detectors::rems(x, sf, t, h, &p));
        let p = params.muscle_twitches.clone();
        registry.register(MUSCLE_TWITCHES, move |x, sf, t, h| {
            detectors::muscle_twitches(x, sf, t, h, &p)
        });
        let p = params.peaks.clone();
        registry.register(PEAKS, move |x, sf, t, h| detectors::peaks(x, sf, t, h, &p));
        registry
    }

    pub fn register<F>(&mut self, method: &str, detector: F)
    where
        F: Fn(&[f32], f64, &[f64], &[i32]) -> Result<DetectorOutput> + Send + Sync + 'static,
    {
        self.entries.insert(method.to_owned(), Arc::new(detector));
    }

    /// Overrides (or adds) the detector used for `method`.
    pub fn replace_detections<F>(&mut self, method: &str, detector: F)
    where
        F: Fn(&[f32], f64, &[f64], &[i32]) -> Result<DetectorOutput> + Send + Sync + 'static,
    {
        if self.entries.contains_key(method) {
            log::info!("Replacing the {method} detector with a user function");
        }
        self.register(method, detector);
    }

    pub fn get(&self, method: &str) -> Option<&DetectorFn> {
        self.entries.get(method)
    }

    pub fn methods(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    /// Runs `method` on one channel and normalises its answer.
    pub fn run(
        &self,
        method: &str,
        channel: &str,
        x: &[f32],
        sf: f64,
        time: &[f64],
        hypno: &[i32],
    ) -> Result<Vec<[usize; 2]>> {
        let detector = self.get(method).ok_or_else(|| SleepError::Detector {
            channel: channel.to_owned(),
            method: method.to_owned(),
            reason: "no detector registered under this name".to_owned(),
        })?;
        detector(x, sf, time, hypno)
            .and_then(|output| normalize(output, x.len()))
            .map_err(|err| match err {
                SleepError::Detector { .. } => err,
                other => SleepError::Detector {
                    channel: channel.to_owned(),
                    method: method.to_owned(),
                    reason: other.to_string(),
                },
            })
    }

    /// Runs `method` on the given rows of `data` in parallel.
    ///
    /// Per-channel failures are returned alongside the successes; a
    /// cancelled run yields [`SleepError::Cancelled`] and nothing else.
    #[expect(clippy::too_many_arguments)]
    pub fn detect_all(
        &self,
        method: &str,
        rows: &[usize],
        data: &Array2<f32>,
        channels: &[String],
        sf: f64,
        time: &[f64],
        hypno: &[i32],
        cancel: &CancelToken,
    ) -> Result<Vec<(usize, Result<Vec<[usize; 2]>>)>> {
        let results: Vec<_> = rows
            .par_iter()
            .map(|&row| {
                if cancel.is_cancelled() {
                    return (row, Err(SleepError::Cancelled));
                }
                let name = channels.get(row).map(String::as_str).unwrap_or("?");
                let x = data.index_axis(Axis(0), row).to_vec();
                (row, self.run(method, name, &x, sf, time, hypno))
            })
            .collect();
        if cancel.is_cancelled() {
            return Err(SleepError::Cancelled);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;

    #[test]
    fn mask_runs_become_events() {
        let mut mask = vec![false; 1000];
        mask[0..100].fill(true);
        mask[200..300].fill(true);
        let events = normalize(DetectorOutput::Mask(mask), 1000).unwrap();
        assert_eq!(events, vec![[0, 99], [200, 299]]);
    }

    #[test]
    fn every_representation_normalises_alike() {
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..200 {
            let n = rng.gen_range(1..400);
            let mask: Vec<bool> = (0..n).map(|_| rng.gen_bool(0.3)).collect();
            let from_mask = normalize(DetectorOutput::Mask(mask.clone()), n).unwrap();
            let n_runs = mask.windows(2).filter(|w| !w[0] && w[1]).count() + usize::from(mask[0]);
            assert_eq!(from_mask.len(), n_runs);

            let mut shuffled = from_mask.clone();
            shuffled.reverse();
            assert_eq!(normalize(DetectorOutput::Intervals(shuffled), n).unwrap(), from_mask);

            for &[start, end] in &from_mask {
                let indices = (start..=end).collect();
                assert_eq!(
                    normalize(DetectorOutput::Indices(indices), n).unwrap(),
                    vec![[start, end]]
                );
            }
        }
    }

    #[test]
    fn bad_outputs_are_rejected() {
        assert!(normalize(DetectorOutput::Mask(vec![true; 10]), 11).is_err());
        assert!(normalize(DetectorOutput::Intervals(vec![[5, 20]]), 10).is_err());
        assert!(normalize(DetectorOutput::Intervals(vec![[0, 5], [5, 8]]), 10).is_err());
        assert!(normalize(DetectorOutput::Indices(Vec::new()), 10).unwrap().is_empty());
    }

    #[test]
    fn failures_carry_channel_and_method() {
        let mut registry = DetectorRegistry::empty();
        registry.register("Custom", |_, _, _, _| {
            Err(SleepError::InvalidArgument("boom".to_owned()))
        });
        let err = registry.run("Custom", "Cz", &[0.0; 4], 1.0, &[0.0; 4], &[0; 4]).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("Cz") && msg.contains("Custom") && msg.contains("boom"), "{msg}");
        assert!(registry.run("Missing", "Cz", &[0.0], 1.0, &[0.0], &[0]).is_err());
    }

    #[test]
    fn replaced_detector_is_used() {
        let mut registry = DetectorRegistry::default();
        assert!(registry.methods().contains(&SPINDLES));
        registry.replace_detections(SPINDLES, |x, _, _, _| {
            Ok(DetectorOutput::Indices((0..x.len()).collect()))
        });
        let events = registry.run(SPINDLES, "Cz", &[1.0; 8], 1.0, &[0.0; 8], &[0; 8]).unwrap();
        assert_eq!(events, vec![[0, 7]]);
    }

    #[test]
    fn detect_all_runs_every_row() {
        let mut registry = DetectorRegistry::empty();
        registry.register("Above", |x, _, _, _| {
            Ok(DetectorOutput::Mask(x.iter().map(|&v| v > 0.5).collect()))
        });
        let data = Array2::from_shape_fn((3, 10), |(c, t)| if t == c { 1.0 } else { 0.0 });
        let channels: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        let time: Vec<f64> = (0..10).map(f64::from).collect();
        let out = registry
            .detect_all("Above", &[0, 2], &data, &channels, 1.0, &time, &[0; 10], &CancelToken::new())
            .unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].0, 2);
        assert_eq!(out[1].1.as_ref().unwrap(), &vec![[2, 2]]);

        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(matches!(
            registry.detect_all("Above", &[0], &data, &channels, 1.0, &time, &[0; 10], &cancel),
            Err(SleepError::Cancelled)
        ));
    }
}
