#![warn(clippy::all, rust_2018_idioms)]
//! Sleep scoring core: polysomnographic recording readers, hypnogram model
//! and codecs, preprocessing, window navigation, event detection and the
//! scoring session that ties them together.

mod app;
pub use app::SleepApp;

use std::path::PathBuf;

use chrono::NaiveTime;
use ndarray::Array2;

pub mod annotations;
pub mod bvio;
pub mod config;
pub mod detection;
pub mod edfio;
pub mod elanio;
pub mod error;
pub mod hypno;
pub mod hypnoio;
pub mod iir;
pub mod plot;
pub mod recording;
pub mod reference;
pub mod session;
pub mod signal;
pub mod spectral;
pub mod stages;
pub mod stats;
pub mod trcio;
pub mod window;

pub use error::{Result, SleepError};
pub use hypno::Hypnogram;
pub use recording::{SleepOptions, open};
pub use session::{ScoringSession, SessionEvent};
pub use stages::StageDict;
pub use window::WindowController;

/// Marker embedded in a recording file (EDF+ TAL, BrainVision `.vmrk`).
#[derive(Debug, Clone, PartialEq)]
pub struct FileAnnotation {
    pub start_s: f64,
    pub end_s: f64,
    pub text: String,
}

/// What a format reader hands back before decimation and name cleaning.
#[derive(Debug, Clone)]
pub struct RawRecording {
    pub sf: f64,
    pub data: Array2<f32>,
    pub channels: Vec<String>,
    pub start_time: NaiveTime,
    pub annotations: Vec<FileAnnotation>,
}

#[derive(Debug, Clone)]
pub struct Recording {
    pub path: Option<PathBuf>,
    pub sf_orig: f64,
    pub sf: f64,
    pub dsf: usize,
    /// `(n_channels, n_points)`, microvolts.
    pub data: Array2<f32>,
    pub time: Vec<f64>,
    pub channels: Vec<String>,
    pub start_time: NaiveTime,
    pub n_points_orig: usize,
    pub annotations_from_file: Vec<FileAnnotation>,
}

impl Recording {
    /// Builds a recording from an in-memory matrix already in microvolts.
    pub fn from_array(data: Array2<f32>, sf: f64, channels: Vec<String>) -> Result<Self> {
        if sf <= 0.0 {
            return Err(SleepError::OutOfRange {
                what: "sampling frequency",
                value: sf,
            });
        }
        let n_points = data.ncols();
        let channels = recording::check_channel_names(channels, data.nrows());
        Ok(Self {
            path: None,
            sf_orig: sf,
            sf,
            dsf: 1,
            time: time_vector(n_points, sf),
            data,
            channels,
            start_time: NaiveTime::MIN,
            n_points_orig: n_points,
            annotations_from_file: Vec::new(),
        })
    }

    pub fn n_channels(&self) -> usize {
        self.data.nrows()
    }

    pub fn n_points(&self) -> usize {
        self.data.ncols()
    }

    /// Last time stamp, in seconds.
    pub fn duration(&self) -> f64 {
        self.time.last().copied().unwrap_or(0.0)
    }

    pub fn channel_index(&self, name: &str) -> Option<usize> {
        self.channels.iter().position(|c| c == name)
    }

    /// Index of the sample at or just before `t` seconds.
    pub fn sample_at(&self, t: f64) -> usize {
        let idx = (t * self.sf).round().max(0.0) as usize;
        idx.min(self.n_points().saturating_sub(1))
    }

    /// Wall-clock label for `t` seconds into the recording.
    pub fn absolute_time_label(&self, t: f64) -> String {
        let offset = chrono::Duration::milliseconds((t * 1000.0).round() as i64);
        let (clock, _) = self.start_time.overflowing_add_signed(offset);
        clock.format("%H:%M:%S").to_string()
    }
}

pub fn time_vector(n_points: usize, sf: f64) -> Vec<f64> {
    (0..n_points).map(|i| i as f64 / sf).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_from_array_builds_timebase() {
        let data = Array2::<f32>::zeros((2, 500));
        let rec = Recording::from_array(data, 100.0, vec!["Cz".into(), "Pz".into()]).unwrap();
        assert_eq!(rec.time.len(), 500);
        assert_eq!(rec.time[0], 0.0);
        assert!((rec.duration() - 4.99).abs() < 1e-9);
        assert_eq!(rec.sample_at(1.0), 100);
        assert_eq!(rec.sample_at(99.0), 499);
        assert_eq!(rec.channel_index("Pz"), Some(1));
    }

    #[test]
    fn absolute_time_wraps_past_midnight() {
        let mut rec = Recording::from_array(Array2::zeros((1, 10)), 1.0, vec!["Cz".into()]).unwrap();
        rec.start_time = NaiveTime::from_hms_opt(23, 59, 0).unwrap();
        assert_eq!(rec.absolute_time_label(90.0), "00:00:30");
    }
}
