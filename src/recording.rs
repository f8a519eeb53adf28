use std::collections::HashSet;
use std::path::{Path, PathBuf};

use ndarray::{Array2, Axis, s};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SleepError};
use crate::stages::{StageDict, validate_href};
use crate::{RawRecording, Recording, bvio, edfio, elanio, time_vector, trcio};

/// Process-lifetime options applied when a recording is opened.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SleepOptions {
    /// Target sampling rate; the matrix is decimated by an integer stride.
    pub downsample: Option<f64>,
    pub use_external: bool,
    pub preload: bool,
    /// Multiply by 1e6 when the mean peak-to-peak looks like volts.
    pub auto_rescale: bool,
    /// Display order of the stage names, top to bottom.
    pub href: Option<Vec<String>>,
    #[serde(skip)]
    pub stages: StageDict,
}

impl Default for SleepOptions {
    fn default() -> Self {
        Self {
            downsample: None,
            use_external: false,
            preload: true,
            auto_rescale: true,
            href: None,
            stages: StageDict::default(),
        }
    }
}

struct ReaderEntry {
    name: &'static str,
    matches: fn(&Path) -> bool,
    read: fn(&Path) -> Result<RawRecording>,
}

const READERS: &[ReaderEntry] = &[
    ReaderEntry {
        name: "EDF",
        matches: edfio::is_edf,
        read: edfio::read_edf,
    },
    ReaderEntry {
        name: "Elan",
        matches: elanio::is_elan,
        read: elanio::read_elan,
    },
    ReaderEntry {
        name: "BrainVision",
        matches: bvio::is_brainvision,
        read: bvio::read_brainvision,
    },
    ReaderEntry {
        name: "Micromed",
        matches: trcio::is_trc,
        read: trcio::read_trc,
    },
];

pub(crate) fn extension(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default()
}

/// Opens a polysomnographic recording, dispatching on the file extension.
pub fn open(path: impl AsRef<Path>, options: &SleepOptions) -> Result<Recording> {
    let path = path.as_ref();
    if let Some(href) = &options.href {
        validate_href(href, &options.stages)?;
    }
    if options.use_external || !options.preload {
        // Lazy loading and third-party readers are handled outside this crate.
        log::warn!(
            "{} requested the external reader (use_external={}, preload={})",
            path.display(),
            options.use_external,
            options.preload
        );
        return Err(SleepError::UnsupportedFormat {
            path: path.to_path_buf(),
        });
    }
    let entry = READERS
        .iter()
        .find(|entry| (entry.matches)(path))
        .ok_or_else(|| SleepError::UnsupportedFormat {
            path: path.to_path_buf(),
        })?;
    log::info!("Loading {} with the {} reader", path.display(), entry.name);
    let raw = (entry.read)(path)?;
    finalize(raw, Some(path.to_path_buf()), options)
}

/// Turns reader output into a session-ready recording.
pub fn finalize(raw: RawRecording, path: Option<PathBuf>, options: &SleepOptions) -> Result<Recording> {
    let RawRecording {
        sf,
        mut data,
        channels,
        start_time,
        annotations,
    } = raw;
    let display = path
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "<memory>".to_owned());
    if sf <= 0.0 || !sf.is_finite() {
        return Err(SleepError::read(
            path.clone().unwrap_or_default(),
            0,
            format!("invalid sampling frequency {sf}"),
        ));
    }
    if data.ncols() == 0 || data.nrows() == 0 {
        return Err(SleepError::read(
            path.clone().unwrap_or_default(),
            0,
            "recording holds no samples",
        ));
    }
    let channels = check_channel_names(channels, data.nrows());

    if options.auto_rescale {
        rescale_if_volts(&mut data, &display);
    }

    let n_points_orig = data.ncols();
    let dsf = decimation_factor(sf, options.downsample);
    let data = decimate(data, dsf);
    let sf_down = sf / dsf as f64;
    log::info!(
        "{display}: {} channels, {} points, sf={sf_down} Hz (dsf={dsf})",
        data.nrows(),
        data.ncols()
    );

    Ok(Recording {
        path,
        sf_orig: sf,
        sf: sf_down,
        dsf,
        time: time_vector(data.ncols(), sf_down),
        data,
        channels,
        start_time,
        n_points_orig,
        annotations_from_file: annotations,
    })
}

pub fn decimation_factor(sf: f64, downsample: Option<f64>) -> usize {
    match downsample {
        Some(target) if target > 0.0 && target < sf => ((sf / target).round() as usize).max(1),
        _ => 1,
    }
}

pub fn decimate(data: Array2<f32>, dsf: usize) -> Array2<f32> {
    if dsf <= 1 {
        return data;
    }
    data.slice(s![.., ..;dsf as isize]).to_owned()
}

/// Mean peak-to-peak below 0.1 means the file is in volts.
fn rescale_if_volts(data: &mut Array2<f32>, display: &str) {
    let ptp: f64 = data
        .axis_iter(Axis(0))
        .map(|row| {
            let (lo, hi) = row
                .iter()
                .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
            f64::from(hi - lo)
        })
        .sum::<f64>()
        / data.nrows() as f64;
    if ptp < 0.1 {
        log::warn!("{display}: mean peak-to-peak is {ptp:e}, assuming volts and rescaling to microvolts");
        data.mapv_inplace(|v| v * 1e6);
    }
}

/// Cleans channel labels; falls back to `chan0..chanN` on a count mismatch.
pub fn check_channel_names(channels: Vec<String>, n_channels: usize) -> Vec<String> {
    if channels.len() != n_channels {
        log::warn!(
            "{} channel names for {} channels, using default names",
            channels.len(),
            n_channels
        );
        return (0..n_channels).map(|i| format!("chan{i}")).collect();
    }
    let mut seen = HashSet::new();
    channels
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let mut cleaned = clean_channel_name(name);
            if cleaned.is_empty() {
                cleaned = format!("chan{i}");
            }
            let mut unique = cleaned.clone();
            let mut k = 1;
            while !seen.insert(unique.clone()) {
                unique = format!("{cleaned}{k}");
                k += 1;
            }
            unique
        })
        .collect()
}

pub fn clean_channel_name(name: &str) -> String {
    let name = name.split('.').next().unwrap_or_default();
    let name = name.split('-').next().unwrap_or_default();
    name.replace("eeg", "")
        .replace("EEG", "")
        .replace("ref", "")
        .trim()
        .to_owned()
}

#[cfg(test)]
mod tests {
    use chrono::NaiveTime;
    use ndarray::Array2;

    use super::*;

    fn raw(sf: f64, n_channels: usize, n_points: usize, scale: f32) -> RawRecording {
        let data = Array2::from_shape_fn((n_channels, n_points), |(c, t)| {
            ((t as f32 * 0.1 + c as f32).sin()) * scale
        });
        RawRecording {
            sf,
            data,
            channels: (0..n_channels).map(|c| format!("EEG C{c}-A1")).collect(),
            start_time: NaiveTime::MIN,
            annotations: Vec::new(),
        }
    }

    #[test]
    fn cleans_channel_names() {
        assert_eq!(clean_channel_name("EEG Fpz-Cz"), "Fpz");
        assert_eq!(clean_channel_name("C3.A2"), "C3");
        assert_eq!(clean_channel_name(" Oz ref "), "Oz");
        assert_eq!(clean_channel_name("eegPz"), "Pz");
    }

    #[test]
    fn duplicate_and_empty_names_stay_unique() {
        let names = check_channel_names(
            vec!["EEG".into(), "C3-A2".into(), "C3-A1".into()],
            3,
        );
        assert_eq!(names, vec!["chan0", "C3", "C31"]);
    }

    #[test]
    fn mismatched_names_fall_back_to_defaults() {
        let names = check_channel_names(vec!["Cz".into()], 3);
        assert_eq!(names, vec!["chan0", "chan1", "chan2"]);
    }

    #[test]
    fn decimation_uses_rounded_integer_stride() {
        assert_eq!(decimation_factor(1000.0, Some(100.0)), 10);
        assert_eq!(decimation_factor(256.0, Some(100.0)), 3);
        assert_eq!(decimation_factor(100.0, Some(200.0)), 1);
        assert_eq!(decimation_factor(100.0, None), 1);
    }

    #[test]
    fn finalize_decimates_and_keeps_original_count() {
        let rec = finalize(raw(1000.0, 2, 10_000, 50.0), None, &SleepOptions {
            downsample: Some(100.0),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(rec.dsf, 10);
        assert_eq!(rec.sf, 100.0);
        assert_eq!(rec.n_points(), 1000);
        assert_eq!(rec.time.len(), 1000);
        assert_eq!(rec.n_points_orig, 10_000);
        assert_eq!(rec.channels, vec!["C0", "C1"]);
    }

    #[test]
    fn volts_are_rescaled_unless_disabled() {
        let rec = finalize(raw(100.0, 1, 500, 1e-5), None, &SleepOptions::default()).unwrap();
        let max = rec.data.iter().cloned().fold(0.0f32, f32::max);
        assert!(max > 5.0, "max {max}");

        let rec = finalize(raw(100.0, 1, 500, 1e-5), None, &SleepOptions {
            auto_rescale: false,
            ..Default::default()
        })
        .unwrap();
        let max = rec.data.iter().cloned().fold(0.0f32, f32::max);
        assert!(max < 1e-4);
    }

    #[test]
    fn unknown_extension_is_unsupported() {
        let err = open("recording.xyz", &SleepOptions::default()).unwrap_err();
        assert!(matches!(err, SleepError::UnsupportedFormat { .. }));
        let err = open("recording.edf", &SleepOptions {
            preload: false,
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, SleepError::UnsupportedFormat { .. }));
    }

    #[test]
    fn bad_href_aborts_open() {
        let err = open("recording.edf", &SleepOptions {
            href: Some(vec!["Wake".into(), "N1".into()]),
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, SleepError::StateDictInvalid(_)));
    }
}
