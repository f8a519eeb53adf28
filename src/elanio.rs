//! Elan `.eeg` binary files described by a `.ent` text header.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveTime;
use ndarray::Array2;

use crate::error::{Result, SleepError};
use crate::recording::extension;
use crate::RawRecording;

/// Trailing channels of every Elan file that hold no signal.
const NON_DATA_CHANNELS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElanVersion {
    /// Big-endian i16 samples.
    V2,
    /// Big-endian i32 samples.
    V3,
}

impl ElanVersion {
    fn width(self) -> usize {
        match self {
            Self::V2 => 2,
            Self::V3 => 4,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EntHeader {
    pub version: ElanVersion,
    pub start_time: NaiveTime,
    pub sf: f64,
    /// Total channel count, non-data channels included.
    pub n_channels: usize,
    pub channels: Vec<String>,
    pub units: Vec<String>,
    pub gains: Vec<f64>,
    /// Per-channel rates, when the header lists them.
    pub rates: Option<Vec<f64>>,
}

/// `file.eeg.ent` is preferred over `file.ent`.
pub fn ent_path(eeg: &Path) -> Option<PathBuf> {
    let mut appended = eeg.as_os_str().to_owned();
    appended.push(".ent");
    let appended = PathBuf::from(appended);
    if appended.exists() {
        return Some(appended);
    }
    let replaced = eeg.with_extension("ent");
    replaced.exists().then_some(replaced)
}

pub fn is_elan(path: &Path) -> bool {
    extension(path) == "eeg" && ent_path(path).is_some()
}

fn parse_start(line: &str) -> NaiveTime {
    if line.trim().eq_ignore_ascii_case("no time") {
        return NaiveTime::MIN;
    }
    line.split_whitespace()
        .filter(|token| token.contains(':'))
        .find_map(|token| {
            let mut parts = token.split(':').map(|p| p.trim().parse::<f64>());
            match (parts.next(), parts.next(), parts.next()) {
                (Some(Ok(h)), Some(Ok(m)), Some(Ok(s))) => {
                    NaiveTime::from_hms_opt(h as u32, m as u32, s as u32)
                }
                _ => None,
            }
        })
        .unwrap_or(NaiveTime::MIN)
}

pub fn read_ent(path: &Path) -> Result<EntHeader> {
    let bytes = fs::read(path)?;
    let content: String = bytes.iter().map(|&b| b as char).collect();
    let lines: Vec<&str> = content.lines().map(str::trim).collect();
    let line = |i: usize| -> Result<&str> {
        lines
            .get(i)
            .copied()
            .ok_or_else(|| SleepError::read(path, i as u64, format!("header ends before line {i}")))
    };
    let number = |i: usize| -> Result<f64> {
        let text = line(i)?;
        text.parse::<f64>()
            .map_err(|_| SleepError::read(path, i as u64, format!("line {i}: '{text}' is not a number")))
    };

    let version = match line(0)? {
        "V2" => ElanVersion::V2,
        "V3" => ElanVersion::V3,
        other => {
            return Err(SleepError::read(path, 0, format!("unknown Elan version '{other}'")));
        }
    };
    let start_time = parse_start(line(4)?);
    let period = number(8)?;
    if period <= 0.0 {
        return Err(SleepError::read(path, 8, "sampling period must be positive"));
    }
    let n_channels = number(9)? as usize;
    if n_channels <= NON_DATA_CHANNELS {
        return Err(SleepError::read(path, 9, format!("{n_channels} channels leaves no data")));
    }
    let n_data = n_channels - NON_DATA_CHANNELS;
    // names, types, units, phys min, phys max, dig min, dig max
    let block = |k: usize, i: usize| 10 + k * n_channels + i;
    let mut channels = Vec::with_capacity(n_data);
    let mut units = Vec::with_capacity(n_data);
    let mut gains = Vec::with_capacity(n_data);
    for i in 0..n_data {
        channels.push(line(block(0, i))?.to_owned());
        units.push(line(block(2, i))?.to_owned());
        let (pmin, pmax) = (number(block(3, i))?, number(block(4, i))?);
        let (dmin, dmax) = (number(block(5, i))?, number(block(6, i))?);
        if dmax == dmin {
            return Err(SleepError::read(
                path,
                block(5, i) as u64,
                format!("channel {} has an empty digital range", channels[i]),
            ));
        }
        gains.push((pmax - pmin) / (dmax - dmin));
    }
    // filter descriptions at block 7, then per-channel rates
    let rates = (0..n_data)
        .map(|i| lines.get(block(8, i)).and_then(|l| l.parse::<f64>().ok()))
        .collect::<Option<Vec<f64>>>();

    Ok(EntHeader {
        version,
        start_time,
        sf: 1.0 / period,
        n_channels,
        channels,
        units,
        gains,
        rates,
    })
}

fn unit_scale(unit: &str) -> f64 {
    match unit {
        "V" => 1e6,
        "mV" => 1e3,
        "nV" => 1e-3,
        _ => 1.0,
    }
}

pub fn read_elan(path: &Path) -> Result<RawRecording> {
    let ent = ent_path(path).ok_or_else(|| SleepError::read(path, 0, "no .ent header next to the data file"))?;
    let header = read_ent(&ent)?;

    let mut kept: Vec<usize> = (0..header.channels.len()).collect();
    if let Some(rates) = &header.rates {
        kept.retain(|&i| {
            let same = (rates[i] - header.sf).abs() < 1e-6;
            if !same {
                log::warn!(
                    "{}: dropping channel '{}' sampled at {} Hz instead of {} Hz",
                    ent.display(),
                    header.channels[i],
                    rates[i],
                    header.sf
                );
            }
            same
        });
    }
    if kept.is_empty() {
        return Err(SleepError::read(&ent, 9, "every channel was dropped"));
    }

    let bytes = fs::read(path)?;
    let width = header.version.width();
    let frame = width * header.n_channels;
    if bytes.len() % frame != 0 {
        return Err(SleepError::read(
            path,
            (bytes.len() - bytes.len() % frame) as u64,
            format!("file size is not a multiple of {} channels", header.n_channels),
        ));
    }
    let n_points = bytes.len() / frame;
    let data = Array2::from_shape_fn((kept.len(), n_points), |(row, t)| {
        let ch = kept[row];
        let offset = t * frame + ch * width;
        let raw = match header.version {
            ElanVersion::V2 => f64::from(i16::from_be_bytes([bytes[offset], bytes[offset + 1]])),
            ElanVersion::V3 => f64::from(i32::from_be_bytes([
                bytes[offset],
                bytes[offset + 1],
                bytes[offset + 2],
                bytes[offset + 3],
            ])),
        };
        (raw * header.gains[ch] * unit_scale(&header.units[ch])) as f32
    });

    Ok(RawRecording {
        sf: header.sf,
        data,
        channels: kept.iter().map(|&i| header.channels[i].clone()).collect(),
        start_time: header.start_time,
        annotations: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    /// Three data channels plus the two trailing non-data ones.
    fn ent_text(version: &str, start: &str, rates: Option<[&str; 3]>) -> String {
        let n = 5;
        let mut lines = vec![
            version.to_owned(),
            "subject".to_owned(),
            "exam".to_owned(),
            "comment".to_owned(),
            start.to_owned(),
            "-1".to_owned(),
            "reserved".to_owned(),
            "-1".to_owned(),
            "0.01".to_owned(),
            n.to_string(),
        ];
        let names = ["Cz", "Pz", "EOG", "Bip1", "Bip2"];
        lines.extend(names.iter().map(|s| s.to_string()));
        lines.extend((0..n).map(|_| "EEG".to_owned()));
        lines.extend((0..n).map(|_| "uV".to_owned()));
        lines.extend((0..n).map(|_| "-100".to_owned()));
        lines.extend((0..n).map(|_| "100".to_owned()));
        lines.extend((0..n).map(|_| "-1000".to_owned()));
        lines.extend((0..n).map(|_| "1000".to_owned()));
        if let Some(rates) = rates {
            lines.extend((0..n).map(|_| "passe-haut 0.1 Hz passe-bas 40 Hz".to_owned()));
            lines.extend(rates.iter().map(|s| s.to_string()));
            lines.extend(["100".to_owned(), "100".to_owned()]);
        }
        lines.join("\n")
    }

    fn write_files(dir: &Path, version: &str, start: &str, rates: Option<[&str; 3]>) -> PathBuf {
        let eeg = dir.join("night.eeg");
        fs::write(dir.join("night.eeg.ent"), ent_text(version, start, rates)).unwrap();
        let mut bytes = Vec::new();
        for t in 0..200i16 {
            for ch in 0..5i16 {
                bytes.extend((t * 10 + ch).to_be_bytes());
            }
        }
        fs::write(&eeg, bytes).unwrap();
        eeg
    }

    #[test]
    fn reads_v2_and_applies_gain() {
        let dir = tempdir().unwrap();
        let eeg = write_files(dir.path(), "V2", "13-Jan-2015 21:35:12", None);
        assert!(is_elan(&eeg));
        let raw = read_elan(&eeg).unwrap();
        assert_eq!(raw.sf, 100.0);
        assert_eq!(raw.data.dim(), (3, 200));
        assert_eq!(raw.channels, vec!["Cz", "Pz", "EOG"]);
        // gain 200 / 2000
        assert!((raw.data[[1, 3]] - 3.1).abs() < 1e-5);
        assert_eq!(raw.start_time, NaiveTime::from_hms_opt(21, 35, 12).unwrap());
    }

    #[test]
    fn no_time_is_midnight() {
        let dir = tempdir().unwrap();
        let eeg = write_files(dir.path(), "V2", "No time", None);
        assert_eq!(read_elan(&eeg).unwrap().start_time, NaiveTime::MIN);
    }

    #[test]
    fn channels_with_another_rate_are_dropped() {
        let dir = tempdir().unwrap();
        let eeg = write_files(dir.path(), "V2", "No time", Some(["100", "50", "100"]));
        let raw = read_elan(&eeg).unwrap();
        assert_eq!(raw.channels, vec!["Cz", "EOG"]);
        assert!((raw.data[[1, 0]] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn unknown_version_is_rejected() {
        let dir = tempdir().unwrap();
        let eeg = write_files(dir.path(), "V9", "No time", None);
        assert!(matches!(read_elan(&eeg).unwrap_err(), SleepError::RecordingRead { .. }));
    }
}
