//! BrainVision `.vhdr` / `.eeg` / `.vmrk` triplets.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveTime;
use ndarray::Array2;

use crate::error::{Result, SleepError};
use crate::recording::extension;
use crate::{FileAnnotation, RawRecording};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryFormat {
    Int16,
    Int32,
    Float32,
}

impl BinaryFormat {
    fn parse(text: &str) -> Option<Self> {
        match text.trim().to_ascii_uppercase().as_str() {
            "INT_16" => Some(Self::Int16),
            "INT_32" => Some(Self::Int32),
            "IEEE_FLOAT_32" => Some(Self::Float32),
            _ => None,
        }
    }

    fn width(self) -> usize {
        match self {
            Self::Int16 => 2,
            Self::Int32 | Self::Float32 => 4,
        }
    }

    fn decode(self, bytes: &[u8]) -> f32 {
        match self {
            Self::Int16 => f32::from(i16::from_le_bytes([bytes[0], bytes[1]])),
            Self::Int32 => i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f32,
            Self::Float32 => f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VhdrHeader {
    pub data_file: PathBuf,
    pub marker_file: Option<PathBuf>,
    pub n_channels: usize,
    pub sampling_interval_us: f64,
    pub binary_format: BinaryFormat,
    pub channels: Vec<String>,
    /// Multiplier to microvolts, per channel.
    pub scales: Vec<f32>,
}

/// Matches `.vhdr` files, or a `.eeg` with a sibling `.vhdr`.
pub fn is_brainvision(path: &Path) -> bool {
    match extension(path).as_str() {
        "vhdr" => true,
        "eeg" => path.with_extension("vhdr").exists(),
        _ => false,
    }
}

fn unit_scale(unit: &str) -> f32 {
    match unit.trim() {
        "V" => 1e6,
        "mV" => 1e3,
        "nV" => 1e-3,
        _ => 1.0,
    }
}

/// Header files are Latin-1.
fn read_latin1(path: &Path) -> Result<String> {
    let bytes = fs::read(path)?;
    Ok(bytes.iter().map(|&b| b as char).collect())
}

pub fn read_vhdr(vhdr_path: &Path) -> Result<VhdrHeader> {
    let content = read_latin1(vhdr_path)?;
    let dir = vhdr_path.parent().unwrap_or_else(|| Path::new("."));

    let mut data_file = None;
    let mut marker_file = None;
    let mut n_channels = 0;
    let mut sampling_interval_us = 0.0;
    let mut binary_format = BinaryFormat::Int16;
    let mut orientation = String::from("MULTIPLEXED");
    let mut channels = Vec::new();
    let mut scales = Vec::new();
    let mut section = String::new();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with(';') {
            continue;
        }
        if line.starts_with('[') {
            section = line.trim_matches(['[', ']']).to_owned();
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        match (section.as_str(), key.trim()) {
            ("Common Infos", "DataFile") => data_file = Some(dir.join(value.trim())),
            ("Common Infos", "MarkerFile") => marker_file = Some(dir.join(value.trim())),
            ("Common Infos", "DataOrientation") => orientation = value.trim().to_ascii_uppercase(),
            ("Common Infos", "NumberOfChannels") => n_channels = value.trim().parse().unwrap_or(0),
            ("Common Infos", "SamplingInterval") => {
                sampling_interval_us = value.trim().parse().unwrap_or(0.0);
            }
            ("Binary Infos", "BinaryFormat") => {
                binary_format = BinaryFormat::parse(value).ok_or_else(|| {
                    SleepError::read(vhdr_path, 0, format!("unsupported BinaryFormat {value}"))
                })?;
            }
            ("Channel Infos", key) if key.starts_with("Ch") => {
                // Ch1=Name,RefName,Resolution,Unit
                let mut fields = value.split(',');
                let name = fields.next().unwrap_or_default().replace("\\1", ",");
                let _reference = fields.next();
                let resolution = fields
                    .next()
                    .and_then(|r| r.trim().parse::<f32>().ok())
                    .unwrap_or(1.0);
                let unit = fields.next().unwrap_or("µV");
                channels.push(name);
                scales.push(resolution * unit_scale(unit));
            }
            _ => {}
        }
    }

    let data_file = data_file
        .ok_or_else(|| SleepError::read(vhdr_path, 0, "no DataFile entry"))?;
    if orientation != "MULTIPLEXED" {
        return Err(SleepError::read(vhdr_path, 0, format!("{orientation} data is not supported")));
    }
    if sampling_interval_us <= 0.0 {
        return Err(SleepError::read(vhdr_path, 0, "missing SamplingInterval"));
    }
    if n_channels == 0 || channels.len() != n_channels {
        return Err(SleepError::read(
            vhdr_path,
            0,
            format!("NumberOfChannels={n_channels} but {} channel entries", channels.len()),
        ));
    }
    Ok(VhdrHeader {
        data_file,
        marker_file,
        n_channels,
        sampling_interval_us,
        binary_format,
        channels,
        scales,
    })
}

pub fn read_brainvision(path: &Path) -> Result<RawRecording> {
    let vhdr_path = path.with_extension("vhdr");
    let header = read_vhdr(&vhdr_path)?;
    let sf = 1e6 / header.sampling_interval_us;

    let bytes = fs::read(&header.data_file)?;
    let width = header.binary_format.width();
    let frame = width * header.n_channels;
    if bytes.len() % frame != 0 {
        log::warn!(
            "{}: {} trailing bytes ignored",
            header.data_file.display(),
            bytes.len() % frame
        );
    }
    let n_points = bytes.len() / frame;
    let data = Array2::from_shape_fn((header.n_channels, n_points), |(ch, t)| {
        let offset = t * frame + ch * width;
        header.binary_format.decode(&bytes[offset..offset + width]) * header.scales[ch]
    });

    let annotations = match &header.marker_file {
        Some(vmrk) if vmrk.exists() => read_vmrk(vmrk, sf)?,
        _ => Vec::new(),
    };

    Ok(RawRecording {
        sf,
        data,
        channels: header.channels,
        start_time: NaiveTime::MIN,
        annotations,
    })
}

/// `Mk<n>=<type>,<description>,<position>,<size>,<channel>` with 1-based positions.
pub fn read_vmrk(path: &Path, sf: f64) -> Result<Vec<FileAnnotation>> {
    let content = read_latin1(path)?;
    let mut in_markers = false;
    let mut annotations = Vec::new();
    for line in content.lines().map(str::trim) {
        if line.starts_with('[') {
            in_markers = line == "[Marker Infos]";
            continue;
        }
        if !in_markers || !line.starts_with("Mk") {
            continue;
        }
        let Some((_, value)) = line.split_once('=') else {
            continue;
        };
        let fields: Vec<&str> = value.split(',').collect();
        let (Some(kind), Some(description), Some(position)) =
            (fields.first(), fields.get(1), fields.get(2))
        else {
            continue;
        };
        let Ok(position) = position.trim().parse::<u64>() else {
            log::warn!("{}: skipping marker '{line}'", path.display());
            continue;
        };
        let size = fields
            .get(3)
            .and_then(|s| s.trim().parse::<u64>().ok())
            .unwrap_or(1);
        let start = position.saturating_sub(1) as f64 / sf;
        let text = if description.trim().is_empty() { kind } else { description };
        annotations.push(FileAnnotation {
            start_s: start,
            end_s: start + size.saturating_sub(1) as f64 / sf,
            text: text.trim().to_owned(),
        });
    }
    Ok(annotations)
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn write_set(dir: &Path, format: &str, samples: &[u8]) -> PathBuf {
        let vhdr = dir.join("rec.vhdr");
        fs::write(
            &vhdr,
            format!(
                "Brain Vision Data Exchange Header File Version 1.0\n\
                 [Common Infos]\nDataFile=rec.eeg\nMarkerFile=rec.vmrk\n\
                 DataFormat=BINARY\nDataOrientation=MULTIPLEXED\n\
                 NumberOfChannels=2\nSamplingInterval=4000\n\
                 [Binary Infos]\nBinaryFormat={format}\n\
                 [Channel Infos]\nCh1=Fp1,,0.5,µV\nCh2=O2,,1,mV\n"
            ),
        )
        .unwrap();
        fs::write(dir.join("rec.eeg"), samples).unwrap();
        fs::write(
            dir.join("rec.vmrk"),
            "Brain Vision Data Exchange Marker File, Version 1.0\n\
             [Marker Infos]\nMk1=New Segment,,1,1,0\nMk2=Stimulus,S  1,251,25,0\n",
        )
        .unwrap();
        vhdr
    }

    #[test]
    fn reads_int16_with_resolution_and_markers() {
        let dir = tempdir().unwrap();
        let mut samples = Vec::new();
        for t in 0..500i16 {
            samples.extend(t.to_le_bytes());
            samples.extend((-t).to_le_bytes());
        }
        let vhdr = write_set(dir.path(), "INT_16", &samples);
        let eeg = vhdr.with_extension("eeg");
        assert!(is_brainvision(&vhdr));
        assert!(is_brainvision(&eeg));

        let raw = read_brainvision(&eeg).unwrap();
        assert_eq!(raw.sf, 250.0);
        assert_eq!(raw.data.dim(), (2, 500));
        assert_eq!(raw.data[[0, 10]], 5.0);
        assert_eq!(raw.data[[1, 10]], -10_000.0);
        assert_eq!(raw.channels, vec!["Fp1", "O2"]);
        assert_eq!(raw.annotations.len(), 2);
        assert_eq!(raw.annotations[0].text, "New Segment");
        assert_eq!(raw.annotations[1].start_s, 1.0);
        assert!((raw.annotations[1].end_s - 1.096).abs() < 1e-9);
    }

    #[test]
    fn reads_float32() {
        let dir = tempdir().unwrap();
        let samples: Vec<u8> = [1.5f32, 2.0, 3.5, 4.0]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let vhdr = write_set(dir.path(), "IEEE_FLOAT_32", &samples);
        let raw = read_brainvision(&vhdr).unwrap();
        assert_eq!(raw.data.dim(), (2, 2));
        assert_eq!(raw.data[[0, 1]], 1.75);
        assert_eq!(raw.data[[1, 0]], 2000.0);
    }

    #[test]
    fn channel_count_mismatch_is_a_read_error() {
        let dir = tempdir().unwrap();
        let vhdr = dir.path().join("bad.vhdr");
        fs::write(
            &vhdr,
            "[Common Infos]\nDataFile=bad.eeg\nNumberOfChannels=3\nSamplingInterval=1000\n\
             [Channel Infos]\nCh1=Cz,,1,µV\n",
        )
        .unwrap();
        assert!(matches!(
            read_vhdr(&vhdr).unwrap_err(),
            SleepError::RecordingRead { .. }
        ));
    }
}
