use std::fs::File;
use std::io::BufReader;
use std::io::prelude::*;
use std::io::SeekFrom;
use std::path::Path;

use chrono::NaiveTime;
use local_edf_reader::init_sync_reader;
use ndarray::Array2;

use crate::error::{Result, SleepError};
use crate::recording::extension;
use crate::{FileAnnotation, RawRecording};

const ANNOTATION_LABEL: &str = "EDF Annotations";

/// Fields of the fixed 256-byte header plus the per-signal bits we need
/// before handing the file to the sample reader.
#[derive(Debug, Clone, PartialEq)]
pub struct EdfHeader {
    pub version: String,
    pub start_time: NaiveTime,
    pub header_bytes: u64,
    pub reserved: String,
    pub n_records: u64,
    pub record_duration_s: f64,
    pub labels: Vec<String>,
    pub samples_per_record: Vec<usize>,
}

impl EdfHeader {
    pub fn is_edf_plus(&self) -> bool {
        self.reserved.starts_with("EDF+")
    }

    pub fn sampling_rate(&self, signal: usize) -> f64 {
        self.samples_per_record[signal] as f64 / self.record_duration_s
    }

    fn record_bytes(&self) -> u64 {
        self.samples_per_record.iter().map(|&n| n as u64 * 2).sum()
    }
}

pub fn is_edf(path: &Path) -> bool {
    matches!(extension(path).as_str(), "edf" | "rec")
}

fn field(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim().to_owned()
}

fn parse_clock(text: &str) -> Option<NaiveTime> {
    let mut parts = text.split(['.', ':']).map(|p| p.trim().parse::<u32>());
    match (parts.next(), parts.next(), parts.next()) {
        (Some(Ok(h)), Some(Ok(m)), Some(Ok(s))) => NaiveTime::from_hms_opt(h, m, s),
        _ => None,
    }
}

/// Parses the fixed header and the signal headers.
pub fn read_header(path: &Path) -> Result<EdfHeader> {
    let file = File::open(path)?;
    let mut buf_reader = BufReader::new(file);
    let mut header_contents_buffer: [u8; 256] = [0; 256];
    buf_reader
        .read_exact(&mut header_contents_buffer)
        .map_err(|e| SleepError::read(path, 0, format!("short header: {e}")))?;

    let version = field(&header_contents_buffer[0..8]);
    if version != "0" {
        return Err(SleepError::read(path, 0, format!("record version '{version}' is not 0")));
    }
    let start_time = parse_clock(&field(&header_contents_buffer[176..184])).unwrap_or(NaiveTime::MIN);
    let number = |range: std::ops::Range<usize>, offset: u64| -> Result<String> {
        let text = field(&header_contents_buffer[range]);
        if text.is_empty() {
            return Err(SleepError::read(path, offset, "empty numeric header field"));
        }
        Ok(text)
    };
    let header_bytes: u64 = number(184..192, 184)?
        .parse()
        .map_err(|_| SleepError::read(path, 184, "bad header size"))?;
    let reserved = field(&header_contents_buffer[192..236]);
    let n_records: i64 = number(236..244, 236)?
        .parse()
        .map_err(|_| SleepError::read(path, 236, "bad number of data records"))?;
    let record_duration_s: f64 = number(244..252, 244)?
        .parse()
        .map_err(|_| SleepError::read(path, 244, "bad record duration"))?;
    let n_signals: usize = number(252..256, 252)?
        .parse()
        .map_err(|_| SleepError::read(path, 252, "bad number of signals"))?;
    if n_signals == 0 {
        return Err(SleepError::read(path, 252, "no signals in EDF file"));
    }
    if record_duration_s <= 0.0 {
        return Err(SleepError::read(path, 244, "record duration must be positive"));
    }
    if n_records < 0 {
        return Err(SleepError::read(path, 236, "unknown number of data records"));
    }
    if header_bytes != 256 * (n_signals as u64 + 1) {
        return Err(SleepError::read(
            path,
            184,
            format!("header size {header_bytes} does not match {n_signals} signals"),
        ));
    }

    let mut signal_headers = vec![0u8; 256 * n_signals];
    buf_reader
        .read_exact(&mut signal_headers)
        .map_err(|e| SleepError::read(path, 256, format!("short signal headers: {e}")))?;
    let labels = (0..n_signals)
        .map(|i| field(&signal_headers[i * 16..(i + 1) * 16]))
        .collect();
    // label, transducer, dimension, pmin, pmax, dmin, dmax, prefilter
    let samples_offset = n_signals * (16 + 80 + 8 + 8 + 8 + 8 + 8 + 80);
    let samples_per_record = (0..n_signals)
        .map(|i| {
            let start = samples_offset + i * 8;
            field(&signal_headers[start..start + 8])
                .parse::<usize>()
                .map_err(|_| SleepError::read(path, 256 + start as u64, "bad samples per record"))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(EdfHeader {
        version,
        start_time,
        header_bytes,
        reserved,
        n_records: n_records as u64,
        record_duration_s,
        labels,
        samples_per_record,
    })
}

/// Indices of data signals kept: annotation channels and channels whose rate
/// differs from the highest one are left out.
pub fn select_signals(header: &EdfHeader) -> (Vec<usize>, Vec<usize>) {
    let data: Vec<usize> = (0..header.labels.len())
        .filter(|&i| !header.labels[i].contains(ANNOTATION_LABEL))
        .collect();
    let max_rate = data
        .iter()
        .map(|&i| header.sampling_rate(i))
        .fold(0.0f64, f64::max);
    data.into_iter()
        .partition(|&i| (header.sampling_rate(i) - max_rate).abs() < 1e-9)
}

pub fn read_edf(path: &Path) -> Result<RawRecording> {
    let header = read_header(path)?;
    let (kept, dropped) = select_signals(&header);
    for &i in &dropped {
        log::warn!(
            "{}: dropping channel '{}' sampled at {} Hz",
            path.display(),
            header.labels[i],
            header.sampling_rate(i)
        );
    }
    let Some(&first) = kept.first() else {
        return Err(SleepError::read(path, 256, "no data channels"));
    };
    let sf = header.sampling_rate(first);

    let file_path = path
        .to_str()
        .ok_or_else(|| SleepError::read(path, 0, "path is not valid UTF-8"))?;
    let edf_reader = init_sync_reader(file_path)
        .map_err(|e| SleepError::read(path, 0, e.to_string()))?;
    let total_duration_ms = edf_reader.edf_header.number_of_blocks * edf_reader.edf_header.block_duration;
    let data = edf_reader
        .read_data_window(0, total_duration_ms)
        .map_err(|e| SleepError::read(path, header.header_bytes, e.to_string()))?;
    if data.len() != header.labels.len() {
        return Err(SleepError::read(
            path,
            252,
            format!("{} signals in header but {} read", header.labels.len(), data.len()),
        ));
    }

    let n_points = header.n_records as usize * header.samples_per_record[first];
    let mut flat = Vec::with_capacity(kept.len() * n_points);
    for &i in &kept {
        let channel = &data[i];
        if channel.len() < n_points {
            return Err(SleepError::read(
                path,
                header.header_bytes,
                format!("channel '{}' has {} of {n_points} samples", header.labels[i], channel.len()),
            ));
        }
        flat.extend_from_slice(&channel[..n_points]);
    }
    let data = Array2::from_shape_vec((kept.len(), n_points), flat)
        .map_err(|e| SleepError::read(path, header.header_bytes, e.to_string()))?;

    let annotations = if header.is_edf_plus() {
        read_annotations(path, &header)?
    } else {
        Vec::new()
    };
    if !annotations.is_empty() {
        log::info!("{}: found {} annotations", path.display(), annotations.len());
    }

    Ok(RawRecording {
        sf,
        data,
        channels: kept.iter().map(|&i| header.labels[i].clone()).collect(),
        start_time: header.start_time,
        annotations,
    })
}

/// Reads the raw bytes of every "EDF Annotations" signal and parses its TALs.
fn read_annotations(path: &Path, header: &EdfHeader) -> Result<Vec<FileAnnotation>> {
    let record_bytes = header.record_bytes();
    let mut file = BufReader::new(File::open(path)?);
    let mut annotations = Vec::new();
    for signal in 0..header.labels.len() {
        if !header.labels[signal].contains(ANNOTATION_LABEL) {
            continue;
        }
        let in_record: u64 = header.samples_per_record[..signal]
            .iter()
            .map(|&n| n as u64 * 2)
            .sum();
        let mut bytes = vec![0u8; header.samples_per_record[signal] * 2];
        let mut tal_bytes = Vec::with_capacity(bytes.len() * header.n_records as usize);
        for record in 0..header.n_records {
            let offset = header.header_bytes + record * record_bytes + in_record;
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(&mut bytes)
                .map_err(|e| SleepError::read(path, offset, format!("annotation record: {e}")))?;
            tal_bytes.extend_from_slice(&bytes);
        }
        annotations.extend(parse_edf_annotations(&tal_bytes));
    }
    Ok(annotations)
}

/// Parses time-stamped annotation lists. Onsets are made relative to the
/// first record's time-keeping stamp.
pub fn parse_edf_annotations(bytes: &[u8]) -> Vec<FileAnnotation> {
    let annotation_str = String::from_utf8_lossy(bytes);
    let mut first_timestamp: Option<f64> = None;
    let mut annotations = Vec::new();

    for tal in annotation_str.split('\x00') {
        let Some(rest) = tal.strip_prefix(['+', '-']) else {
            continue;
        };
        let sign = if tal.starts_with('-') { -1.0 } else { 1.0 };
        let mut parts = rest.split('\x14');
        let Some(timing) = parts.next() else {
            continue;
        };
        let mut timing = timing.split('\x15');
        let Some(onset) = timing.next().and_then(|t| t.trim().parse::<f64>().ok()) else {
            continue;
        };
        let onset = sign * onset;
        let duration = timing
            .next()
            .and_then(|d| d.trim().parse::<f64>().ok())
            .unwrap_or(0.0);
        let first = *first_timestamp.get_or_insert(onset);

        for text in parts.filter(|t| !t.trim().is_empty()) {
            let start_s = onset - first;
            annotations.push(FileAnnotation {
                start_s,
                end_s: start_s + duration,
                text: text.trim().to_owned(),
            });
        }
    }
    annotations
}

#[cfg(test)]
pub(crate) mod tests {
    use tempfile::tempdir;

    use super::*;

    fn padded(text: &str, width: usize) -> Vec<u8> {
        let mut bytes = text.as_bytes().to_vec();
        bytes.resize(width, b' ');
        bytes
    }

    /// Writes a minimal EDF(+) file; each signal is `(label, samples_per_record)`.
    pub(crate) fn write_edf(
        path: &Path,
        signals: &[(&str, usize)],
        n_records: usize,
        record_s: f64,
        fill: impl Fn(usize, usize) -> i16,
        annotations: Option<&[u8]>,
    ) {
        let ns = signals.len();
        let mut out = Vec::new();
        out.extend(padded("0", 8));
        out.extend(padded("X X X X", 80));
        out.extend(padded("Startdate 01-JAN-2020 X X X", 80));
        out.extend(padded("01.01.20", 8));
        out.extend(padded("22.30.15", 8));
        out.extend(padded(&(256 * (ns + 1)).to_string(), 8));
        out.extend(padded(if annotations.is_some() { "EDF+C" } else { "" }, 44));
        out.extend(padded(&n_records.to_string(), 8));
        out.extend(padded(&record_s.to_string(), 8));
        out.extend(padded(&ns.to_string(), 4));
        let per_signal = |out: &mut Vec<u8>, width: usize, value: &dyn Fn(usize) -> String| {
            for i in 0..ns {
                out.extend(padded(&value(i), width));
            }
        };
        per_signal(&mut out, 16, &|i| signals[i].0.to_owned());
        per_signal(&mut out, 80, &|_| String::new());
        per_signal(&mut out, 8, &|_| "uV".to_owned());
        per_signal(&mut out, 8, &|_| "-32768".to_owned());
        per_signal(&mut out, 8, &|_| "32767".to_owned());
        per_signal(&mut out, 8, &|_| "-32768".to_owned());
        per_signal(&mut out, 8, &|_| "32767".to_owned());
        per_signal(&mut out, 80, &|_| String::new());
        per_signal(&mut out, 8, &|i| signals[i].1.to_string());
        per_signal(&mut out, 32, &|_| String::new());
        for record in 0..n_records {
            for (i, (label, n)) in signals.iter().enumerate() {
                if label.contains(ANNOTATION_LABEL) {
                    let mut chunk = vec![0u8; n * 2];
                    if record == 0 {
                        if let Some(tal) = annotations {
                            chunk[..tal.len()].copy_from_slice(tal);
                        }
                    } else {
                        let stamp = format!("+{}\x14\x14\x00", record as f64 * record_s);
                        chunk[..stamp.len()].copy_from_slice(stamp.as_bytes());
                    }
                    out.extend(chunk);
                } else {
                    for s in 0..*n {
                        out.extend(fill(i, record * n + s).to_le_bytes());
                    }
                }
            }
        }
        std::fs::write(path, out).unwrap();
    }

    #[test]
    fn tal_parsing_keeps_durations_and_skips_timekeeping() {
        let tal = b"+0\x14\x14\x00+12.5\x1530\x14Lights off\x14\x00+40\x14Arousal\x14Snore\x14\x00\x00\x00";
        let annotations = parse_edf_annotations(tal);
        assert_eq!(annotations.len(), 3);
        assert_eq!(annotations[0].text, "Lights off");
        assert_eq!(annotations[0].start_s, 12.5);
        assert_eq!(annotations[0].end_s, 42.5);
        assert_eq!(annotations[1].start_s, 40.0);
        assert_eq!(annotations[1].end_s, 40.0);
        assert_eq!(annotations[2].text, "Snore");
    }

    #[test]
    fn header_rejects_non_zero_version() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.edf");
        let mut bytes = padded("1", 8);
        bytes.resize(256, b' ');
        std::fs::write(&path, bytes).unwrap();
        let err = read_header(&path).unwrap_err();
        assert!(matches!(err, SleepError::RecordingRead { offset: 0, .. }));

        std::fs::write(&path, b"0       short").unwrap();
        assert!(read_header(&path).is_err());
    }

    #[test]
    fn header_and_channel_selection() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("night.edf");
        write_edf(
            &path,
            &[("EEG Fpz-Cz", 100), ("EMG", 50), ("EOG", 100), (ANNOTATION_LABEL, 30)],
            3,
            1.0,
            |_, _| 0,
            Some(b"+0\x14\x14\x00+1\x150.5\x14Spindle\x14\x00"),
        );
        let header = read_header(&path).unwrap();
        assert!(header.is_edf_plus());
        assert_eq!(header.start_time, NaiveTime::from_hms_opt(22, 30, 15).unwrap());
        assert_eq!(header.n_records, 3);
        assert_eq!(header.sampling_rate(1), 50.0);
        let (kept, dropped) = select_signals(&header);
        assert_eq!(kept, vec![0, 2]);
        assert_eq!(dropped, vec![1]);

        let annotations = read_annotations(&path, &header).unwrap();
        assert_eq!(annotations, vec![FileAnnotation {
            start_s: 1.0,
            end_s: 1.5,
            text: "Spindle".to_owned(),
        }]);
    }

    #[test]
    fn reads_samples_of_uniform_channels() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("small.edf");
        write_edf(
            &path,
            &[("C3", 10), ("C4", 10)],
            2,
            1.0,
            |ch, t| (ch as i16 + 1) * 100 + t as i16,
            None,
        );
        let raw = read_edf(&path).unwrap();
        assert_eq!(raw.sf, 10.0);
        assert_eq!(raw.data.dim(), (2, 20));
        assert_eq!(raw.channels, vec!["C3", "C4"]);
        // digital and physical ranges are identical
        assert!((raw.data[[0, 5]] - 105.0).abs() < 0.01);
        assert!((raw.data[[1, 19]] - 219.0).abs() < 0.01);
        assert!(raw.annotations.is_empty());
    }
}
