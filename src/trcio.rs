//! Micromed `.trc` files, header type 4.

use std::fs;
use std::path::Path;

use chrono::NaiveTime;
use ndarray::Array2;

use crate::error::{Result, SleepError};
use crate::recording::extension;
use crate::RawRecording;

const HEADER_TYPE_OFFSET: usize = 175;
const SUPPORTED_HEADER_TYPE: u8 = 4;
const ZONES_OFFSET: usize = 176;
const ZONE_SIZE: usize = 16;
const N_ZONES: usize = 15;
const ELECTRODE_SIZE: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Zone {
    offset: usize,
    length: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Electrode {
    pub label: String,
    pub logical_min: i32,
    pub logical_max: i32,
    pub logical_ground: i32,
    pub physical_min: i32,
    pub physical_max: i32,
    /// -1 nV, 0 µV, 1 mV, 2 V.
    pub unit: i16,
}

impl Electrode {
    fn to_microvolts(&self, raw: u32) -> f32 {
        let span = f64::from(self.logical_max) - f64::from(self.logical_min) + 1.0;
        let physical = f64::from(self.physical_max) - f64::from(self.physical_min);
        let value = (f64::from(raw) - f64::from(self.logical_ground)) / span * physical;
        let scale = match self.unit {
            -1 => 1e-3,
            1 => 1e3,
            2 => 1e6,
            _ => 1.0,
        };
        (value * scale) as f32
    }
}

#[derive(Debug, Clone)]
pub struct TrcHeader {
    pub start_time: NaiveTime,
    pub data_start: usize,
    pub n_channels: usize,
    pub sf: f64,
    pub bytes_per_sample: usize,
    pub electrodes: Vec<Electrode>,
}

pub fn is_trc(path: &Path) -> bool {
    extension(path) == "trc"
}

struct Cursor<'a> {
    path: &'a Path,
    bytes: &'a [u8],
}

impl Cursor<'_> {
    fn slice(&self, offset: usize, len: usize) -> Result<&[u8]> {
        self.bytes
            .get(offset..offset + len)
            .ok_or_else(|| SleepError::read(self.path, offset as u64, "header truncated"))
    }

    fn u8(&self, offset: usize) -> Result<u8> {
        Ok(self.slice(offset, 1)?[0])
    }

    fn u16(&self, offset: usize) -> Result<u16> {
        let b = self.slice(offset, 2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn i16(&self, offset: usize) -> Result<i16> {
        let b = self.slice(offset, 2)?;
        Ok(i16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&self, offset: usize) -> Result<u32> {
        let b = self.slice(offset, 4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i32(&self, offset: usize) -> Result<i32> {
        let b = self.slice(offset, 4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn text(&self, offset: usize, len: usize) -> Result<String> {
        let raw = self.slice(offset, len)?;
        Ok(raw
            .iter()
            .take_while(|&&b| b != 0)
            .map(|&b| b as char)
            .collect::<String>()
            .trim()
            .to_owned())
    }

    fn zone(&self, name: &str) -> Result<Zone> {
        for i in 0..N_ZONES {
            let at = ZONES_OFFSET + i * ZONE_SIZE;
            if self.text(at, 8)? == name {
                return Ok(Zone {
                    offset: self.u32(at + 8)? as usize,
                    length: self.u32(at + 12)? as usize,
                });
            }
        }
        Err(SleepError::read(self.path, ZONES_OFFSET as u64, format!("no {name} zone")))
    }
}

pub fn parse_header(path: &Path, bytes: &[u8]) -> Result<TrcHeader> {
    let cursor = Cursor { path, bytes };
    let header_type = cursor.u8(HEADER_TYPE_OFFSET)?;
    if header_type != SUPPORTED_HEADER_TYPE {
        return Err(SleepError::read(
            path,
            HEADER_TYPE_OFFSET as u64,
            format!("header type {header_type} is not supported"),
        ));
    }
    let start_time = NaiveTime::from_hms_opt(
        u32::from(cursor.u8(131)?),
        u32::from(cursor.u8(132)?),
        u32::from(cursor.u8(133)?),
    )
    .unwrap_or(NaiveTime::MIN);
    let data_start = cursor.u32(138)? as usize;
    let n_channels = usize::from(cursor.u16(142)?);
    let sf = f64::from(cursor.u16(146)?);
    let bytes_per_sample = usize::from(cursor.u16(148)?);
    if n_channels == 0 || sf <= 0.0 || !matches!(bytes_per_sample, 1 | 2 | 4) {
        return Err(SleepError::read(
            path,
            142,
            format!("{n_channels} channels at {sf} Hz with {bytes_per_sample}-byte samples"),
        ));
    }

    let order = cursor.zone("ORDER")?;
    let labcod = cursor.zone("LABCOD")?;
    if order.length < 2 * n_channels {
        return Err(SleepError::read(path, order.offset as u64, "ORDER zone too short"));
    }
    let electrodes = (0..n_channels)
        .map(|i| {
            let index = usize::from(cursor.u16(order.offset + 2 * i)?);
            let at = labcod.offset + index * ELECTRODE_SIZE;
            if (index + 1) * ELECTRODE_SIZE > labcod.length {
                return Err(SleepError::read(path, at as u64, "electrode outside LABCOD zone"));
            }
            Ok(Electrode {
                label: cursor.text(at + 2, 6)?,
                logical_min: cursor.i32(at + 14)?,
                logical_max: cursor.i32(at + 18)?,
                logical_ground: cursor.i32(at + 22)?,
                physical_min: cursor.i32(at + 26)?,
                physical_max: cursor.i32(at + 30)?,
                unit: cursor.i16(at + 34)?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(TrcHeader {
        start_time,
        data_start,
        n_channels,
        sf,
        bytes_per_sample,
        electrodes,
    })
}

pub fn read_trc(path: &Path) -> Result<RawRecording> {
    let bytes = fs::read(path)?;
    let header = parse_header(path, &bytes)?;
    let samples = bytes
        .get(header.data_start..)
        .ok_or_else(|| SleepError::read(path, header.data_start as u64, "data offset past end of file"))?;
    let width = header.bytes_per_sample;
    let frame = width * header.n_channels;
    let n_points = samples.len() / frame;
    let data = Array2::from_shape_fn((header.n_channels, n_points), |(ch, t)| {
        let at = t * frame + ch * width;
        let raw = match width {
            1 => u32::from(samples[at]),
            2 => u32::from(u16::from_le_bytes([samples[at], samples[at + 1]])),
            _ => u32::from_le_bytes([samples[at], samples[at + 1], samples[at + 2], samples[at + 3]]),
        };
        header.electrodes[ch].to_microvolts(raw)
    });

    Ok(RawRecording {
        sf: header.sf,
        data,
        channels: header.electrodes.iter().map(|e| e.label.clone()).collect(),
        start_time: header.start_time,
        annotations: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn put(buf: &mut [u8], at: usize, bytes: &[u8]) {
        buf[at..at + bytes.len()].copy_from_slice(bytes);
    }

    fn build(header_type: u8) -> Vec<u8> {
        let data_start = 1024usize;
        let mut buf = vec![0u8; data_start];
        put(&mut buf, 131, &[23, 10, 5]);
        put(&mut buf, 138, &(data_start as u32).to_le_bytes());
        put(&mut buf, 142, &2u16.to_le_bytes());
        put(&mut buf, 146, &256u16.to_le_bytes());
        put(&mut buf, 148, &2u16.to_le_bytes());
        buf[HEADER_TYPE_OFFSET] = header_type;

        put(&mut buf, ZONES_OFFSET, b"ORDER   ");
        put(&mut buf, ZONES_OFFSET + 8, &448u32.to_le_bytes());
        put(&mut buf, ZONES_OFFSET + 12, &4u32.to_le_bytes());
        put(&mut buf, ZONES_OFFSET + 16, b"LABCOD  ");
        put(&mut buf, ZONES_OFFSET + 24, &512u32.to_le_bytes());
        put(&mut buf, ZONES_OFFSET + 28, &(3 * ELECTRODE_SIZE as u32).to_le_bytes());
        // second stored channel is electrode 2
        put(&mut buf, 448, &0u16.to_le_bytes());
        put(&mut buf, 450, &2u16.to_le_bytes());
        for (index, label, unit) in [(0usize, "Fp1", 0i16), (2, "EMG1", 1)] {
            let at = 512 + index * ELECTRODE_SIZE;
            put(&mut buf, at + 2, label.as_bytes());
            put(&mut buf, at + 14, &0i32.to_le_bytes());
            put(&mut buf, at + 18, &65535i32.to_le_bytes());
            put(&mut buf, at + 22, &32768i32.to_le_bytes());
            put(&mut buf, at + 26, &(-3200i32).to_le_bytes());
            put(&mut buf, at + 30, &3200i32.to_le_bytes());
            put(&mut buf, at + 34, &unit.to_le_bytes());
        }
        for t in 0..512u16 {
            buf.extend((32768 + t).to_le_bytes());
            buf.extend((32768 - t).to_le_bytes());
        }
        buf
    }

    #[test]
    fn reads_calibrated_channels() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("night.TRC");
        fs::write(&path, build(4)).unwrap();
        assert!(is_trc(&path));
        let raw = read_trc(&path).unwrap();
        assert_eq!(raw.sf, 256.0);
        assert_eq!(raw.channels, vec!["Fp1", "EMG1"]);
        assert_eq!(raw.data.dim(), (2, 512));
        assert_eq!(raw.start_time, NaiveTime::from_hms_opt(23, 10, 5).unwrap());
        // 6400 over 65536 steps
        assert!((raw.data[[0, 100]] - 9.765_625).abs() < 1e-3);
        assert!((raw.data[[1, 100]] + 9765.625).abs() < 1e-1);
    }

    #[test]
    fn other_header_types_are_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("old.trc");
        fs::write(&path, build(3)).unwrap();
        assert!(matches!(
            read_trc(&path).unwrap_err(),
            SleepError::RecordingRead { offset: 175, .. }
        ));
    }
}
