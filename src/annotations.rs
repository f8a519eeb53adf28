//! Free-text annotations attached to a signal.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::FileAnnotation;
use crate::error::{Result, SleepError};

pub const DEFAULT_TEXT: &str = "enter annotation";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub start_s: f64,
    pub end_s: f64,
    pub signal_id: String,
    pub text: String,
}

impl Annotation {
    pub fn is_point(&self) -> bool {
        self.start_s == self.end_s
    }

    pub fn centre(&self) -> f64 {
        (self.start_s + self.end_s) / 2.0
    }
}

/// Anything exposing MNE-style parallel `onset` / `duration` / `description` columns.
pub trait AnnotationObject {
    fn onset(&self) -> Vec<f64>;
    fn duration(&self) -> Vec<f64>;
    fn description(&self) -> Vec<String>;
}

pub enum AnnotationSource<'a> {
    Path(PathBuf),
    /// Point annotations with the default text.
    Onsets(Vec<f64>),
    Triplets(Vec<(f64, f64, String)>),
    Object(&'a dyn AnnotationObject),
    /// Markers embedded in the recording file.
    File(&'a [FileAnnotation]),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnnotationStore {
    items: Vec<Annotation>,
}

impl AnnotationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Annotation> {
        self.items.iter()
    }

    pub fn get(&self, idx: usize) -> Option<&Annotation> {
        self.items.get(idx)
    }

    pub fn add(&mut self, start_s: f64, end_s: f64, signal_id: &str, text: &str) -> Result<usize> {
        if !(start_s.is_finite() && end_s.is_finite()) || start_s > end_s {
            return Err(SleepError::InvalidArgument(format!(
                "annotation [{start_s}, {end_s}] is not a valid interval"
            )));
        }
        self.items.push(Annotation {
            start_s,
            end_s,
            signal_id: signal_id.to_owned(),
            text: text.to_owned(),
        });
        Ok(self.items.len() - 1)
    }

    pub fn remove(&mut self, idx: usize) -> Option<Annotation> {
        (idx < self.items.len()).then(|| self.items.remove(idx))
    }

    pub fn set_text(&mut self, idx: usize, text: &str) -> bool {
        match self.items.get_mut(idx) {
            Some(a) => {
                a.text = text.to_owned();
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Appends everything `source` holds; returns how many were added.
    pub fn load(&mut self, source: AnnotationSource<'_>) -> Result<usize> {
        let mut incoming = Self::new();
        match source {
            AnnotationSource::Path(path) => incoming = read_annotations(&path)?,
            AnnotationSource::Onsets(onsets) => {
                for t in onsets {
                    incoming.add(t, t, "", DEFAULT_TEXT)?;
                }
            }
            AnnotationSource::Triplets(rows) => {
                for (start, end, text) in rows {
                    incoming.add(start, end, "", &text)?;
                }
            }
            AnnotationSource::Object(obj) => {
                let (onset, duration, description) = (obj.onset(), obj.duration(), obj.description());
                if onset.len() != duration.len() || onset.len() != description.len() {
                    return Err(SleepError::InvalidArgument(format!(
                        "annotation object columns differ in length ({}, {}, {})",
                        onset.len(),
                        duration.len(),
                        description.len()
                    )));
                }
                for ((t, d), text) in onset.into_iter().zip(duration).zip(description) {
                    incoming.add(t, t + d, "", &text)?;
                }
            }
            AnnotationSource::File(markers) => {
                for m in markers {
                    incoming.add(m.start_s, m.end_s, "", &m.text)?;
                }
            }
        }
        let added = incoming.len();
        self.items.extend(incoming.items);
        Ok(added)
    }

    /// Indices of annotations overlapping `[t0, t1]`.
    pub fn in_range(&self, t0: f64, t1: f64) -> Vec<usize> {
        self.items
            .iter()
            .enumerate()
            .filter(|(_, a)| a.end_s >= t0 && a.start_s <= t1)
            .map(|(i, _)| i)
            .collect()
    }

    /// Annotation whose centre is closest to `t`.
    pub fn nearest(&self, t: f64) -> Option<usize> {
        self.items
            .iter()
            .enumerate()
            .min_by(|a, b| (a.1.centre() - t).abs().total_cmp(&(b.1.centre() - t).abs()))
            .map(|(i, _)| i)
    }

    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        write_annotations(path.as_ref(), &self.items)
    }
}

/// Reads `start, end, signal_id, text` rows; three-column rows have no signal id.
pub fn read_annotations(path: &Path) -> Result<AnnotationStore> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)?;
    let mut store = AnnotationStore::new();
    for (line, record) in reader.records().enumerate() {
        let record = record?;
        let parse = |i: usize| -> Result<f64> {
            record
                .get(i)
                .and_then(|v| v.trim().parse().ok())
                .ok_or_else(|| {
                    SleepError::InvalidArgument(format!(
                        "{}:{}: bad time in column {i}",
                        path.display(),
                        line + 1
                    ))
                })
        };
        let (start, end) = match record.len() {
            1 => {
                let t = parse(0)?;
                (t, t)
            }
            _ => (parse(0)?, parse(1)?),
        };
        let (signal_id, text) = match record.len() {
            1 => ("", DEFAULT_TEXT),
            2 => ("", ""),
            3 => ("", record.get(2).unwrap_or_default()),
            _ => (record.get(2).unwrap_or_default(), record.get(3).unwrap_or_default()),
        };
        store.add(start, end, signal_id, text)?;
    }
    log::info!("{} annotations read from {}", store.len(), path.display());
    Ok(store)
}

/// `.csv` and `.txt` share the comma-delimited layout.
pub fn write_annotations(path: &Path, items: &[Annotation]) -> Result<()> {
    let mut writer = csv::WriterBuilder::new().has_headers(false).from_path(path)?;
    for a in items {
        writer.write_record([
            a.start_s.to_string(),
            a.end_s.to_string(),
            a.signal_id.clone(),
            a.text.clone(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;

    struct MneLike;

    impl AnnotationObject for MneLike {
        fn onset(&self) -> Vec<f64> {
            vec![1.0, 5.5]
        }

        fn duration(&self) -> Vec<f64> {
            vec![0.0, 2.0]
        }

        fn description(&self) -> Vec<String> {
            vec!["arousal".to_owned(), "snore".to_owned()]
        }
    }

    #[test]
    fn write_read_preserves_every_field() {
        let mut rng = StdRng::seed_from_u64(3);
        let alphabet: Vec<char> = (32u8..127).map(char::from).collect();
        let dir = tempfile::tempdir().unwrap();
        for round in 0..20 {
            let mut store = AnnotationStore::new();
            for _ in 0..rng.gen_range(0..30) {
                let start: f64 = rng.gen_range(0.0..30_000.0);
                let end = start + rng.gen_range(0.0..60.0);
                let mut word = |len: usize| -> String {
                    (0..len).map(|_| alphabet[rng.gen_range(0..alphabet.len())]).collect()
                };
                let signal = word(3);
                let text = word(12);
                store.add(start, end, &signal, &text).unwrap();
            }
            let ext = if round % 2 == 0 { "csv" } else { "txt" };
            let path = dir.path().join(format!("annot{round}.{ext}"));
            store.write(&path).unwrap();
            let back = read_annotations(&path).unwrap();
            assert_eq!(back, store);
        }
    }

    #[test]
    fn sources() {
        let mut store = AnnotationStore::new();
        assert_eq!(store.load(AnnotationSource::Onsets(vec![3.0, 4.0])).unwrap(), 2);
        assert!(store.get(0).unwrap().is_point());
        assert_eq!(store.get(0).unwrap().text, DEFAULT_TEXT);
        store
            .load(AnnotationSource::Triplets(vec![(10.0, 12.0, "spindle".to_owned())]))
            .unwrap();
        store.load(AnnotationSource::Object(&MneLike)).unwrap();
        assert_eq!(store.len(), 5);
        assert_eq!(store.get(4).unwrap().end_s, 7.5);
        assert_eq!(store.nearest(6.0), Some(4));
        assert_eq!(store.in_range(3.5, 11.0), vec![1, 2, 4]);
    }

    #[test]
    fn invalid_interval_adds_nothing() {
        let mut store = AnnotationStore::new();
        let bad = AnnotationSource::Triplets(vec![(1.0, 2.0, "ok".to_owned()), (5.0, 4.0, "bad".to_owned())]);
        assert!(store.load(bad).is_err());
        assert!(store.is_empty());
    }
}
