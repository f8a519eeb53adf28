use std::ops::Range;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::stages::StageDict;

/// `(channel, method)`: one set of events.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DetectionKey {
    pub channel: String,
    pub method: String,
}

impl DetectionKey {
    pub fn new(channel: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            method: method.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct DetectionSet {
    key: DetectionKey,
    channel_index: usize,
    range: Range<usize>,
    enabled: bool,
}

/// One exported detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRow {
    pub start_s: f64,
    pub duration_s: f64,
    pub stage: String,
}

/// Every event of the session in one arena, with per-key slice ranges.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectionStore {
    events: Vec<[usize; 2]>,
    /// Hypnogram value at each event's start sample.
    stages: Vec<Option<i32>>,
    sets: Vec<DetectionSet>,
}

impl DetectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    pub fn total_events(&self) -> usize {
        self.events.len()
    }

    pub fn keys(&self) -> impl Iterator<Item = &DetectionKey> {
        self.sets.iter().map(|s| &s.key)
    }

    fn position(&self, key: &DetectionKey) -> Option<usize> {
        self.sets.iter().position(|s| &s.key == key)
    }

    fn set(&self, key: &DetectionKey) -> Option<&DetectionSet> {
        self.sets.iter().find(|s| &s.key == key)
    }

    /// Stores normalised `events` under `key`, replacing any previous set.
    pub fn insert(&mut self, key: DetectionKey, channel_index: usize, events: Vec<[usize; 2]>, hypno: &[i32]) {
        let enabled = self.set(&key).is_none_or(|s| s.enabled);
        self.delete(&key);
        let start = self.events.len();
        let outside = events.iter().filter(|e| e[0] >= hypno.len()).count();
        if outside > 0 {
            log::warn!("{key}: {outside} event(s) start past the hypnogram, stage left unset");
        }
        self.stages.extend(events.iter().map(|e| hypno.get(e[0]).copied()));
        self.events.extend(events);
        self.sets.push(DetectionSet {
            key,
            channel_index,
            range: start..self.events.len(),
            enabled,
        });
    }

    pub fn delete(&mut self, key: &DetectionKey) -> bool {
        let Some(pos) = self.position(key) else {
            return false;
        };
        let removed = self.sets.remove(pos);
        let len = removed.range.len();
        self.events.drain(removed.range.clone());
        self.stages.drain(removed.range.clone());
        for set in &mut self.sets {
            if set.range.start >= removed.range.end {
                set.range = set.range.start - len..set.range.end - len;
            }
        }
        true
    }

    pub fn clear(&mut self) {
        self.events.clear();
        self.stages.clear();
        self.sets.clear();
    }

    pub fn get(&self, key: &DetectionKey) -> Option<&[[usize; 2]]> {
        self.set(key).map(|s| &self.events[s.range.clone()])
    }

    pub fn stages_at_start(&self, key: &DetectionKey) -> Option<&[Option<i32>]> {
        self.set(key).map(|s| &self.stages[s.range.clone()])
    }

    pub fn channel_index(&self, key: &DetectionKey) -> Option<usize> {
        self.set(key).map(|s| s.channel_index)
    }

    pub fn set_enabled(&mut self, key: &DetectionKey, enabled: bool) -> bool {
        match self.sets.iter_mut().find(|s| &s.key == key) {
            Some(set) => {
                set.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn is_enabled(&self, key: &DetectionKey) -> bool {
        self.set(key).is_some_and(|s| s.enabled)
    }

    /// Start time, in seconds, of the `index`-th event of `key`.
    pub fn jump_to(&self, key: &DetectionKey, index: usize, sf: f64) -> Option<f64> {
        self.get(key)?.get(index).map(|e| e[0] as f64 / sf)
    }

    /// Markers at each event start, at constant `y`, for every enabled set.
    pub fn overlay_markers(&self, y: f64) -> Vec<(&DetectionKey, Vec<(usize, f64)>)> {
        self.sets
            .iter()
            .filter(|s| s.enabled)
            .map(|s| {
                let markers = self.events[s.range.clone()].iter().map(|e| (e[0], y)).collect();
                (&s.key, markers)
            })
            .collect()
    }

    /// Events of one enabled set intersecting the half-open sample range.
    pub fn events_in(&self, key: &DetectionKey, start: usize, end: usize) -> Vec<[usize; 2]> {
        match self.set(key) {
            Some(set) if set.enabled => self.events[set.range.clone()]
                .iter()
                .filter(|e| e[1] >= start && e[0] < end)
                .copied()
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn summary(&self, key: &DetectionKey, sf: f64, stages: &StageDict) -> Vec<EventRow> {
        let Some(set) = self.set(key) else {
            return Vec::new();
        };
        self.events[set.range.clone()]
            .iter()
            .zip(&self.stages[set.range.clone()])
            .map(|(e, &stage)| EventRow {
                start_s: e[0] as f64 / sf,
                duration_s: (e[1] - e[0] + 1) as f64 / sf,
                stage: stage
                    .map(|code| {
                        stages
                            .name_of(code)
                            .map_or_else(|| code.to_string(), str::to_owned)
                    })
                    .unwrap_or_default(),
            })
            .collect()
    }

    pub fn export_csv(&self, key: &DetectionKey, path: impl AsRef<Path>, sf: f64, stages: &StageDict) -> Result<()> {
        let mut writer = csv::Writer::from_path(path.as_ref())?;
        for row in self.summary(key, sf, stages) {
            writer.serialize(row)?;
        }
        writer.flush()?;
        Ok(())
    }
}
