use std::collections::HashMap;

use crate::error::{Result, SleepError};
use crate::hypnoio;
use crate::stages::StageDict;

/// Per-sample stage vector in storage codes, aligned to the signal timebase.
///
/// Not thread-safe by design of the session: every mutation happens on the
/// thread that owns the [`crate::ScoringSession`].
#[derive(Debug, Clone, PartialEq)]
pub struct Hypnogram {
    data: Vec<i32>,
    stages: StageDict,
    hconv: HashMap<i32, i32>,
    hconv_inv: HashMap<i32, i32>,
}

impl Hypnogram {
    pub fn blank(n_points: usize, stages: StageDict) -> Self {
        let wake = blank_value(&stages);
        Self::build(vec![wake; n_points], stages)
    }

    pub fn from_vec(data: Vec<i32>, stages: StageDict) -> Result<Self> {
        if let Some(bad) = data.iter().find(|v| !stages.contains_value(**v)) {
            return Err(SleepError::UnknownStage(bad.to_string()));
        }
        Ok(Self::build(data, stages))
    }

    fn build(data: Vec<i32>, stages: StageDict) -> Self {
        let (hconv, hconv_inv) = display_maps(&stages);
        Self {
            data,
            stages,
            hconv,
            hconv_inv,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[i32] {
        &self.data
    }

    pub fn get(&self, idx: usize) -> Option<i32> {
        self.data.get(idx).copied()
    }

    pub fn stages(&self) -> &StageDict {
        &self.stages
    }

    pub fn hconv(&self) -> &HashMap<i32, i32> {
        &self.hconv
    }

    pub fn hconv_inv(&self) -> &HashMap<i32, i32> {
        &self.hconv_inv
    }

    /// Writes `code` over the half-open run `[start, end)`.
    pub fn set_stage(&mut self, start: usize, end: usize, code: i32) -> Result<()> {
        if !self.stages.contains_value(code) {
            return Err(SleepError::UnknownStage(code.to_string()));
        }
        if start > end || end > self.data.len() {
            return Err(SleepError::InvalidArgument(format!(
                "stage run [{start}, {end}) outside hypnogram of length {}",
                self.data.len()
            )));
        }
        self.data[start..end].fill(code);
        Ok(())
    }

    /// Previous content of `[start, end)`, for undo.
    pub fn snapshot(&self, start: usize, end: usize) -> Vec<i32> {
        let end = end.min(self.data.len());
        let start = start.min(end);
        self.data[start..end].to_vec()
    }

    pub(crate) fn restore(&mut self, start: usize, values: &[i32]) {
        let end = (start + values.len()).min(self.data.len());
        self.data[start..end].copy_from_slice(&values[..end - start]);
    }

    /// Resets every sample to Wake.
    pub fn clean(&mut self) {
        let wake = blank_value(&self.stages);
        self.data.fill(wake);
    }

    pub fn replace(&mut self, data: Vec<i32>) -> Result<()> {
        if data.len() != self.data.len() {
            return Err(SleepError::InvalidArgument(format!(
                "hypnogram length {} does not match {}",
                data.len(),
                self.data.len()
            )));
        }
        let checked = Self::from_vec(data, self.stages.clone())?;
        self.data = checked.data;
        Ok(())
    }

    pub fn convert_display(&self, values: &[i32]) -> Vec<i32> {
        values
            .iter()
            .map(|v| self.hconv.get(v).copied().unwrap_or(*v))
            .collect()
    }

    pub fn convert_storage(&self, values: &[i32]) -> Vec<i32> {
        values
            .iter()
            .map(|v| self.hconv_inv.get(v).copied().unwrap_or(*v))
            .collect()
    }

    pub fn display(&self) -> Vec<i32> {
        self.convert_display(&self.data)
    }

    /// `(stage_name, end_time)` rows, derived from the current vector.
    pub fn table(&self, time: &[f64]) -> Result<Vec<(String, f64)>> {
        hypnoio::sample_to_time(&self.data, time, &self.stages)
    }

    /// Sample indices where the stage changes.
    pub fn transitions(&self) -> Vec<usize> {
        self.data
            .windows(2)
            .enumerate()
            .filter(|(_, w)| w[0] != w[1])
            .map(|(i, _)| i + 1)
            .collect()
    }
}

fn blank_value(stages: &StageDict) -> i32 {
    stages
        .value_of("Wake")
        .or_else(|| stages.states().first().map(|s| s.value))
        .unwrap_or(0)
}

/// Storage -> display codes: the i-th stage of `href` takes the i-th smallest value.
pub fn display_maps(stages: &StageDict) -> (HashMap<i32, i32>, HashMap<i32, i32>) {
    let mut sorted = stages.values();
    sorted.sort_unstable();
    let mut hconv = HashMap::new();
    let mut hconv_inv = HashMap::new();
    for (name, display) in stages.href().iter().zip(sorted) {
        if let Some(storage) = stages.value_of(name) {
            hconv.insert(storage, display);
            hconv_inv.insert(display, storage);
        }
    }
    (hconv, hconv_inv)
}
