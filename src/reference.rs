use ndarray::{Array2, Axis};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SleepError};

/// How channels are re-referenced before display and detection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reference {
    #[default]
    AsRecorded,
    /// Subtract one channel from every other one; the reference row is removed.
    Channel(usize),
    /// Each pair `(a, b)` yields the row `a - b`.
    Bipolar(Vec<(usize, usize)>),
    Average,
}

impl Reference {
    /// Re-referenced matrix and the matching channel names.
    pub fn apply(&self, data: &Array2<f32>, channels: &[String]) -> Result<(Array2<f32>, Vec<String>)> {
        match self {
            Self::AsRecorded => Ok((data.clone(), channels.to_vec())),
            Self::Channel(idx) => compute_single_reference(data, channels, *idx),
            Self::Bipolar(pairs) => compute_bipolar(data, channels, pairs),
            Self::Average => Ok((compute_average_reference(data), channels.to_vec())),
        }
    }
}

fn check_index(idx: usize, n: usize) -> Result<()> {
    if idx < n {
        Ok(())
    } else {
        Err(SleepError::OutOfRange {
            what: "reference channel index",
            value: idx as f64,
        })
    }
}

pub fn compute_single_reference(
    data: &Array2<f32>,
    channels: &[String],
    idx: usize,
) -> Result<(Array2<f32>, Vec<String>)> {
    let num_channels = data.nrows();
    check_index(idx, num_channels)?;
    if num_channels < 2 {
        return Err(SleepError::InvalidArgument(
            "single reference needs at least two channels".to_owned(),
        ));
    }
    let reference = data.row(idx).to_owned();
    let kept: Vec<usize> = (0..num_channels).filter(|&c| c != idx).collect();
    let mut out = data.select(Axis(0), &kept);
    for mut row in out.axis_iter_mut(Axis(0)) {
        row -= &reference;
    }
    let names = kept.iter().map(|&c| channels[c].clone()).collect();
    Ok((out, names))
}

pub fn compute_bipolar(
    data: &Array2<f32>,
    channels: &[String],
    pairs: &[(usize, usize)],
) -> Result<(Array2<f32>, Vec<String>)> {
    if pairs.is_empty() {
        return Err(SleepError::InvalidArgument("bipolar montage has no pairs".to_owned()));
    }
    let num_channels = data.nrows();
    let mut out = Array2::zeros((pairs.len(), data.ncols()));
    let mut names = Vec::with_capacity(pairs.len());
    for (k, &(a, b)) in pairs.iter().enumerate() {
        check_index(a, num_channels)?;
        check_index(b, num_channels)?;
        let mut row = out.row_mut(k);
        row.assign(&data.row(a));
        row -= &data.row(b);
        names.push(format!("{}-{}", channels[a], channels[b]));
    }
    Ok((out, names))
}

pub fn compute_average_reference(data: &Array2<f32>) -> Array2<f32> {
    if data.is_empty() {
        return data.clone();
    }
    let Some(average) = data.mean_axis(Axis(0)) else {
        return data.clone();
    };
    let mut average_ref = data.clone();
    for mut row in average_ref.axis_iter_mut(Axis(0)) {
        row -= &average;
    }
    average_ref
}
