//! Per-channel preprocessing: demean, detrend and zero-phase IIR filtering.

use ndarray::{Array2, Axis};
use rayon::prelude::*;
use sci_rs::signal::filter::design::Sos;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::iir::{self, FilterBand, FilterMethod};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocSettings {
    pub demean: bool,
    pub detrend: bool,
    pub filt: bool,
    pub fband: FilterBand,
    pub fstart: f64,
    pub fend: f64,
    pub fmethod: FilterMethod,
    pub forder: usize,
}

impl Default for PreprocSettings {
    fn default() -> Self {
        Self {
            demean: false,
            detrend: false,
            filt: false,
            fband: FilterBand::Bandpass,
            fstart: 12.0,
            fend: 16.0,
            fmethod: FilterMethod::Butterworth,
            forder: 3,
        }
    }
}

impl PreprocSettings {
    pub fn is_identity(&self) -> bool {
        !self.demean && !self.detrend && !self.filt
    }

    pub fn validate(&self, sf: f64) -> Result<()> {
        if self.filt {
            iir::design(self.fmethod, self.fband, self.forder, self.fstart, self.fend, sf)?;
        }
        Ok(())
    }
}

/// Settings bound to a sampling rate, with the filter designed once.
pub struct Pipeline {
    settings: PreprocSettings,
    sf: f64,
    sos: Option<Vec<Sos<f64>>>,
}

impl Pipeline {
    pub fn new(settings: PreprocSettings, sf: f64) -> Result<Self> {
        let sos = if settings.filt {
            Some(iir::design(
                settings.fmethod,
                settings.fband,
                settings.forder,
                settings.fstart,
                settings.fend,
                sf,
            )?)
        } else {
            None
        };
        Ok(Self { settings, sf, sos })
    }

    pub fn settings(&self) -> &PreprocSettings {
        &self.settings
    }

    pub fn sf(&self) -> f64 {
        self.sf
    }

    pub fn apply_1d(&self, x: &mut [f32]) {
        if self.settings.demean {
            demean(x);
        }
        if self.settings.detrend {
            detrend(x);
        }
        if let Some(sos) = &self.sos
            && !iir::filtfilt(sos, x)
        {
            log::debug!("signal of {} samples too short to filter", x.len());
        }
    }

    /// Runs every row of `data` through the pipeline, channels in parallel.
    pub fn apply(&self, data: &mut Array2<f32>) {
        if self.settings.is_identity() {
            return;
        }
        let n_cols = data.ncols();
        if n_cols == 0 {
            return;
        }
        match data.as_slice_mut() {
            Some(flat) => flat
                .par_chunks_mut(n_cols)
                .for_each(|row| self.apply_1d(row)),
            None => {
                for mut row in data.axis_iter_mut(Axis(0)) {
                    let mut owned = row.to_vec();
                    self.apply_1d(&mut owned);
                    for (dst, src) in row.iter_mut().zip(owned) {
                        *dst = src;
                    }
                }
            }
        }
    }
}

/// Pending settings plus the pipeline actually applied to the display.
pub struct PreprocState {
    pending: PreprocSettings,
    applied: Pipeline,
    dirty: bool,
}

impl PreprocState {
    pub fn new(sf: f64) -> Self {
        let applied = Pipeline {
            settings: PreprocSettings::default(),
            sf,
            sos: None,
        };
        Self {
            pending: PreprocSettings::default(),
            applied,
            dirty: false,
        }
    }

    pub fn pending(&self) -> &PreprocSettings {
        &self.pending
    }

    pub fn applied(&self) -> &Pipeline {
        &self.applied
    }

    /// Whether the "Apply" action has something to do.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Stores new settings after validating them; nothing changes on error.
    pub fn set(&mut self, settings: PreprocSettings) -> Result<()> {
        settings.validate(self.applied.sf)?;
        self.dirty = settings != *self.applied.settings();
        self.pending = settings;
        Ok(())
    }

    pub fn apply(&mut self) -> Result<()> {
        self.applied = Pipeline::new(self.pending.clone(), self.applied.sf)?;
        self.dirty = false;
        Ok(())
    }
}

pub fn demean(x: &mut [f32]) {
    if x.is_empty() {
        return;
    }
    let mean = x.iter().map(|&v| f64::from(v)).sum::<f64>() / x.len() as f64;
    for v in x.iter_mut() {
        *v = (f64::from(*v) - mean) as f32;
    }
}

/// Removes the least-squares line.
pub fn detrend(x: &mut [f32]) {
    let n = x.len();
    if n < 2 {
        demean(x);
        return;
    }
    let nf = n as f64;
    let t_mean = (nf - 1.0) / 2.0;
    let x_mean = x.iter().map(|&v| f64::from(v)).sum::<f64>() / nf;
    let (mut sxy, mut sxx) = (0.0, 0.0);
    for (i, &v) in x.iter().enumerate() {
        let dt = i as f64 - t_mean;
        sxy += dt * (f64::from(v) - x_mean);
        sxx += dt * dt;
    }
    let slope = sxy / sxx;
    for (i, v) in x.iter_mut().enumerate() {
        let trend = x_mean + slope * (i as f64 - t_mean);
        *v = (f64::from(*v) - trend) as f32;
    }
}
