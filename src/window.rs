//! Viewing and scoring windows over the recording timebase.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SleepError};
use crate::spectral::SpectrogramSettings;

pub const DEFAULT_WINDOW_S: f64 = 30.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowController {
    window_start_s: f64,
    window_length_s: f64,
    window_step_s: f64,
    scoring_window_s: f64,
    locked: bool,
    /// Last time stamp of the recording.
    t_max: f64,
    sf: f64,
}

impl WindowController {
    pub fn new(t_max: f64, sf: f64) -> Self {
        let length = DEFAULT_WINDOW_S.min(t_max).max(1.0 / sf);
        Self {
            window_start_s: 0.0,
            window_length_s: length,
            window_step_s: length,
            scoring_window_s: length,
            locked: true,
            t_max: t_max.max(0.0),
            sf,
        }
    }

    pub fn window_start_s(&self) -> f64 {
        self.window_start_s
    }

    pub fn window_length_s(&self) -> f64 {
        self.window_length_s
    }

    pub fn window_step_s(&self) -> f64 {
        self.window_step_s
    }

    pub fn scoring_window_s(&self) -> f64 {
        self.scoring_window_s
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn t_max(&self) -> f64 {
        self.t_max
    }

    fn max_start(&self) -> f64 {
        (self.t_max - self.window_length_s).max(0.0)
    }

    fn clamp_start(&mut self) {
        self.window_start_s = self.window_start_s.clamp(0.0, self.max_start());
    }

    pub fn set_window_start(&mut self, t: f64) {
        self.window_start_s = if t.is_finite() { t } else { 0.0 };
        self.clamp_start();
    }

    pub fn next_window(&mut self) {
        self.set_window_start(self.window_start_s + self.window_step_s);
    }

    pub fn prev_window(&mut self) {
        self.set_window_start(self.window_start_s - self.window_step_s);
    }

    /// Non-positive steps are clamped to one sample period.
    pub fn set_window_step(&mut self, step: f64) {
        let min_step = 1.0 / self.sf;
        if step.is_nan() || step < min_step {
            log::warn!("window step {step} s is invalid, clamping to {min_step} s");
            self.window_step_s = min_step;
        } else {
            self.window_step_s = step;
        }
    }

    pub fn resize_signal_window(&mut self, length: f64) -> Result<()> {
        if !length.is_finite() || length <= 0.0 {
            return Err(SleepError::InvalidArgument(format!(
                "window length must be positive, got {length}"
            )));
        }
        self.window_length_s = length.min(self.t_max).max(1.0 / self.sf);
        if self.locked {
            self.scoring_window_s = self.window_length_s;
        }
        self.clamp_start();
        Ok(())
    }

    pub fn resize_scoring_window(&mut self, length: f64) -> Result<()> {
        if self.locked {
            return Err(SleepError::InvalidArgument(
                "scoring window is locked to the signal window".to_owned(),
            ));
        }
        if !length.is_finite() || length <= 0.0 {
            return Err(SleepError::InvalidArgument(format!(
                "scoring window must be positive, got {length}"
            )));
        }
        self.scoring_window_s = length;
        Ok(())
    }

    pub fn lock_toggle(&mut self, locked: bool) {
        self.locked = locked;
        if locked {
            self.scoring_window_s = self.window_length_s;
        }
    }

    pub fn scoring_window_samples(&self) -> usize {
        (self.scoring_window_s * self.sf).round() as usize
    }

    pub fn start_sample(&self) -> usize {
        (self.window_start_s * self.sf).round() as usize
    }

    /// Half-open sample range of the signal window.
    pub fn window_samples(&self, n_points: usize) -> (usize, usize) {
        let start = self.start_sample().min(n_points);
        let len = (self.window_length_s * self.sf).round() as usize;
        (start, (start + len).min(n_points))
    }

    /// Half-open sample range one stage insertion covers.
    pub fn scoring_samples(&self, n_points: usize) -> (usize, usize) {
        let start = self.start_sample().min(n_points);
        (start, (start + self.scoring_window_samples()).min(n_points))
    }
}

/// Amplitude range of one channel on screen.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Amplitude {
    pub ymin: f64,
    pub ymax: f64,
    pub symmetric: bool,
    pub auto: bool,
}

impl Default for Amplitude {
    fn default() -> Self {
        Self {
            ymin: -100.0,
            ymax: 100.0,
            symmetric: true,
            auto: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelView {
    pub visible: Vec<bool>,
    pub amplitudes: Vec<Amplitude>,
}

impl ChannelView {
    pub fn new(n_channels: usize) -> Self {
        Self {
            visible: vec![true; n_channels],
            amplitudes: vec![Amplitude::default(); n_channels],
        }
    }

    pub fn visible_channels(&self) -> Vec<usize> {
        self.visible
            .iter()
            .enumerate()
            .filter_map(|(i, &v)| v.then_some(i))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColorbarSettings {
    pub cmap: String,
    pub clim: Option<[f64; 2]>,
    pub reverse: bool,
}

impl Default for ColorbarSettings {
    fn default() -> Self {
        Self {
            cmap: "viridis".to_owned(),
            clim: None,
            reverse: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopoSettings {
    pub visible: bool,
    pub cmap: String,
    pub clim: Option<[f64; 2]>,
}

/// Everything on screen besides the data itself.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewState {
    pub channels: ChannelView,
    pub spectrogram: SpectrogramSettings,
    pub colorbar: ColorbarSettings,
    pub topo: TopoSettings,
    pub tab: String,
    pub grid: bool,
}

impl ViewState {
    pub fn new(n_channels: usize) -> Self {
        Self {
            channels: ChannelView::new(n_channels),
            spectrogram: SpectrogramSettings::default(),
            colorbar: ColorbarSettings::default(),
            topo: TopoSettings::default(),
            tab: "Panels".to_owned(),
            grid: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;

    #[test]
    fn start_stays_inside_the_recording() {
        let mut rng = StdRng::seed_from_u64(5);
        for _ in 0..100 {
            let t_max = rng.gen_range(10.0..5000.0);
            let mut w = WindowController::new(t_max, 100.0);
            w.resize_signal_window(rng.gen_range(1.0..60.0)).unwrap();
            w.set_window_step(rng.gen_range(-10.0..90.0));
            for _ in 0..200 {
                if rng.gen_bool(0.6) {
                    w.next_window();
                } else {
                    w.prev_window();
                }
                let start = w.window_start_s();
                assert!(start >= 0.0);
                assert!(start <= (w.t_max() - w.window_length_s()).max(0.0) + 1e-9);
            }
        }
    }

    #[test]
    fn locked_windows_follow_the_signal_window() {
        let mut rng = StdRng::seed_from_u64(9);
        let mut w = WindowController::new(3600.0, 100.0);
        w.lock_toggle(false);
        w.resize_scoring_window(5.0).unwrap();
        w.lock_toggle(true);
        assert_eq!(w.scoring_window_s(), w.window_length_s());
        for _ in 0..50 {
            w.resize_signal_window(rng.gen_range(0.5..120.0)).unwrap();
            assert_eq!(w.scoring_window_s(), w.window_length_s());
        }
        assert!(w.resize_scoring_window(10.0).is_err());
    }

    #[test]
    fn negative_steps_are_clamped() {
        let mut w = WindowController::new(100.0, 10.0);
        w.set_window_start(50.0);
        w.set_window_step(-30.0);
        assert_eq!(w.window_step_s(), 0.1);
        w.next_window();
        assert!((w.window_start_s() - 50.1).abs() < 1e-9);
    }

    #[test]
    fn sample_ranges() {
        let mut w = WindowController::new(3599.99, 100.0);
        assert_eq!(w.scoring_samples(360_000), (0, 3000));
        w.set_window_start(1e9);
        assert!((w.window_start_s() - 3569.99).abs() < 1e-9);
        assert_eq!(w.window_samples(360_000), (356_999, 359_999));
        assert!(w.resize_signal_window(0.0).is_err());
    }
}
