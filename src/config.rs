//! Session config: a flat JSON object of view and navigation state.
//!
//! Loading is additive. Keys are applied one at a time; a key that no longer
//! exists or fails to apply is reported and skipped.

use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::{Result, SleepError};
use crate::reference::Reference;
use crate::session::ScoringSession;
use crate::signal::PreprocSettings;
use crate::window::Amplitude;

/// Application order. The reference comes first as it can change the channel
/// count the per-channel keys are checked against. Locking comes before the
/// scoring window and the window length before its start.
const KEYS: [&str; 26] = [
    "Reference",
    "Preproc",
    "Channel_Visible",
    "Channel_Amplitude",
    "Spec_Visible",
    "Spec_Channel",
    "Spec_Nfft",
    "Spec_Overlap",
    "Spec_Fstart",
    "Spec_Fend",
    "Spec_Cmap",
    "Cbar_Cmap",
    "Cbar_Clim",
    "Cbar_Reverse",
    "Topo_Visible",
    "Topo_Cmap",
    "Topo_Clim",
    "Win_Locked",
    "Win_Length",
    "Scoring_Window",
    "Win_Step",
    "Win_Start",
    "Tab",
    "Grid",
    "Detect_On_Preproc",
    "Version",
];

const VERSION: u32 = 1;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionConfig(Map<String, Value>);

fn value<T: DeserializeOwned>(raw: &Value) -> Result<T> {
    Ok(serde_json::from_value(raw.clone())?)
}

fn to_value<T: Serialize>(v: T) -> Value {
    serde_json::to_value(v).unwrap_or(Value::Null)
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        match serde_json::from_str(text)? {
            Value::Object(map) => Ok(Self(map)),
            _ => Err(SleepError::InvalidArgument(
                "session config must be a JSON object".to_owned(),
            )),
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config = Self::from_json_str(&text)?;
        log::info!("Loaded {} config keys from {}", config.0.len(), path.as_ref().display());
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = std::fs::File::create(path.as_ref())?;
        serde_json::to_writer_pretty(std::io::BufWriter::new(file), &self.0)?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: &str, v: impl Serialize) {
        self.0.insert(key.to_owned(), to_value(v));
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Current state of `session`, in the same keys [`Self::apply`] reads.
    pub fn snapshot(session: &ScoringSession) -> Self {
        let view = session.view();
        let window = session.window();
        let mut config = Self::new();
        config.insert("Version", VERSION);
        config.insert("Channel_Visible", &view.channels.visible);
        config.insert("Channel_Amplitude", &view.channels.amplitudes);
        config.insert("Reference", session.reference());
        config.insert("Preproc", session.preproc().applied().settings());
        config.insert("Spec_Visible", view.spectrogram.visible);
        config.insert("Spec_Channel", view.spectrogram.channel);
        config.insert("Spec_Nfft", view.spectrogram.nfft_s);
        config.insert("Spec_Overlap", view.spectrogram.overlap_s);
        config.insert("Spec_Fstart", view.spectrogram.fstart);
        config.insert("Spec_Fend", view.spectrogram.fend);
        config.insert("Spec_Cmap", &view.spectrogram.cmap);
        config.insert("Cbar_Cmap", &view.colorbar.cmap);
        config.insert("Cbar_Clim", view.colorbar.clim);
        config.insert("Cbar_Reverse", view.colorbar.reverse);
        config.insert("Topo_Visible", view.topo.visible);
        config.insert("Topo_Cmap", &view.topo.cmap);
        config.insert("Topo_Clim", view.topo.clim);
        config.insert("Win_Locked", window.is_locked());
        config.insert("Win_Length", window.window_length_s());
        config.insert("Scoring_Window", window.scoring_window_s());
        config.insert("Win_Step", window.window_step_s());
        config.insert("Win_Start", window.window_start_s());
        config.insert("Tab", &view.tab);
        config.insert("Grid", view.grid);
        config.insert("Detect_On_Preproc", session.detect_on_preprocessed());
        config
    }

    /// Applies every key it knows about and returns what was skipped.
    /// Each skipped key has been logged already.
    pub fn apply(&self, session: &mut ScoringSession) -> Vec<SleepError> {
        let mut warnings = Vec::new();
        for key in KEYS {
            let Some(raw) = self.0.get(key) else {
                continue;
            };
            if let Err(err) = apply_key(session, key, raw) {
                log::warn!("Config key {key} not applied: {err}");
                warnings.push(err);
            }
        }
        for key in self.0.keys().filter(|k| !KEYS.contains(&k.as_str())) {
            let err = SleepError::ConfigKeyUnknown(key.clone());
            log::warn!("{err}; ignored");
            warnings.push(err);
        }
        warnings
    }
}

fn apply_key(session: &mut ScoringSession, key: &str, raw: &Value) -> Result<()> {
    match key {
        "Channel_Visible" => {
            let visible: Vec<bool> = value(raw)?;
            let channels = &mut session.view_mut().channels;
            check_len(visible.len(), channels.visible.len())?;
            channels.visible = visible;
        }
        "Channel_Amplitude" => {
            let amplitudes: Vec<Amplitude> = value(raw)?;
            let channels = &mut session.view_mut().channels;
            check_len(amplitudes.len(), channels.amplitudes.len())?;
            channels.amplitudes = amplitudes;
        }
        "Reference" => {
            let reference: Reference = value(raw)?;
            if &reference != session.reference() {
                session.set_reference(reference)?;
            }
        }
        "Preproc" => {
            let settings: PreprocSettings = value(raw)?;
            session.set_preproc(settings)?;
            session.apply_preproc()?;
        }
        "Spec_Visible" => session.view_mut().spectrogram.visible = value(raw)?,
        "Spec_Channel" => {
            let channel: usize = value(raw)?;
            if channel >= session.channels().len() {
                return Err(SleepError::OutOfRange {
                    what: "spectrogram channel",
                    value: channel as f64,
                });
            }
            session.view_mut().spectrogram.channel = channel;
        }
        "Spec_Nfft" => session.view_mut().spectrogram.nfft_s = positive(raw, "spectrogram nfft")?,
        "Spec_Overlap" => session.view_mut().spectrogram.overlap_s = value(raw)?,
        "Spec_Fstart" => session.view_mut().spectrogram.fstart = value(raw)?,
        "Spec_Fend" => session.view_mut().spectrogram.fend = value(raw)?,
        "Spec_Cmap" => session.view_mut().spectrogram.cmap = value(raw)?,
        "Cbar_Cmap" => session.view_mut().colorbar.cmap = value(raw)?,
        "Cbar_Clim" => session.view_mut().colorbar.clim = value(raw)?,
        "Cbar_Reverse" => session.view_mut().colorbar.reverse = value(raw)?,
        "Topo_Visible" => session.view_mut().topo.visible = value(raw)?,
        "Topo_Cmap" => session.view_mut().topo.cmap = value(raw)?,
        "Topo_Clim" => session.view_mut().topo.clim = value(raw)?,
        "Win_Locked" => session.lock_toggle(value(raw)?),
        "Win_Length" => session.resize_signal_window(value(raw)?)?,
        "Scoring_Window" => {
            let length: f64 = value(raw)?;
            if !session.window().is_locked() {
                session.resize_scoring_window(length)?;
            }
        }
        "Win_Step" => session.set_window_step(value(raw)?),
        "Win_Start" => session.set_window_start(value(raw)?),
        "Tab" => session.view_mut().tab = value(raw)?,
        "Grid" => session.view_mut().grid = value(raw)?,
        "Detect_On_Preproc" => session.set_detect_on_preprocessed(value(raw)?),
        "Version" => {
            let version: u32 = value(raw)?;
            if version > VERSION {
                log::warn!("Config version {version} is newer than {VERSION}");
            }
        }
        _ => return Err(SleepError::ConfigKeyUnknown(key.to_owned())),
    }
    Ok(())
}

fn check_len(got: usize, expected: usize) -> Result<()> {
    if got == expected {
        Ok(())
    } else {
        Err(SleepError::InvalidArgument(format!(
            "config lists {got} channels, the session has {expected}"
        )))
    }
}

fn positive(raw: &Value, what: &'static str) -> Result<f64> {
    let v: f64 = value(raw)?;
    if v > 0.0 {
        Ok(v)
    } else {
        Err(SleepError::OutOfRange { what, value: v })
    }
}

#[cfg(test)]
mod tests {
    use ndarray::Array2;
    use tempfile::tempdir;

    use super::*;
    use crate::Recording;
    use crate::stages::StageDict;

    fn session() -> ScoringSession {
        let data = Array2::from_shape_fn((3, 100 * 600), |(c, t)| (c as f32) * ((t % 13) as f32));
        let channels = vec!["Cz".to_owned(), "Pz".to_owned(), "Oz".to_owned()];
        let rec = Recording::from_array(data, 100.0, channels).unwrap();
        ScoringSession::from_recording(rec, StageDict::default())
    }

    #[test]
    fn unknown_keys_only_warn() {
        let text = r#"{
            "FooBar": 12,
            "Win_Start": 120.0,
            "Win_Length": 20.0,
            "Win_Locked": false,
            "Scoring_Window": 10.0,
            "Channel_Visible": [true, false, true],
            "Spec_Nfft": 4.0,
            "Cbar_Cmap": "magma",
            "Tab": "Detections",
            "Grid": false
        }"#;
        let config = SessionConfig::from_json_str(text).unwrap();
        let mut s = session();
        let warnings = config.apply(&mut s);
        assert_eq!(warnings.len(), 1);
        assert!(matches!(&warnings[0], SleepError::ConfigKeyUnknown(k) if k == "FooBar"));

        assert_eq!(s.window().window_start_s(), 120.0);
        assert_eq!(s.window().window_length_s(), 20.0);
        assert!(!s.window().is_locked());
        assert_eq!(s.window().scoring_window_s(), 10.0);
        assert_eq!(s.view().channels.visible, vec![true, false, true]);
        assert_eq!(s.view().spectrogram.nfft_s, 4.0);
        assert_eq!(s.view().colorbar.cmap, "magma");
        assert_eq!(s.view().tab, "Detections");
        assert!(!s.view().grid);
    }

    #[test]
    fn channel_view_follows_a_single_channel_reference() {
        let mut s = session();
        s.set_reference(Reference::Channel(0)).unwrap();
        assert_eq!(s.channels().len(), 2);
        s.view_mut().channels.visible[1] = false;
        s.view_mut().channels.amplitudes[0].ymax = 40.0;
        let config = SessionConfig::snapshot(&s);

        let mut fresh = session();
        assert!(config.apply(&mut fresh).is_empty());
        assert_eq!(fresh.reference(), &Reference::Channel(0));
        assert_eq!(fresh.view().channels.visible, vec![true, false]);
        assert_eq!(fresh.view().channels.amplitudes[0].ymax, 40.0);
        assert_eq!(fresh.view(), s.view());
    }

    #[test]
    fn bad_values_are_skipped() {
        let mut config = SessionConfig::new();
        config.insert("Channel_Visible", [true]);
        config.insert("Spec_Channel", 7);
        config.insert("Spec_Nfft", -1.0);
        config.insert("Grid", "yes");
        config.insert("Tab", "Tools");
        let mut s = session();
        let warnings = config.apply(&mut s);
        assert_eq!(warnings.len(), 4);
        assert_eq!(s.view().tab, "Tools");
        assert_eq!(s.view().channels.visible, vec![true; 3]);
    }

    #[test]
    fn snapshot_survives_a_file() {
        let mut s = session();
        s.resize_signal_window(15.0).unwrap();
        s.set_window_start(300.0);
        s.view_mut().channels.visible[1] = false;
        s.view_mut().topo.visible = true;
        s.set_reference(Reference::Average).unwrap();

        let dir = tempdir().unwrap();
        let path = dir.path().join("session.json");
        SessionConfig::snapshot(&s).save(&path).unwrap();
        let loaded = SessionConfig::load(&path).unwrap();
        assert_eq!(loaded, SessionConfig::snapshot(&s));

        let mut fresh = session();
        assert!(loaded.apply(&mut fresh).is_empty());
        assert_eq!(fresh.window(), s.window());
        assert_eq!(fresh.view(), s.view());
        assert_eq!(fresh.reference(), &Reference::Average);
    }

    #[test]
    fn rejects_non_objects() {
        assert!(SessionConfig::from_json_str("[1, 2]").is_err());
        assert!(SessionConfig::from_json_str("{").is_err());
    }
}
