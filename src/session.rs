//! The scoring session: single owner of the recording, hypnogram,
//! detections, annotations and view state.
//!
//! Every mutation goes through a session method, and each command sends
//! its notifications synchronously to the registered listeners before
//! returning. Listeners get a read-only [`SessionView`], so they cannot
//! feed back into the session from inside a callback.

use std::path::{Path, PathBuf};

use ndarray::{Array2, Axis, s};

use crate::annotations::{AnnotationSource, AnnotationStore};
use crate::detection::{CancelToken, DetectionKey, DetectionStore, DetectorOutput, DetectorRegistry};
use crate::error::{Result, SleepError};
use crate::hypno::Hypnogram;
use crate::hypnoio::{self, HypnoVersion, WriteOptions};
use crate::recording::{self, SleepOptions};
use crate::reference::Reference;
use crate::signal::{PreprocSettings, PreprocState};
use crate::stages::StageDict;
use crate::stats::SleepStats;
use crate::window::{ViewState, WindowController};
use crate::Recording;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionEvent {
    HypnoChanged,
    WindowChanged,
    DetectionChanged,
    AnnotationChanged,
    PreprocChanged,
}

/// What a listener may look at while handling an event.
pub struct SessionView<'a> {
    pub recording: &'a Recording,
    pub channels: &'a [String],
    pub hypno: &'a Hypnogram,
    pub window: &'a WindowController,
    pub detections: &'a DetectionStore,
    pub annotations: &'a AnnotationStore,
    pub preproc: &'a PreprocSettings,
    pub view: &'a ViewState,
}

type Listener = Box<dyn FnMut(SessionEvent, &SessionView<'_>)>;

/// One scoring command, with what it overwrote.
#[derive(Debug, Clone, PartialEq)]
struct ScoreEntry {
    start: usize,
    end: usize,
    stage: i32,
    previous: Vec<i32>,
}

pub struct ScoringSession {
    recording: Recording,
    reference: Reference,
    /// Re-referenced matrix the views and detectors read.
    data: Array2<f32>,
    channels: Vec<String>,
    hypno: Hypnogram,
    hypno_metadata: Vec<(String, String)>,
    window: WindowController,
    view: ViewState,
    preproc: PreprocState,
    /// Run detectors on the preprocessed signal instead of the raw one.
    detect_on_preprocessed: bool,
    registry: DetectorRegistry,
    detections: DetectionStore,
    annotations: AnnotationStore,
    score_log: Vec<ScoreEntry>,
    listeners: Vec<Listener>,
}

impl ScoringSession {
    /// Opens `path`, then seeds the hypnogram and annotations.
    ///
    /// A malformed hypnogram file is logged and replaced by a blank one.
    pub fn open(
        path: impl AsRef<Path>,
        hypno: Option<&Path>,
        annotations: Option<AnnotationSource<'_>>,
        options: &SleepOptions,
    ) -> Result<Self> {
        let stages = match &options.href {
            Some(href) => options.stages.with_href(href)?,
            None => options.stages.clone(),
        };
        let recording = recording::open(path, options)?;
        let mut session = Self::from_recording(recording, stages);
        if let Some(hypno_path) = hypno {
            session.load_hypno(hypno_path)?;
        }
        if let Some(source) = annotations {
            session.load_annotations(source)?;
        }
        Ok(session)
    }

    pub fn from_recording(recording: Recording, stages: StageDict) -> Self {
        let mut annotations = AnnotationStore::new();
        if !recording.annotations_from_file.is_empty() {
            let markers = recording.annotations_from_file.clone();
            if let Err(err) = annotations.load(AnnotationSource::File(&markers)) {
                log::warn!("Ignoring markers embedded in the recording: {err}");
            }
        }
        let n_channels = recording.n_channels();
        Self {
            data: recording.data.clone(),
            channels: recording.channels.clone(),
            hypno: Hypnogram::blank(recording.n_points(), stages),
            hypno_metadata: Vec::new(),
            window: WindowController::new(recording.duration(), recording.sf),
            view: ViewState::new(n_channels),
            preproc: PreprocState::new(recording.sf),
            detect_on_preprocessed: false,
            registry: DetectorRegistry::default(),
            detections: DetectionStore::new(),
            annotations,
            score_log: Vec::new(),
            listeners: Vec::new(),
            reference: Reference::AsRecorded,
            recording,
        }
    }

    pub fn on_change<F>(&mut self, callback: F)
    where
        F: FnMut(SessionEvent, &SessionView<'_>) + 'static,
    {
        self.listeners.push(Box::new(callback));
    }

    fn notify(&mut self, event: SessionEvent) {
        let view = SessionView {
            recording: &self.recording,
            channels: &self.channels,
            hypno: &self.hypno,
            window: &self.window,
            detections: &self.detections,
            annotations: &self.annotations,
            preproc: self.preproc.applied().settings(),
            view: &self.view,
        };
        for listener in &mut self.listeners {
            listener(event, &view);
        }
    }

    pub fn recording(&self) -> &Recording {
        &self.recording
    }

    pub fn sf(&self) -> f64 {
        self.recording.sf
    }

    pub fn time(&self) -> &[f64] {
        &self.recording.time
    }

    pub fn n_points(&self) -> usize {
        self.recording.n_points()
    }

    /// Channel names after re-referencing.
    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    pub fn data(&self) -> &Array2<f32> {
        &self.data
    }

    pub fn hypno(&self) -> &Hypnogram {
        &self.hypno
    }

    pub fn stages(&self) -> &StageDict {
        self.hypno.stages()
    }

    pub fn window(&self) -> &WindowController {
        &self.window
    }

    pub fn view(&self) -> &ViewState {
        &self.view
    }

    pub fn detections(&self) -> &DetectionStore {
        &self.detections
    }

    pub fn annotations(&self) -> &AnnotationStore {
        &self.annotations
    }

    pub fn preproc(&self) -> &PreprocState {
        &self.preproc
    }

    pub fn reference(&self) -> &Reference {
        &self.reference
    }

    // ---- hypnogram ------------------------------------------------------

    pub fn load_hypno(&mut self, path: &Path) -> Result<()> {
        match hypnoio::read_hypno(path, self.hypno.stages(), &self.recording.time) {
            Ok(file) => {
                self.hypno.replace(file.values)?;
                self.hypno_metadata = file.metadata;
            }
            Err(err @ SleepError::HypnogramFormat { .. }) => {
                log::warn!("{err}; loading a blank hypnogram instead");
                self.hypno.clean();
                self.hypno_metadata.clear();
            }
            Err(err) => return Err(err),
        }
        self.score_log.clear();
        self.notify(SessionEvent::HypnoChanged);
        Ok(())
    }

    pub fn save_hypno(&self, path: impl AsRef<Path>, version: HypnoVersion) -> Result<()> {
        let mut metadata = vec![("Duration_sec".to_owned(), format!("{}", self.recording.duration()))];
        if let Some(datafile) = &self.recording.path {
            metadata.push(("Datafile".to_owned(), datafile.display().to_string()));
        }
        metadata.extend(
            self.hypno_metadata
                .iter()
                .filter(|(k, _)| k != "Duration_sec" && k != "Datafile")
                .cloned(),
        );
        let options = WriteOptions {
            version,
            metadata,
            ..Default::default()
        };
        self.save_hypno_with(path, &options)
    }

    pub fn save_hypno_with(&self, path: impl AsRef<Path>, options: &WriteOptions) -> Result<()> {
        hypnoio::write_hypno(
            path,
            self.hypno.as_slice(),
            &self.recording.time,
            self.hypno.stages(),
            options,
        )
    }

    /// The hypnogram stretched back to the sampling rate of the file.
    pub fn hypno_original_rate(&self) -> Vec<i32> {
        hypnoio::oversample(self.hypno.as_slice(), self.recording.n_points_orig)
    }

    /// Writes `code` over the scoring window and moves to the next window.
    pub fn score_current(&mut self, code: i32) -> Result<()> {
        let (start, end) = self.window.scoring_samples(self.n_points());
        self.score_range(start, end, code)?;
        self.window.next_window();
        self.notify(SessionEvent::WindowChanged);
        Ok(())
    }

    pub fn score_shortcut(&mut self, shortcut: &str) -> Result<()> {
        let code = self
            .hypno
            .stages()
            .by_shortcut(shortcut)
            .map(|s| s.value)
            .ok_or_else(|| SleepError::UnknownStage(shortcut.to_owned()))?;
        self.score_current(code)
    }

    /// Scores the half-open sample run `[start, end)`.
    pub fn score_range(&mut self, start: usize, end: usize, code: i32) -> Result<()> {
        let previous = self.hypno.snapshot(start, end);
        self.hypno.set_stage(start, end, code)?;
        self.score_log.push(ScoreEntry {
            start,
            end,
            stage: code,
            previous,
        });
        self.notify(SessionEvent::HypnoChanged);
        Ok(())
    }

    /// Reverts the last scoring command.
    pub fn undo(&mut self) -> bool {
        let Some(entry) = self.score_log.pop() else {
            return false;
        };
        self.hypno.restore(entry.start, &entry.previous);
        self.notify(SessionEvent::HypnoChanged);
        true
    }

    /// `(start_idx, end_idx, stage_name)` of every scoring command, oldest first.
    pub fn export_scoring_table(&self) -> Vec<(usize, usize, String)> {
        self.score_log
            .iter()
            .map(|e| {
                let name = self
                    .hypno
                    .stages()
                    .name_of(e.stage)
                    .map(str::to_owned)
                    .unwrap_or_else(|| e.stage.to_string());
                (e.start, e.end, name)
            })
            .collect()
    }

    pub fn clean_hypno(&mut self) {
        self.hypno.clean();
        self.score_log.clear();
        self.notify(SessionEvent::HypnoChanged);
    }

    pub fn stats(&self) -> SleepStats {
        SleepStats::compute(self.hypno.as_slice(), self.sf(), self.hypno.stages())
    }

    // ---- navigation -----------------------------------------------------

    pub fn set_window_start(&mut self, t: f64) {
        self.window.set_window_start(t);
        self.notify(SessionEvent::WindowChanged);
    }

    pub fn next_window(&mut self) {
        self.window.next_window();
        self.notify(SessionEvent::WindowChanged);
    }

    pub fn prev_window(&mut self) {
        self.window.prev_window();
        self.notify(SessionEvent::WindowChanged);
    }

    pub fn set_window_step(&mut self, step: f64) {
        self.window.set_window_step(step);
        self.notify(SessionEvent::WindowChanged);
    }

    pub fn resize_signal_window(&mut self, length: f64) -> Result<()> {
        self.window.resize_signal_window(length)?;
        self.notify(SessionEvent::WindowChanged);
        Ok(())
    }

    pub fn resize_scoring_window(&mut self, length: f64) -> Result<()> {
        self.window.resize_scoring_window(length)?;
        self.notify(SessionEvent::WindowChanged);
        Ok(())
    }

    pub fn lock_toggle(&mut self, locked: bool) {
        self.window.lock_toggle(locked);
        self.notify(SessionEvent::WindowChanged);
    }

    /// Centres the window on the `index`-th event of `key`.
    pub fn jump_to_detection(&mut self, key: &DetectionKey, index: usize) -> Option<f64> {
        let t = self.detections.jump_to(key, index, self.sf())?;
        self.set_window_start(t - self.window.window_length_s() / 2.0);
        Some(t)
    }

    pub fn jump_to_annotation(&mut self, index: usize) -> Option<f64> {
        let t = self.annotations.get(index)?.centre();
        self.set_window_start(t - self.window.window_length_s() / 2.0);
        Some(t)
    }

    pub fn view_mut(&mut self) -> &mut ViewState {
        &mut self.view
    }

    // ---- preprocessing ----------------------------------------------------

    /// Stages new settings; [`Self::apply_preproc`] makes them visible.
    pub fn set_preproc(&mut self, settings: PreprocSettings) -> Result<()> {
        self.preproc.set(settings)?;
        self.notify(SessionEvent::PreprocChanged);
        Ok(())
    }

    pub fn apply_preproc(&mut self) -> Result<()> {
        self.preproc.apply()?;
        self.notify(SessionEvent::PreprocChanged);
        Ok(())
    }

    pub fn set_detect_on_preprocessed(&mut self, on: bool) {
        self.detect_on_preprocessed = on;
    }

    pub fn detect_on_preprocessed(&self) -> bool {
        self.detect_on_preprocessed
    }

    /// Re-references every channel. Detections are dropped because channel
    /// names and rows may change.
    pub fn set_reference(&mut self, reference: Reference) -> Result<()> {
        let (data, channels) = reference.apply(&self.recording.data, &self.recording.channels)?;
        if channels.len() != self.channels.len() {
            self.view.channels = crate::window::ChannelView::new(channels.len());
        }
        self.data = data;
        self.channels = channels;
        self.reference = reference;
        self.detections.clear();
        self.notify(SessionEvent::PreprocChanged);
        self.notify(SessionEvent::DetectionChanged);
        Ok(())
    }

    /// Time stamps and preprocessed rows of the current signal window.
    pub fn window_data(&self) -> (&[f64], Array2<f32>) {
        let (start, end) = self.window.window_samples(self.n_points());
        let mut block = self.data.slice(s![.., start..end]).to_owned();
        self.preproc.applied().apply(&mut block);
        (&self.recording.time[start..end], block)
    }

    fn channel_for_detection(&self, row: usize) -> Vec<f32> {
        let mut x = self.data.index_axis(Axis(0), row).to_vec();
        if self.detect_on_preprocessed {
            self.preproc.applied().apply_1d(&mut x);
        }
        x
    }

    // ---- detections -------------------------------------------------------

    pub fn registry(&self) -> &DetectorRegistry {
        &self.registry
    }

    pub fn replace_detections<F>(&mut self, method: &str, detector: F)
    where
        F: Fn(&[f32], f64, &[f64], &[i32]) -> Result<DetectorOutput> + Send + Sync + 'static,
    {
        self.registry.replace_detections(method, detector);
    }

    fn channel_row(&self, channel: &str) -> Result<usize> {
        self.channels
            .iter()
            .position(|c| c == channel)
            .ok_or_else(|| SleepError::InvalidArgument(format!("no channel named '{channel}'")))
    }

    /// Runs `method` on `channel`. On failure the previous result is kept
    /// and the error is returned for the caller to surface.
    pub fn apply_detection(&mut self, channel: &str, method: &str) -> Result<usize> {
        let row = self.channel_row(channel)?;
        let x = self.channel_for_detection(row);
        let events = self
            .registry
            .run(method, channel, &x, self.sf(), &self.recording.time, self.hypno.as_slice())
            .inspect_err(|err| log::warn!("({channel}, {method}): {err}; keeping the previous result"))?;
        let n = events.len();
        log::info!("({channel}, {method}): {n} events");
        self.detections
            .insert(DetectionKey::new(channel, method), row, events, self.hypno.as_slice());
        self.notify(SessionEvent::DetectionChanged);
        Ok(n)
    }

    /// Runs `method` on several channels in parallel.
    ///
    /// Returns the per-channel failures; a cancelled run changes nothing.
    pub fn detect_all(&mut self, method: &str, channels: &[&str], cancel: &CancelToken) -> Result<Vec<SleepError>> {
        let rows = channels
            .iter()
            .map(|c| self.channel_row(c))
            .collect::<Result<Vec<_>>>()?;
        let data = if self.detect_on_preprocessed {
            let mut data = self.data.clone();
            self.preproc.applied().apply(&mut data);
            data
        } else {
            self.data.clone()
        };
        let results = self.registry.detect_all(
            method,
            &rows,
            &data,
            &self.channels,
            self.sf(),
            &self.recording.time,
            self.hypno.as_slice(),
            cancel,
        )?;
        let mut failures = Vec::new();
        for (row, result) in results {
            match result {
                Ok(events) => {
                    let key = DetectionKey::new(self.channels[row].clone(), method);
                    self.detections.insert(key, row, events, self.hypno.as_slice());
                }
                Err(err) => {
                    log::warn!("{err}; keeping the previous result");
                    failures.push(err);
                }
            }
        }
        self.notify(SessionEvent::DetectionChanged);
        Ok(failures)
    }

    pub fn reset_detections(&mut self) {
        self.detections.clear();
        self.notify(SessionEvent::DetectionChanged);
    }

    pub fn delete_detection(&mut self, key: &DetectionKey) -> bool {
        let deleted = self.detections.delete(key);
        if deleted {
            self.notify(SessionEvent::DetectionChanged);
        }
        deleted
    }

    pub fn set_detection_enabled(&mut self, key: &DetectionKey, enabled: bool) -> bool {
        let found = self.detections.set_enabled(key, enabled);
        if found {
            self.notify(SessionEvent::DetectionChanged);
        }
        found
    }

    // ---- annotations -------------------------------------------------------

    pub fn add_annotation(&mut self, start_s: f64, end_s: f64, signal_id: &str, text: &str) -> Result<usize> {
        let idx = self.annotations.add(start_s, end_s, signal_id, text)?;
        self.notify(SessionEvent::AnnotationChanged);
        Ok(idx)
    }

    pub fn load_annotations(&mut self, source: AnnotationSource<'_>) -> Result<usize> {
        let added = self.annotations.load(source)?;
        self.notify(SessionEvent::AnnotationChanged);
        Ok(added)
    }

    pub fn remove_annotation(&mut self, idx: usize) -> bool {
        let removed = self.annotations.remove(idx).is_some();
        if removed {
            self.notify(SessionEvent::AnnotationChanged);
        }
        removed
    }

    pub fn save_annotations(&self, path: impl AsRef<Path>) -> Result<()> {
        self.annotations.write(path)
    }

    pub fn path(&self) -> Option<&PathBuf> {
        self.recording.path.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use chrono::NaiveTime;
    use tempfile::tempdir;

    use super::*;
    use crate::RawRecording;
    use crate::detection::SPINDLES;

    fn session(n_channels: usize, seconds: usize, sf: f64) -> ScoringSession {
        let n = (seconds as f64 * sf) as usize;
        let data = Array2::from_shape_fn((n_channels, n), |(c, t)| ((c + 1) * (t % 7)) as f32);
        let channels = (0..n_channels).map(|c| format!("C{c}")).collect();
        let rec = Recording::from_array(data, sf, channels).unwrap();
        ScoringSession::from_recording(rec, StageDict::default())
    }

    fn recorder(session: &mut ScoringSession) -> Rc<RefCell<Vec<SessionEvent>>> {
        let events = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&events);
        session.on_change(move |event, _| sink.borrow_mut().push(event));
        events
    }

    #[test]
    fn load_and_score() {
        let sf_orig = 200.0;
        let n = 3600 * sf_orig as usize;
        let raw = RawRecording {
            sf: sf_orig,
            data: Array2::from_shape_fn((10, n), |(c, t)| (c + t % 50) as f32),
            channels: (0..10).map(|c| format!("EEG Fp{c}-REF")).collect(),
            start_time: NaiveTime::MIN,
            annotations: Vec::new(),
        };
        let options = SleepOptions {
            downsample: Some(100.0),
            ..Default::default()
        };
        let rec = recording::finalize(raw, None, &options).unwrap();
        let mut session = ScoringSession::from_recording(rec, StageDict::default());
        assert_eq!(session.sf(), 100.0);
        assert_eq!(session.n_points(), 360_000);
        assert_eq!(session.hypno().len(), 360_000);
        assert!(session.hypno().as_slice().iter().all(|&v| v == 0));
        assert_eq!(session.window().scoring_window_s(), 30.0);

        session.score_current(2).unwrap();
        assert!(session.hypno().as_slice()[..3000].iter().all(|&v| v == 2));
        assert_eq!(session.hypno().get(3000), Some(0));
        assert_eq!(session.window().window_start_s(), 30.0);
        assert_eq!(session.hypno_original_rate().len(), 720_000);
    }

    #[test]
    fn load_256_hz_uses_nearest_integer_stride() {
        let n = 3600 * 256;
        let raw = RawRecording {
            sf: 256.0,
            data: Array2::from_shape_fn((10, n), |(c, t)| (c + t % 50) as f32),
            channels: (0..10).map(|c| format!("EEG Fp{c}-REF")).collect(),
            start_time: NaiveTime::MIN,
            annotations: Vec::new(),
        };
        let options = SleepOptions {
            downsample: Some(100.0),
            ..Default::default()
        };
        let rec = recording::finalize(raw, None, &options).unwrap();
        assert_eq!(rec.dsf, 3);
        let mut session = ScoringSession::from_recording(rec, StageDict::default());
        assert!((session.sf() - 256.0 / 3.0).abs() < 1e-9);
        assert_eq!(session.n_points(), 307_200);
        assert_eq!(session.hypno().len(), 307_200);

        session.score_current(2).unwrap();
        assert!(session.hypno().as_slice()[..2560].iter().all(|&v| v == 2));
        assert_eq!(session.hypno().get(2560), Some(0));
        assert_eq!(session.hypno_original_rate().len(), n);
    }

    #[test]
    fn open_edf_with_hypnogram_and_annotations() {
        let dir = tempdir().unwrap();
        let edf = dir.path().join("night.edf");
        crate::edfio::tests::write_edf(&edf, &[("Cz", 200), ("Pz", 200)], 60, 1.0, |c, i| (c * 10 + i % 5) as i16, None);
        let hyp = dir.path().join("night.csv");
        std::fs::write(&hyp, "Wake,30\nN2,60\n").unwrap();
        let annot = dir.path().join("night_annot.csv");
        std::fs::write(&annot, "5,6,Cz,arousal\n").unwrap();

        let options = SleepOptions {
            downsample: Some(100.0),
            ..Default::default()
        };
        let session = ScoringSession::open(&edf, Some(&hyp), Some(AnnotationSource::Path(annot)), &options).unwrap();
        assert_eq!(session.sf(), 100.0);
        assert_eq!(session.n_points(), 6000);
        assert_eq!(session.hypno().get(2999), Some(0));
        assert_eq!(session.hypno().get(3000), Some(2));
        assert_eq!(session.annotations().len(), 1);
        assert_eq!(session.annotations().get(0).unwrap().signal_id, "Cz");
    }

    #[test]
    fn malformed_hypnogram_loads_blank() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.csv");
        std::fs::write(&path, "Wake,not-a-time\n").unwrap();
        let mut s = session(1, 60, 10.0);
        s.score_current(3).unwrap();
        s.load_hypno(&path).unwrap();
        assert!(s.hypno().as_slice().iter().all(|&v| v == 0));
        assert!(s.export_scoring_table().is_empty());
    }

    #[test]
    fn scoring_log_and_undo() {
        let mut s = session(1, 120, 10.0);
        s.score_current(2).unwrap();
        s.score_shortcut("3").unwrap();
        assert_eq!(
            s.export_scoring_table(),
            vec![(0, 300, "N2".to_owned()), (300, 600, "N3".to_owned())]
        );
        assert!(s.score_current(9).is_err());
        assert_eq!(s.export_scoring_table().len(), 2);

        assert!(s.undo());
        assert_eq!(s.hypno().get(300), Some(0));
        assert_eq!(s.hypno().get(299), Some(2));
        assert!(s.undo());
        assert!(!s.undo());
        assert!(s.hypno().as_slice().iter().all(|&v| v == 0));
    }

    #[test]
    fn one_notification_per_command_in_order() {
        let mut s = session(2, 300, 10.0);
        let events = recorder(&mut s);
        s.next_window();
        s.prev_window();
        s.score_current(1).unwrap();
        s.add_annotation(1.0, 1.0, "C0", "x").unwrap();
        s.reset_detections();
        assert_eq!(
            *events.borrow(),
            vec![
                SessionEvent::WindowChanged,
                SessionEvent::WindowChanged,
                SessionEvent::HypnoChanged,
                SessionEvent::WindowChanged,
                SessionEvent::AnnotationChanged,
                SessionEvent::DetectionChanged,
            ]
        );
    }

    #[test]
    fn listeners_see_the_new_window() {
        let mut s = session(1, 300, 10.0);
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        s.on_change(move |event, view| {
            if event == SessionEvent::WindowChanged {
                sink.borrow_mut().push(view.window.window_start_s());
            }
        });
        s.next_window();
        s.next_window();
        s.set_window_start(1e6);
        let seen = seen.borrow();
        assert_eq!(seen[..2], [30.0, 60.0]);
        assert!((seen[2] - 269.9).abs() < 1e-9);
    }

    #[test]
    fn failed_detection_keeps_previous_result() {
        let mut s = session(2, 60, 100.0);
        s.replace_detections(SPINDLES, |x, _, _, _| Ok(DetectorOutput::Intervals(vec![[0, x.len() / 2]])));
        assert_eq!(s.apply_detection("C0", SPINDLES).unwrap(), 1);
        let key = DetectionKey::new("C0", SPINDLES);
        let before = s.detections().get(&key).unwrap().to_vec();

        s.replace_detections(SPINDLES, |_, _, _, _| Err(SleepError::InvalidArgument("broken".to_owned())));
        let err = s.apply_detection("C0", SPINDLES).unwrap_err();
        assert!(err.is_recoverable());
        assert_eq!(s.detections().get(&key).unwrap(), before.as_slice());
        assert!(s.apply_detection("C9", SPINDLES).is_err());
    }

    #[test]
    fn detect_all_and_cancel() {
        let mut s = session(3, 60, 100.0);
        s.replace_detections("Mask", |x, _, _, _| Ok(DetectorOutput::Mask(x.iter().map(|&v| v > 5.0).collect())));
        let failures = s.detect_all("Mask", &["C0", "C2"], &CancelToken::new()).unwrap();
        assert!(failures.is_empty());
        assert_eq!(s.detections().keys().count(), 2);
        // C0 tops out at 6, C2 at 18
        assert!(!s.detections().get(&DetectionKey::new("C0", "Mask")).unwrap().is_empty());

        let cancel = CancelToken::new();
        cancel.cancel();
        s.reset_detections();
        assert!(matches!(s.detect_all("Mask", &["C1"], &cancel), Err(SleepError::Cancelled)));
        assert!(s.detections().is_empty());
    }

    #[test]
    fn reference_change_resets_detections() {
        let mut s = session(3, 10, 10.0);
        s.replace_detections("All", |x, _, _, _| Ok(DetectorOutput::Indices((0..x.len()).collect())));
        s.apply_detection("C1", "All").unwrap();
        s.set_reference(Reference::Channel(0)).unwrap();
        assert_eq!(s.channels(), ["C1", "C2"]);
        assert!(s.detections().is_empty());
        assert_eq!(s.view().channels.visible.len(), 2);
        assert_eq!(s.data()[[0, 3]], 3.0);
        assert!(s.set_reference(Reference::Channel(7)).is_err());
        assert_eq!(s.channels().len(), 2);
    }

    #[test]
    fn preprocessing_applies_on_demand() {
        let mut s = session(1, 60, 100.0);
        s.set_preproc(PreprocSettings {
            demean: true,
            ..Default::default()
        })
        .unwrap();
        let (_, raw) = s.window_data();
        assert!(raw.iter().any(|&v| v > 0.5));
        assert!(s.preproc().is_dirty());
        s.apply_preproc().unwrap();
        let (time, block) = s.window_data();
        assert_eq!(time.len(), 3000);
        assert!(block.row(0).sum().abs() < 1e-2);
    }

    #[test]
    fn save_hypno_writes_metadata() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("scored.txt");
        let mut s = session(1, 90, 1.0);
        s.score_current(4).unwrap();
        s.save_hypno(&path, HypnoVersion::Time).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("*Duration_sec 89\n"));
        assert!(text.contains("REM 30"));

        let mut other = session(1, 90, 1.0);
        other.load_hypno(&path).unwrap();
        assert_eq!(other.hypno(), s.hypno());
    }
}
