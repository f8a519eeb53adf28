use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::mpsc::Receiver;

use egui::{Color32, Key};
use egui_file_dialog::FileDialog;
use egui_plot::{Line, Plot, PlotImage, PlotPoint, Points, Text, VLine};

use crate::annotations::AnnotationSource;
use crate::config::SessionConfig;
use crate::detection::{CancelToken, DetectionKey};
use crate::hypnoio::HypnoVersion;
use crate::iir::{FilterBand, FilterMethod};
use crate::plot::parse_color;
use crate::reference::Reference;
use crate::spectral::{self, Spectrogram, SpectrogramSettings};
use crate::{Recording, Result, ScoringSession, SessionEvent, SleepOptions, recording};

/// What the file dialog was opened for.
#[derive(PartialEq, Clone, Copy, Debug)]
enum DialogPurpose {
    Recording,
    Hypnogram,
    SaveHypnogram,
    Annotations,
    SaveAnnotations,
    Config,
    SaveConfig,
    ExportDetections,
}

/// Viewer preferences that outlive a recording.
#[derive(serde::Deserialize, serde::Serialize)]
#[serde(default)]
struct Prefs {
    decimation_factor: usize,
    gain: f64,
    signal_height: f32,
    hypno_height: f32,
    spec_height: f32,
    save_version: HypnoVersion,
    trace_color: Color32,
}

impl Default for Prefs {
    fn default() -> Self {
        Self {
            decimation_factor: 4,
            gain: 1.0,
            signal_height: 420.0,
            hypno_height: 140.0,
            spec_height: 140.0,
            save_version: HypnoVersion::Time,
            trace_color: Color32::WHITE,
        }
    }
}

struct SpectrogramCache {
    settings: SpectrogramSettings,
    texture: egui::TextureHandle,
    spec: Spectrogram,
}

pub struct SleepApp {
    prefs: Prefs,
    options: SleepOptions,
    session: Option<ScoringSession>,
    events: Rc<RefCell<Vec<SessionEvent>>>,
    file_dialog: FileDialog,
    dialog_purpose: Option<DialogPurpose>,
    loading_receiver: Option<Receiver<Result<Recording>>>,
    spectrogram: Option<SpectrogramCache>,
    detect_method: String,
    detect_channel: usize,
    selected_detection: Option<DetectionKey>,
    detection_cursor: usize,
    annotation_text: String,
    status: String,
}

fn min_max_decimate(data: &[f32], t0: f64, sf: f64, decimation: usize, scale: f64, offset: f64) -> Vec<[f64; 2]> {
    if decimation <= 1 {
        return data
            .iter()
            .enumerate()
            .map(|(i, &v)| [t0 + i as f64 / sf, f64::from(v) * scale + offset])
            .collect();
    }
    let mut points = Vec::with_capacity(2 * data.len() / decimation + 2);
    for (k, chunk) in data.chunks(decimation).enumerate() {
        let t = t0 + (k * decimation) as f64 / sf;
        let (lo, hi) = chunk
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        points.push([t, f64::from(lo) * scale + offset]);
        points.push([t + 0.5 * chunk.len() as f64 / sf, f64::from(hi) * scale + offset]);
    }
    points
}

fn stage_color(hex: &str) -> Color32 {
    parse_color(hex).map_or(Color32::GRAY, |c| Color32::from_rgb(c.0, c.1, c.2))
}

/// Piecewise-linear colour maps, sampled at `t` in `[0, 1]`.
fn colormap(name: &str, t: f64) -> Color32 {
    const VIRIDIS: [[u8; 3]; 5] = [[68, 1, 84], [59, 82, 139], [33, 145, 140], [94, 201, 98], [253, 231, 37]];
    const MAGMA: [[u8; 3]; 5] = [[0, 0, 4], [81, 18, 124], [183, 55, 121], [252, 137, 97], [252, 253, 191]];
    const RAINBOW: [[u8; 3]; 5] = [[128, 0, 255], [0, 128, 255], [0, 255, 128], [255, 200, 0], [255, 0, 0]];
    const GRAY: [[u8; 3]; 2] = [[0, 0, 0], [255, 255, 255]];
    let anchors: &[[u8; 3]] = match name {
        "magma" => &MAGMA,
        "rainbow" | "jet" => &RAINBOW,
        "gray" | "grey" => &GRAY,
        _ => &VIRIDIS,
    };
    let x = t.clamp(0.0, 1.0) * (anchors.len() - 1) as f64;
    let i = (x.floor() as usize).min(anchors.len() - 2);
    let f = x - i as f64;
    let mix = |a: u8, b: u8| (f64::from(a) + f * (f64::from(b) - f64::from(a))).round() as u8;
    let (a, b) = (anchors[i], anchors[i + 1]);
    Color32::from_rgb(mix(a[0], b[0]), mix(a[1], b[1]), mix(a[2], b[2]))
}

impl SleepApp {
    /// Called once before the first frame.
    pub fn new(cc: &eframe::CreationContext<'_>, session: Option<ScoringSession>, options: SleepOptions) -> Self {
        let prefs = cc
            .storage
            .and_then(|storage| eframe::get_value(storage, eframe::APP_KEY))
            .unwrap_or_default();
        let mut app = Self {
            prefs,
            options,
            session: None,
            events: Rc::new(RefCell::new(Vec::new())),
            file_dialog: FileDialog::new(),
            dialog_purpose: None,
            loading_receiver: None,
            spectrogram: None,
            detect_method: crate::detection::SPINDLES.to_owned(),
            detect_channel: 0,
            selected_detection: None,
            detection_cursor: 0,
            annotation_text: crate::annotations::DEFAULT_TEXT.to_owned(),
            status: String::new(),
        };
        if let Some(session) = session {
            app.attach(session);
        }
        app
    }

    fn attach(&mut self, mut session: ScoringSession) {
        let sink = Rc::clone(&self.events);
        session.on_change(move |event, _| sink.borrow_mut().push(event));
        self.status = format!(
            "{} channels, {:.0} s at {} Hz",
            session.channels().len(),
            session.recording().duration(),
            session.sf()
        );
        self.spectrogram = None;
        self.selected_detection = None;
        self.detect_channel = 0;
        self.session = Some(session);
    }

    fn report<T>(&mut self, what: &str, result: Result<T>) -> Option<T> {
        match result {
            Ok(v) => Some(v),
            Err(err) => {
                log::warn!("{what}: {err}");
                self.status = format!("{what}: {err}");
                None
            }
        }
    }

    fn open_dialog(&mut self, purpose: DialogPurpose) {
        match purpose {
            DialogPurpose::SaveHypnogram
            | DialogPurpose::SaveAnnotations
            | DialogPurpose::SaveConfig
            | DialogPurpose::ExportDetections => self.file_dialog.save_file(),
            _ => self.file_dialog.pick_file(),
        }
        self.dialog_purpose = Some(purpose);
    }

    fn handle_picked(&mut self, path: PathBuf) {
        let Some(purpose) = self.dialog_purpose.take() else {
            return;
        };
        if purpose == DialogPurpose::Recording {
            let (sender, receiver) = std::sync::mpsc::channel();
            self.loading_receiver = Some(receiver);
            let options = self.options.clone();
            std::thread::spawn(move || {
                if sender.send(recording::open(&path, &options)).is_err() {
                    log::debug!("Viewer closed before {} finished loading", path.display());
                }
            });
            return;
        }
        let Some(session) = self.session.as_mut() else {
            self.status = "Open a recording first".to_owned();
            return;
        };
        let result = match purpose {
            DialogPurpose::Hypnogram => session.load_hypno(&path),
            DialogPurpose::SaveHypnogram => session.save_hypno(&path, self.prefs.save_version),
            DialogPurpose::Annotations => session.load_annotations(AnnotationSource::Path(path.clone())).map(|_| ()),
            DialogPurpose::SaveAnnotations => session.save_annotations(&path),
            DialogPurpose::Config => SessionConfig::load(&path).map(|config| {
                for warning in config.apply(session) {
                    self.status = warning.to_string();
                }
            }),
            DialogPurpose::SaveConfig => SessionConfig::snapshot(session).save(&path),
            DialogPurpose::ExportDetections => match &self.selected_detection {
                Some(key) => session
                    .detections()
                    .export_csv(key, &path, session.sf(), session.stages()),
                None => Ok(()),
            },
            DialogPurpose::Recording => Ok(()),
        };
        if self.report(&path.display().to_string(), result).is_some() {
            log::info!("{purpose:?}: {}", path.display());
        }
    }

    fn poll_loading(&mut self) {
        let Some(receiver) = &self.loading_receiver else {
            return;
        };
        match receiver.try_recv() {
            Ok(Ok(rec)) => {
                self.loading_receiver = None;
                let stages = self.options.stages.clone();
                self.attach(ScoringSession::from_recording(rec, stages));
            }
            Ok(Err(err)) => {
                self.loading_receiver = None;
                self.report::<()>("Loading failed", Err(err));
            }
            Err(std::sync::mpsc::TryRecvError::Empty) => {}
            Err(std::sync::mpsc::TryRecvError::Disconnected) => {
                log::warn!("Loading thread disconnected");
                self.loading_receiver = None;
            }
        }
    }

    fn drain_events(&mut self) {
        let events: Vec<SessionEvent> = self.events.borrow_mut().drain(..).collect();
        for event in events {
            log::debug!("session event {event:?}");
            if event == SessionEvent::PreprocChanged {
                self.spectrogram = None;
            }
        }
    }

    fn handle_keys(&mut self, ctx: &egui::Context) {
        if ctx.wants_keyboard_input() {
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let (events, next, prev, undo, gain_up, gain_down) = ctx.input(|i| {
            (
                i.events.clone(),
                i.key_pressed(Key::ArrowRight) || i.key_pressed(Key::L),
                i.key_pressed(Key::ArrowLeft) || i.key_pressed(Key::H),
                i.modifiers.command && i.key_pressed(Key::Z),
                i.key_pressed(Key::ArrowUp),
                i.key_pressed(Key::ArrowDown),
            )
        });
        if next {
            session.next_window();
        }
        if prev {
            session.prev_window();
        }
        if undo && !session.undo() {
            self.status = "Nothing to undo".to_owned();
        }
        if gain_up {
            self.prefs.gain *= 1.1;
        }
        if gain_down {
            self.prefs.gain /= 1.1;
        }
        for event in events {
            if let egui::Event::Text(text) = event
                && session.stages().by_shortcut(&text).is_some()
                && let Err(err) = session.score_shortcut(&text)
            {
                log::warn!("scoring '{text}': {err}");
                self.status = err.to_string();
            }
        }
    }

    fn signal_plot(&mut self, ui: &mut egui::Ui) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let (time, block) = session.window_data();
        let Some(&t0) = time.first() else {
            return;
        };
        let sf = session.sf();
        let view = &session.view().channels;
        let visible = view.visible_channels();
        let window = session.window();
        let t1 = t0 + window.window_length_s();
        let (start, end) = window.window_samples(session.n_points());
        let scoring_end = window.window_start_s() + window.scoring_window_s();
        let decimation = self.prefs.decimation_factor;
        let gain = self.prefs.gain;
        let color = self.prefs.trace_color;

        Plot::new("signals")
            .height(self.prefs.signal_height)
            .show_y(false)
            .allow_drag(false)
            .allow_zoom(false)
            .allow_scroll(false)
            .show(ui, |plot_ui| {
                for (lane, &ch) in visible.iter().enumerate() {
                    let offset = -(lane as f64);
                    let row = block.row(ch);
                    let Some(samples) = row.as_slice() else {
                        continue;
                    };
                    let amp = view.amplitudes[ch];
                    let (lo, hi) = if amp.auto {
                        samples
                            .iter()
                            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
                                (lo.min(f64::from(v)), hi.max(f64::from(v)))
                            })
                    } else {
                        (amp.ymin, amp.ymax)
                    };
                    let span = if hi > lo { hi - lo } else { 1.0 };
                    let scale = gain / span;
                    let centre = offset - 0.5 * (lo + hi) * scale;
                    let points = min_max_decimate(samples, t0, sf, decimation, scale, centre);
                    plot_ui.line(Line::new(session.channels()[ch].clone(), points).color(color));
                    plot_ui.text(Text::new(
                        format!("label_{ch}"),
                        PlotPoint::new(t0, offset + 0.35),
                        session.channels()[ch].clone(),
                    ));

                    for (key, _) in session.detections().overlay_markers(offset) {
                        if session.detections().channel_index(key) != Some(ch) {
                            continue;
                        }
                        let marks: Vec<[f64; 2]> = session
                            .detections()
                            .events_in(key, start, end)
                            .iter()
                            .map(|e| [e[0] as f64 / sf, offset])
                            .collect();
                        plot_ui.points(Points::new(key.to_string(), marks).radius(4.0).color(Color32::RED));
                    }
                }
                for idx in session.annotations().in_range(t0, t1) {
                    if let Some(a) = session.annotations().get(idx) {
                        plot_ui.vline(VLine::new(a.text.clone(), a.start_s).color(Color32::YELLOW));
                    }
                }
                if scoring_end < t1 {
                    plot_ui.vline(VLine::new("scoring window", scoring_end).color(Color32::LIGHT_BLUE));
                }
                plot_ui.set_plot_bounds_x(t0..=t1);
                plot_ui.set_plot_bounds_y(-(visible.len() as f64) + 0.5..=0.5);
            });
    }

    fn hypnogram_plot(&mut self, ui: &mut egui::Ui) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let sf = session.sf();
        let stages = session.stages();
        let href = stages.href();
        let rank = |code: i32| {
            stages
                .name_of(code)
                .and_then(|name| href.iter().position(|h| h == name))
                .map_or(0.0, |r| -(r as f64))
        };
        let hypno = session.hypno().as_slice();
        let mut steps = Vec::new();
        let mut prev = None;
        let stride = (hypno.len() / 4000).max(1);
        for (i, &code) in hypno.iter().enumerate().step_by(stride) {
            let y = rank(code);
            if let Some(py) = prev
                && py != y
            {
                steps.push([i as f64 / sf, py]);
            }
            steps.push([i as f64 / sf, y]);
            prev = Some(y);
        }
        let t_max = session.recording().duration();
        let window_start = session.window().window_start_s();

        let response = Plot::new("hypnogram")
            .height(self.prefs.hypno_height)
            .show_y(false)
            .allow_drag(false)
            .allow_zoom(false)
            .allow_scroll(false)
            .show(ui, |plot_ui| {
                plot_ui.line(Line::new("hypnogram", steps).color(Color32::LIGHT_GRAY));
                for (r, name) in href.iter().enumerate() {
                    let color = stages.get(name).map_or(Color32::GRAY, |s| stage_color(&s.color));
                    plot_ui.text(Text::new(name.clone(), PlotPoint::new(0.0, -(r as f64)), name.clone()).color(color));
                }
                plot_ui.vline(VLine::new("window", window_start).color(Color32::RED));
                plot_ui.set_plot_bounds_x(0.0..=t_max.max(1.0));
                plot_ui.set_plot_bounds_y(-(href.len() as f64) + 0.5..=0.5);
                if plot_ui.response().clicked() {
                    plot_ui.pointer_coordinate().map(|p| p.x)
                } else {
                    None
                }
            });
        if let Some(t) = response.inner
            && let Some(session) = self.session.as_mut()
        {
            session.set_window_start(t);
        }
    }

    fn spectrogram_plot(&mut self, ui: &mut egui::Ui) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let settings = session.view().spectrogram.clone();
        if !settings.visible {
            return;
        }
        let stale = self.spectrogram.as_ref().is_none_or(|c| c.settings != settings);
        if stale {
            let row = settings.channel.min(session.channels().len().saturating_sub(1));
            let x = session.data().row(row).to_vec();
            let spec = match spectral::spectrogram(&x, session.sf(), &settings) {
                Ok(spec) => spec,
                Err(err) => {
                    self.status = format!("spectrogram: {err}");
                    return;
                }
            };
            let colorbar = &session.view().colorbar;
            let (n_freqs, n_times) = spec.power_db.dim();
            let (lo, hi) = colorbar.clim.map_or_else(
                || {
                    spec.power_db
                        .iter()
                        .filter(|v| v.is_finite())
                        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)))
                },
                |[lo, hi]| (lo, hi),
            );
            let span = if hi > lo { hi - lo } else { 1.0 };
            let mut rgb = Vec::with_capacity(n_freqs * n_times * 3);
            for f in (0..n_freqs).rev() {
                for t in 0..n_times {
                    let mut v = (spec.power_db[[f, t]] - lo) / span;
                    if colorbar.reverse {
                        v = 1.0 - v;
                    }
                    let c = colormap(&settings.cmap, v);
                    rgb.extend([c.r(), c.g(), c.b()]);
                }
            }
            let image = egui::ColorImage::from_rgb([n_times, n_freqs], &rgb);
            let texture = ui.ctx().load_texture("spectrogram", image, egui::TextureOptions::LINEAR);
            self.spectrogram = Some(SpectrogramCache {
                settings,
                texture,
                spec,
            });
        }
        let Some(cache) = &self.spectrogram else {
            return;
        };
        let (Some(&f0), Some(&f1)) = (cache.spec.freqs.first(), cache.spec.freqs.last()) else {
            return;
        };
        let t_max = session.recording().duration().max(1.0);
        let window_start = session.window().window_start_s();
        Plot::new("spectrogram")
            .height(self.prefs.spec_height)
            .allow_drag(false)
            .allow_zoom(false)
            .allow_scroll(false)
            .show(ui, |plot_ui| {
                plot_ui.image(PlotImage::new(
                    "spectrogram",
                    cache.texture.id(),
                    PlotPoint::new(t_max / 2.0, (f0 + f1) / 2.0),
                    egui::vec2(t_max as f32, (f1 - f0) as f32),
                ));
                plot_ui.vline(VLine::new("window", window_start).color(Color32::WHITE));
                plot_ui.set_plot_bounds_x(0.0..=t_max);
                plot_ui.set_plot_bounds_y(f0..=f1);
            });
    }

    fn navigation_ui(&mut self, ui: &mut egui::Ui) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        ui.heading("Window");
        let mut start = session.window().window_start_s();
        if ui
            .add(egui::DragValue::new(&mut start).speed(1.0).suffix(" s").prefix("start "))
            .changed()
        {
            session.set_window_start(start);
        }
        let mut length = session.window().window_length_s();
        if ui
            .add(egui::DragValue::new(&mut length).speed(1.0).range(1.0..=600.0).suffix(" s").prefix("length "))
            .changed()
            && let Err(err) = session.resize_signal_window(length)
        {
            self.status = err.to_string();
        }
        let mut step = session.window().window_step_s();
        if ui
            .add(egui::DragValue::new(&mut step).speed(1.0).suffix(" s").prefix("step "))
            .changed()
        {
            session.set_window_step(step);
        }
        let mut locked = session.window().is_locked();
        if ui.checkbox(&mut locked, "Lock scoring window").changed() {
            session.lock_toggle(locked);
        }
        ui.add_enabled_ui(!locked, |ui| {
            let mut scoring = session.window().scoring_window_s();
            if ui
                .add(egui::DragValue::new(&mut scoring).speed(1.0).range(1.0..=600.0).suffix(" s").prefix("scoring "))
                .changed()
                && let Err(err) = session.resize_scoring_window(scoring)
            {
                self.status = err.to_string();
            }
        });
        ui.horizontal(|ui| {
            if ui.button("◀").clicked() {
                session.prev_window();
            }
            if ui.button("▶").clicked() {
                session.next_window();
            }
            ui.label(session.recording().absolute_time_label(session.window().window_start_s()));
        });

        ui.horizontal_wrapped(|ui| {
            let shortcuts: Vec<(String, String, String)> = session
                .stages()
                .states()
                .iter()
                .map(|s| (s.name.clone(), s.shortcut.clone(), s.color.clone()))
                .collect();
            for (name, shortcut, color) in shortcuts {
                let label = egui::RichText::new(format!("{name} [{shortcut}]")).color(stage_color(&color));
                if ui.button(label).clicked()
                    && let Err(err) = session.score_shortcut(&shortcut)
                {
                    self.status = err.to_string();
                }
            }
        });
        ui.horizontal(|ui| {
            if ui.button("Undo").clicked() && !session.undo() {
                self.status = "Nothing to undo".to_owned();
            }
            if ui.button("Clean hypnogram").clicked() {
                session.clean_hypno();
            }
        });
    }

    fn channels_ui(&mut self, ui: &mut egui::Ui) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        ui.collapsing("Channels", |ui| {
            let names = session.channels().to_vec();
            let view = &mut session.view_mut().channels;
            for (ch, name) in names.iter().enumerate() {
                ui.horizontal(|ui| {
                    ui.checkbox(&mut view.visible[ch], name);
                    let amp = &mut view.amplitudes[ch];
                    ui.checkbox(&mut amp.auto, "auto");
                    ui.add_enabled_ui(!amp.auto, |ui| {
                        if ui.add(egui::DragValue::new(&mut amp.ymax).speed(1.0).prefix("±")).changed()
                            && amp.symmetric
                        {
                            amp.ymin = -amp.ymax;
                        }
                    });
                });
            }
        });
        ui.add(egui::Slider::new(&mut self.prefs.decimation_factor, 1..=50).text("Plot decimation"));
        ui.add(egui::Slider::new(&mut self.prefs.gain, 0.1..=10.0).logarithmic(true).text("Gain"));
        egui::color_picker::color_edit_button_srgba(ui, &mut self.prefs.trace_color, egui::color_picker::Alpha::Opaque);

        let names = session.channels().to_vec();
        let current = session.reference().clone();
        let mut choice = current.clone();
        egui::ComboBox::from_label("Reference")
            .selected_text(match &choice {
                Reference::AsRecorded => "As recorded".to_owned(),
                Reference::Average => "Average".to_owned(),
                Reference::Channel(i) => names.get(*i).cloned().unwrap_or_default(),
                Reference::Bipolar(pairs) => format!("{} bipolar pairs", pairs.len()),
            })
            .show_ui(ui, |ui| {
                ui.selectable_value(&mut choice, Reference::AsRecorded, "As recorded");
                ui.selectable_value(&mut choice, Reference::Average, "Average");
                for (i, name) in session.recording().channels.iter().enumerate() {
                    ui.selectable_value(&mut choice, Reference::Channel(i), name);
                }
            });
        if choice != current
            && let Err(err) = session.set_reference(choice)
        {
            self.status = err.to_string();
        }
    }

    fn preproc_ui(&mut self, ui: &mut egui::Ui) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        ui.collapsing("Preprocessing", |ui| {
            let mut settings = session.preproc().pending().clone();
            ui.checkbox(&mut settings.demean, "Demean");
            ui.checkbox(&mut settings.detrend, "Detrend");
            ui.checkbox(&mut settings.filt, "Filter");
            ui.add_enabled_ui(settings.filt, |ui| {
                egui::ComboBox::from_label("Band")
                    .selected_text(format!("{:?}", settings.fband))
                    .show_ui(ui, |ui| {
                        for band in [FilterBand::Bandpass, FilterBand::Bandstop, FilterBand::Lowpass, FilterBand::Highpass] {
                            ui.selectable_value(&mut settings.fband, band, format!("{band:?}"));
                        }
                    });
                egui::ComboBox::from_label("Method")
                    .selected_text(format!("{:?}", settings.fmethod))
                    .show_ui(ui, |ui| {
                        ui.selectable_value(&mut settings.fmethod, FilterMethod::Butterworth, "Butterworth");
                        ui.selectable_value(&mut settings.fmethod, FilterMethod::Bessel, "Bessel");
                    });
                ui.add(egui::DragValue::new(&mut settings.fstart).speed(0.1).prefix("fstart ").suffix(" Hz"));
                ui.add(egui::DragValue::new(&mut settings.fend).speed(0.1).prefix("fend ").suffix(" Hz"));
                ui.add(egui::DragValue::new(&mut settings.forder).range(1..=crate::iir::MAX_ORDER).prefix("order "));
            });
            if settings != *session.preproc().pending()
                && let Err(err) = session.set_preproc(settings)
            {
                self.status = err.to_string();
            }
            ui.add_enabled_ui(session.preproc().is_dirty(), |ui| {
                if ui.button("Apply").clicked()
                    && let Err(err) = session.apply_preproc()
                {
                    self.status = err.to_string();
                }
            });
            let mut on_preproc = session.detect_on_preprocessed();
            if ui.checkbox(&mut on_preproc, "Detect on preprocessed signal").changed() {
                session.set_detect_on_preprocessed(on_preproc);
            }
        });
    }

    fn detection_ui(&mut self, ui: &mut egui::Ui) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        ui.collapsing("Detections", |ui| {
            let methods: Vec<String> = session.registry().methods().into_iter().map(str::to_owned).collect();
            egui::ComboBox::from_label("Method")
                .selected_text(self.detect_method.clone())
                .show_ui(ui, |ui| {
                    for m in methods {
                        ui.selectable_value(&mut self.detect_method, m.clone(), m);
                    }
                });
            let names = session.channels().to_vec();
            self.detect_channel = self.detect_channel.min(names.len().saturating_sub(1));
            egui::ComboBox::from_label("Channel")
                .selected_text(names.get(self.detect_channel).cloned().unwrap_or_default())
                .show_ui(ui, |ui| {
                    for (i, name) in names.iter().enumerate() {
                        ui.selectable_value(&mut self.detect_channel, i, name);
                    }
                });
            ui.horizontal(|ui| {
                if ui.button("Apply").clicked()
                    && let Some(channel) = names.get(self.detect_channel)
                {
                    match session.apply_detection(channel, &self.detect_method) {
                        Ok(n) => {
                            self.status = format!("{n} events");
                            self.selected_detection = Some(DetectionKey::new(channel.clone(), self.detect_method.clone()));
                            self.detection_cursor = 0;
                        }
                        Err(err) => self.status = err.to_string(),
                    }
                }
                if ui.button("All channels").clicked() {
                    let all: Vec<&str> = names.iter().map(String::as_str).collect();
                    match session.detect_all(&self.detect_method, &all, &CancelToken::new()) {
                        Ok(failures) => self.status = format!("{} channel(s) failed", failures.len()),
                        Err(err) => self.status = err.to_string(),
                    }
                }
                if ui.button("Reset").clicked() {
                    session.reset_detections();
                    self.selected_detection = None;
                }
            });

            let keys: Vec<DetectionKey> = session.detections().keys().cloned().collect();
            for key in keys {
                ui.horizontal(|ui| {
                    let mut enabled = session.detections().is_enabled(&key);
                    if ui.checkbox(&mut enabled, "").changed() {
                        session.set_detection_enabled(&key, enabled);
                    }
                    let n = session.detections().get(&key).map_or(0, <[_]>::len);
                    let selected = self.selected_detection.as_ref() == Some(&key);
                    if ui.selectable_label(selected, format!("{key} ({n})")).clicked() {
                        self.selected_detection = Some(key.clone());
                        self.detection_cursor = 0;
                    }
                    if ui.small_button("🗑").clicked() {
                        session.delete_detection(&key);
                    }
                });
            }
            if let Some(key) = self.selected_detection.clone() {
                ui.horizontal(|ui| {
                    if ui.button("Previous").clicked() {
                        self.detection_cursor = self.detection_cursor.saturating_sub(1);
                        session.jump_to_detection(&key, self.detection_cursor);
                    }
                    if ui.button("Next").clicked() {
                        let n = session.detections().get(&key).map_or(0, <[_]>::len);
                        if self.detection_cursor + 1 < n {
                            self.detection_cursor += 1;
                        }
                        session.jump_to_detection(&key, self.detection_cursor);
                    }
                    ui.label(format!("#{}", self.detection_cursor));
                });
            }
        });
    }

    fn annotation_ui(&mut self, ui: &mut egui::Ui) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        ui.collapsing("Annotations", |ui| {
            ui.horizontal(|ui| {
                ui.text_edit_singleline(&mut self.annotation_text);
                if ui.button("Add here").clicked() {
                    let t = session.window().window_start_s() + session.window().window_length_s() / 2.0;
                    if let Err(err) = session.add_annotation(t, t, "", &self.annotation_text) {
                        self.status = err.to_string();
                    }
                }
            });
            let rows: Vec<(usize, f64, String)> = session
                .annotations()
                .iter()
                .enumerate()
                .map(|(i, a)| (i, a.start_s, a.text.clone()))
                .collect();
            egui::ScrollArea::vertical().max_height(150.0).show(ui, |ui| {
                for (i, start, text) in rows {
                    ui.horizontal(|ui| {
                        if ui.link(format!("{start:.1} s  {text}")).clicked() {
                            session.jump_to_annotation(i);
                        }
                        if ui.small_button("🗑").clicked() {
                            session.remove_annotation(i);
                        }
                    });
                }
            });
        });
    }

    fn stats_ui(&self, ui: &mut egui::Ui) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        ui.collapsing("Statistics", |ui| {
            egui::Grid::new("stats").striped(true).show(ui, |ui| {
                for (key, value) in session.stats().rows() {
                    ui.label(key);
                    ui.label(format!("{value:.2}"));
                    ui.end_row();
                }
            });
        });
    }

    fn spectrogram_ui(&mut self, ui: &mut egui::Ui) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let names = session.channels().to_vec();
        ui.collapsing("Spectrogram", |ui| {
            let view = session.view_mut();
            let spec = &mut view.spectrogram;
            ui.checkbox(&mut spec.visible, "Visible");
            egui::ComboBox::from_label("Channel ")
                .selected_text(names.get(spec.channel).cloned().unwrap_or_default())
                .show_ui(ui, |ui| {
                    for (i, name) in names.iter().enumerate() {
                        ui.selectable_value(&mut spec.channel, i, name);
                    }
                });
            ui.add(egui::DragValue::new(&mut spec.nfft_s).range(1.0..=120.0).prefix("nfft ").suffix(" s"));
            ui.add(egui::DragValue::new(&mut spec.overlap_s).range(0.0..=119.0).prefix("overlap ").suffix(" s"));
            ui.add(egui::DragValue::new(&mut spec.fstart).speed(0.1).prefix("fstart ").suffix(" Hz"));
            ui.add(egui::DragValue::new(&mut spec.fend).speed(0.1).prefix("fend ").suffix(" Hz"));
            egui::ComboBox::from_label("Colormap")
                .selected_text(spec.cmap.clone())
                .show_ui(ui, |ui| {
                    for cmap in ["viridis", "magma", "rainbow", "gray"] {
                        ui.selectable_value(&mut spec.cmap, cmap.to_owned(), cmap);
                    }
                });
            if ui.checkbox(&mut view.colorbar.reverse, "Reverse colours").changed() {
                self.spectrogram = None;
            }
            ui.checkbox(&mut view.grid, "Grid");
        });
    }
}

impl eframe::App for SleepApp {
    /// Called by the framework to save state before shutdown.
    fn save(&mut self, storage: &mut dyn eframe::Storage) {
        eframe::set_value(storage, eframe::APP_KEY, &self.prefs);
    }

    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        self.poll_loading();
        self.drain_events();
        self.handle_keys(ctx);

        self.file_dialog.update(ctx);
        if let Some(path) = self.file_dialog.take_picked() {
            self.handle_picked(path);
        }

        egui::TopBottomPanel::top("top_panel").show(ctx, |ui| {
            egui::MenuBar::new().ui(ui, |ui| {
                ui.menu_button("File", |ui| {
                    let entries = [
                        ("Open recording…", DialogPurpose::Recording),
                        ("Load hypnogram…", DialogPurpose::Hypnogram),
                        ("Save hypnogram…", DialogPurpose::SaveHypnogram),
                        ("Load annotations…", DialogPurpose::Annotations),
                        ("Save annotations…", DialogPurpose::SaveAnnotations),
                        ("Load config…", DialogPurpose::Config),
                        ("Save config…", DialogPurpose::SaveConfig),
                        ("Export detections…", DialogPurpose::ExportDetections),
                    ];
                    for (label, purpose) in entries {
                        if ui.button(label).clicked() {
                            self.open_dialog(purpose);
                        }
                    }
                    ui.separator();
                    if ui.button("Quit").clicked() {
                        ctx.send_viewport_cmd(egui::ViewportCommand::Close);
                    }
                });
                ui.menu_button("Hypnogram format", |ui| {
                    ui.selectable_value(&mut self.prefs.save_version, HypnoVersion::Time, "Time (stage, end)");
                    ui.selectable_value(&mut self.prefs.save_version, HypnoVersion::Sample, "Sample (one value per window)");
                });
                ui.add_space(16.0);
                egui::widgets::global_theme_preference_buttons(ui);
            });
        });

        egui::TopBottomPanel::bottom("status").show(ctx, |ui| {
            ui.horizontal(|ui| {
                if self.loading_receiver.is_some() {
                    ui.spinner();
                    ui.label("Loading recording…");
                }
                ui.label(&self.status);
            });
        });

        egui::SidePanel::right("controls").min_width(280.0).show(ctx, |ui| {
            egui::ScrollArea::vertical().show(ui, |ui| {
                self.navigation_ui(ui);
                ui.separator();
                self.channels_ui(ui);
                self.preproc_ui(ui);
                self.spectrogram_ui(ui);
                self.detection_ui(ui);
                self.annotation_ui(ui);
                self.stats_ui(ui);
            });
        });

        egui::CentralPanel::default().show(ctx, |ui| {
            if self.session.is_none() {
                ui.heading("Sleep scoring");
                ui.label("Open a recording from the File menu.");
                return;
            }
            self.signal_plot(ui);
            self.spectrogram_plot(ui);
            self.hypnogram_plot(ui);
            ui.with_layout(egui::Layout::bottom_up(egui::Align::LEFT), |ui| {
                egui::warn_if_debug_build(ui);
            });
        });
    }
}
