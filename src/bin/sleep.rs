//! Opens the sleep scoring viewer.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context as _;
use clap::{ArgAction, Parser};
use sleepscore::annotations::AnnotationSource;
use sleepscore::config::SessionConfig;
use sleepscore::{ScoringSession, SleepApp, SleepOptions};

/// `-h` is the hypnogram, so help is only available as `--help`.
#[derive(Parser, Debug)]
#[command(name = "sleep", version, about = "Open a recording for sleep scoring", disable_help_flag = true)]
struct Args {
    /// Polysomnographic recording (.edf, .rec, .eeg, .vhdr, .trc).
    #[arg(short = 'd', long = "data")]
    data: Option<PathBuf>,
    /// Hypnogram file (.txt, .csv, .xlsx, .hyp).
    #[arg(short = 'h', long = "hypno")]
    hypno: Option<PathBuf>,
    /// Session config saved from an earlier session.
    #[arg(short = 'c', long = "config_file")]
    config_file: Option<PathBuf>,
    /// Annotation file.
    #[arg(short = 'a', long = "annotations")]
    annotations: Option<PathBuf>,
    /// Target sampling rate after decimation.
    #[arg(long, default_value_t = 100.0)]
    downsample: f64,
    /// Read with the generic external loader instead of the built-in readers.
    #[arg(long = "use_mne", default_value_t = false, action = ArgAction::Set)]
    use_mne: bool,
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    preload: bool,
    /// Skip the rescale to microvolts for recordings that look like volts.
    #[arg(long = "no_rescale")]
    no_rescale: bool,
    /// Open the window; `--show false` only loads and checks the inputs.
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    show: bool,
    #[arg(long, action = ArgAction::Help)]
    help: Option<bool>,
}

fn load(args: &Args, options: &SleepOptions) -> anyhow::Result<Option<ScoringSession>> {
    let Some(data) = &args.data else {
        return Ok(None);
    };
    let annotations = args.annotations.clone().map(AnnotationSource::Path);
    let mut session = ScoringSession::open(data, args.hypno.as_deref(), annotations, options)
        .with_context(|| format!("opening {}", data.display()))?;
    if let Some(path) = &args.config_file {
        let config = SessionConfig::load(path).with_context(|| format!("reading config {}", path.display()))?;
        let skipped = config.apply(&mut session);
        if !skipped.is_empty() {
            log::warn!("{} config key(s) skipped", skipped.len());
        }
    }
    Ok(Some(session))
}

fn run(args: &Args) -> anyhow::Result<()> {
    let options = SleepOptions {
        downsample: Some(args.downsample),
        use_external: args.use_mne,
        preload: args.preload,
        auto_rescale: !args.no_rescale,
        ..Default::default()
    };
    let session = load(args, &options)?;
    if !args.show {
        if let Some(session) = &session {
            log::info!(
                "{} channels, {} points at {} Hz, {} annotations",
                session.channels().len(),
                session.n_points(),
                session.sf(),
                session.annotations().len()
            );
        }
        return Ok(());
    }

    let native_options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_inner_size([1280.0, 800.0])
            .with_min_inner_size([640.0, 400.0]),
        ..Default::default()
    };
    eframe::run_native(
        "Sleep",
        native_options,
        Box::new(|cc| Ok(Box::new(SleepApp::new(cc, session, options)))),
    )
    .map_err(|err| anyhow::anyhow!("viewer: {err}"))
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    match run(&Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}
