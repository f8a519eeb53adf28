//! Renders a hypnogram file to a PNG figure.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context as _;
use clap::{ArgAction, Parser};
use sleepscore::StageDict;
use sleepscore::hypnoio::read_hypno_native;
use sleepscore::plot::{HypnoStyle, save_hypnogram_png};

#[derive(Parser, Debug)]
#[command(name = "fig_hyp", version, about = "Export a hypnogram figure", disable_help_flag = true)]
struct Args {
    #[arg(short = 'h', long = "hypno")]
    hypno: PathBuf,
    /// Draw grid lines.
    #[arg(short = 'g', long = "grid", default_value_t = false, action = ArgAction::Set)]
    grid: bool,
    /// One colour for the whole trace (`#rrggbb` or a name); stage colours otherwise.
    #[arg(short = 'c', long = "color")]
    color: Option<String>,
    #[arg(short = 'o', long = "outfile")]
    outfile: Option<PathBuf>,
    #[arg(long, default_value_t = 100)]
    dpi: u32,
    #[arg(long, action = ArgAction::Help)]
    help: Option<bool>,
}

fn run(args: Args) -> anyhow::Result<()> {
    let stages = StageDict::default();
    let (file, sf) = read_hypno_native(&args.hypno, &stages)
        .with_context(|| format!("reading {}", args.hypno.display()))?;
    let outfile = args.outfile.unwrap_or_else(|| args.hypno.with_extension("png"));
    let style = HypnoStyle {
        dpi: args.dpi,
        grid: args.grid,
        color: args.color,
        ..Default::default()
    };
    save_hypnogram_png(&outfile, &file.values, sf, &stages, &style)?;
    Ok(())
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}
