//! Computes sleep statistics from a hypnogram file.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context as _;
use clap::{ArgAction, Parser};
use sleepscore::StageDict;
use sleepscore::hypnoio::read_hypno_native;
use sleepscore::stats::SleepStats;

#[derive(Parser, Debug)]
#[command(name = "sleep_stats", version, about = "Sleep statistics of a hypnogram", disable_help_flag = true)]
struct Args {
    #[arg(short = 'h', long = "hypno")]
    hypno: PathBuf,
    /// CSV output; printed to the log when omitted.
    #[arg(short = 'o', long = "outfile")]
    outfile: Option<PathBuf>,
    #[arg(long, action = ArgAction::Help)]
    help: Option<bool>,
}

fn run(args: &Args) -> anyhow::Result<()> {
    let stages = StageDict::default();
    let (file, sf) = read_hypno_native(&args.hypno, &stages)
        .with_context(|| format!("reading {}", args.hypno.display()))?;
    let stats = SleepStats::compute(&file.values, sf, &stages);
    match &args.outfile {
        Some(path) => {
            stats
                .write_csv(path)
                .with_context(|| format!("writing {}", path.display()))?;
            log::info!("Sleep statistics saved to {}", path.display());
        }
        None => {
            for (key, value) in stats.rows() {
                log::info!("{key:>12}: {value:.2}");
            }
        }
    }
    Ok(())
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
