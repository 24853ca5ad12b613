//! STEPFILTER: offline replay tool for the floor-map constrained pedestrian particle filter.
//!
//! - `replay`: runs a recorded walk (a floor-plan image plus gyroscope step windows) through the
//!   filter and writes the estimate after every step to CSV.
//! - `init-config`: writes the default filter configuration to a TOML, JSON or YAML file.
use clap::{Args, Parser, Subcommand};
use log::{info, warn};
use std::error::Error;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use stepfilter::config::LocalizationConfig;
use stepfilter::replay::{EstimateRecord, load_motion_windows, replay_walk};

const LONG_ABOUT: &str = "STEPFILTER: replay a recorded indoor walk through a floor-map constrained particle filter.

Each detected step contributes one window of gyroscope samples. The heading change of the window
is integrated, every particle is moved one stride, particles that leave the walkable area or walk
through walls are discarded, and the swarm is resampled. The estimate after every step is written
to the output CSV.

Filter parameters are read from --config (TOML/JSON/YAML); use `init-config` to write a template.";

/// Command line arguments
#[derive(Parser)]
#[command(author, version, about = "Replay tool for a floor-map constrained pedestrian particle filter.", long_about = LONG_ABOUT)]
struct Cli {
    /// Filter configuration file (TOML/JSON/YAML). Defaults are used when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,

    /// Log level (off, error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Log file path (if not specified, logs to stderr)
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand, Clone)]
enum Command {
    #[command(
        name = "replay",
        about = "Replay a recorded walk",
        long_about = "Replay a recorded walk. The input is either a directory holding one gyroscope CSV per step (replayed in file-name order) or a single recording with a `step` column assigning every row to a step."
    )]
    Replay(ReplayArgs),

    #[command(name = "init-config", about = "Write the default configuration to a file")]
    InitConfig(InitConfigArgs),
}

#[derive(Args, Clone, Debug)]
struct ReplayArgs {
    /// Floor-plan image (any format the image crate decodes)
    #[arg(short, long)]
    floor_map: PathBuf,

    /// Gyroscope recording with a step column, or directory of per-step payloads
    #[arg(short, long)]
    input: PathBuf,

    /// Output CSV file path
    #[arg(short, long)]
    output: PathBuf,

    /// Base random seed; overrides the configured seed
    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Args, Clone, Debug)]
struct InitConfigArgs {
    /// Destination path; the extension selects the format
    path: PathBuf,
}

/// Parse a `--log-level` value, warning on stderr and falling back to `info` when it is not a
/// level name. The logger is not up yet, so the warning cannot go through `log`.
fn parse_log_level(log_level: &str) -> log::LevelFilter {
    log_level.parse().unwrap_or_else(|_| {
        eprintln!("unknown log level '{log_level}', using 'info'");
        log::LevelFilter::Info
    })
}

/// Append to `path`, creating it and its parent directories as needed.
fn open_log_file(path: &Path) -> io::Result<fs::File> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    fs::OpenOptions::new().create(true).append(true).open(path)
}

/// Route `log` records of the replay to stderr, or to `log_file` when given, one timestamped
/// line per record.
fn init_logger(log_level: &str, log_file: Option<&PathBuf>) -> Result<(), Box<dyn Error>> {
    let mut builder = env_logger::Builder::new();
    builder
        .filter_level(parse_log_level(log_level))
        .format(|buf, record| {
            writeln!(
                buf,
                "{} {:<5} {}: {}",
                chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.args()
            )
        });
    if let Some(path) = log_file {
        let file = open_log_file(path)?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.try_init()?;
    Ok(())
}

fn load_config(path: Option<&PathBuf>) -> Result<LocalizationConfig, Box<dyn Error>> {
    let config = match path {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            LocalizationConfig::from_file(path)?
        }
        None => LocalizationConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

fn run_replay(args: &ReplayArgs, config: &LocalizationConfig) -> Result<(), Box<dyn Error>> {
    let floor_map = fs::read(&args.floor_map)?;
    let windows = load_motion_windows(&args.input)?;
    if windows.is_empty() {
        warn!("No step windows found in {}", args.input.display());
    }
    let seed = args.seed.unwrap_or(config.seed);
    info!(
        "Replaying {} steps on {} with {} particles (seed {})",
        windows.len(),
        args.floor_map.display(),
        config.num_particles,
        seed
    );

    let records = replay_walk(&floor_map, &windows, config, seed)?;
    if let Some(parent) = args.output.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    EstimateRecord::to_csv(&records, &args.output)?;

    match records.last() {
        Some(last) => info!(
            "Final estimate ({:.2}, {:.2}), spread {:.2}, converged: {}",
            last.x, last.y, last.spread, last.converged
        ),
        None => info!("No estimates produced"),
    }
    info!("Results written to {}", args.output.display());
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_logger(&cli.log_level, cli.log_file.as_ref())?;

    match &cli.command {
        Command::Replay(args) => {
            let config = load_config(cli.config.as_ref())?;
            run_replay(args, &config)
        }
        Command::InitConfig(args) => {
            let config = match cli.config.as_ref() {
                Some(_) => load_config(cli.config.as_ref())?,
                None => LocalizationConfig::default(),
            };
            config.to_file(&args.path)?;
            info!("Configuration written to {}", args.path.display());
            Ok(())
        }
    }
}
