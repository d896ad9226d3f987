//! The `drover` binary: static lockset-based race detection for lowered
//! device-driver modules.

use clap::{Parser, ValueEnum};
use drover_check::{CheckLimits, ExplicitChecker};
use drover_engine::pipeline::ExitOutcome;
use drover_engine::{
    pairing, DeviceDriver, PairingMethod, Pipeline, PipelineConfig, PipelineError,
    RaceCheckingVariant,
};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PairingArg {
    Linear,
    Triangular,
    Quadratic,
}

impl From<PairingArg> for PairingMethod {
    fn from(arg: PairingArg) -> Self {
        match arg {
            PairingArg::Linear => PairingMethod::Linear,
            PairingArg::Triangular => PairingMethod::Triangular,
            PairingArg::Quadratic => PairingMethod::Quadratic,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RaceCheckingArg {
    Normal,
    Watchdog,
}

impl From<RaceCheckingArg> for RaceCheckingVariant {
    fn from(arg: RaceCheckingArg) -> Self {
        match arg {
            RaceCheckingArg::Normal => RaceCheckingVariant::Normal,
            RaceCheckingArg::Watchdog => RaceCheckingVariant::Watchdog,
        }
    }
}

/// Static data-race detection for device-driver entry points.
#[derive(Debug, Parser)]
#[command(name = "drover", version, about)]
struct Cli {
    /// Lowered driver module (.dvl).
    source: PathBuf,

    /// Driver role file mapping kernel roles to entry-point functions.
    #[arg(long)]
    driver_info: PathBuf,

    /// Directory for intermediate artifacts and reports.
    #[arg(long, default_value = "drover-out")]
    out_dir: PathBuf,

    /// Entry-point pairing method.
    #[arg(long, value_enum, default_value = "linear")]
    pairing: PairingArg,

    /// Race-checking instrumentation variant.
    #[arg(long, value_enum, default_value = "watchdog")]
    race_checking: RaceCheckingArg,

    /// Maximum call-inlining depth in the verification backend.
    #[arg(long, default_value_t = 3)]
    inline_bound: usize,

    /// Per-pair verification timeout in seconds.
    #[arg(long)]
    timeout: Option<u64>,

    /// Print the generated entry-point pairs and exit.
    #[arg(long)]
    print_pairs: bool,

    /// Ignore previously inferred summaries.
    #[arg(long)]
    skip_inference: bool,

    /// Log the wall-clock time of each pass.
    #[arg(long)]
    time_passes: bool,

    /// Write the run statistics as JSON to this path.
    #[arg(long)]
    emit_json: Option<PathBuf>,
}

fn print_pairs(cli: &Cli) -> Result<(), PipelineError> {
    let info = fs::read_to_string(&cli.driver_info)?;
    let driver = DeviceDriver::parse(&info)?;
    let pairs = pairing::generate_pairs(&driver, cli.pairing.into());
    print!("{}", pairing::render_pairs(&pairs));
    Ok(())
}

fn run(cli: &Cli) -> ExitOutcome {
    if cli.source.extension().and_then(|e| e.to_str()) != Some("dvl") {
        error!("{}: expected a .dvl driver module", cli.source.display());
        return ExitOutcome::FatalError;
    }
    if cli.print_pairs {
        return match print_pairs(cli) {
            Ok(()) => ExitOutcome::Done,
            Err(err) => {
                error!("{err}");
                err.outcome()
            }
        };
    }

    let config = PipelineConfig {
        source: cli.source.clone(),
        driver_info: cli.driver_info.clone(),
        out_dir: cli.out_dir.clone(),
        pairing: cli.pairing.into(),
        race_checking: cli.race_checking.into(),
        skip_inference: cli.skip_inference,
        time_passes: cli.time_passes,
        limits: CheckLimits {
            inline_bound: cli.inline_bound,
            timeout: cli.timeout.map(Duration::from_secs),
            ..CheckLimits::default()
        },
    };

    let stats = match Pipeline::new(config).run(&ExplicitChecker) {
        Ok(stats) => stats,
        Err(PipelineError::Parse(parse_err)) => {
            eprintln!("{:?}", miette::Report::new(parse_err));
            return ExitOutcome::ParsingError;
        }
        Err(err) => {
            error!("{err}");
            return err.outcome();
        }
    };

    for pair in &stats.pairs {
        println!("{}: {}", pair.pair, pair.outcome);
        for race in &pair.races {
            println!("  {race}");
        }
    }
    println!(
        "verified: {} racy: {} inconclusive: {}",
        stats.verified, stats.racy, stats.inconclusive
    );

    if let Some(path) = &cli.emit_json {
        match serde_json::to_string_pretty(&stats) {
            Ok(json) => {
                if let Err(err) = fs::write(path, json) {
                    error!("failed to write {}: {err}", path.display());
                    return ExitOutcome::FatalError;
                }
            }
            Err(err) => {
                error!("failed to serialize statistics: {err}");
                return ExitOutcome::FatalError;
            }
        }
    }

    stats.outcome()
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    std::process::exit(run(&cli).code());
}
