//! Command line replay tool for the bayesnav filters.
use std::error::Error;
use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use log::{info, warn};

use bayesnav::config::FilterConfig;
use bayesnav::particle::ParticleAveragingStrategy;
use bayesnav::sim::{MeasurementRecord, ParticleScenario, run_particle_filter, run_ukf};

const LONG_ABOUT: &str = "Replay recorded sensor logs through the bayesnav estimators.

The `ukf` command fuses a lidar/radar measurement log with the CTRV unscented Kalman filter and
reports RMSE and NIS consistency against the logged ground truth. The `pf` command localizes a
vehicle against a landmark map with the particle filter. Filter parameters come from an optional
configuration file (TOML/JSON/YAML, see `config`), with individual command line flags taking
precedence.";

#[derive(Parser)]
#[command(author, version, about = "Particle filter and UKF replay tool.", long_about = LONG_ABOUT)]
struct Cli {
    /// Filter configuration file (TOML/JSON/YAML)
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
        name = "ukf",
        about = "Replay a lidar/radar log through the unscented Kalman filter"
    )]
    Ukf(UkfArgs),
    #[command(
        name = "pf",
        about = "Replay a landmark localization scenario through the particle filter"
    )]
    ParticleFilter(ParticleFilterArgs),
    #[command(name = "config", about = "Generate a template configuration file")]
    CreateConfig(CreateConfigArgs),
}

#[derive(Args, Clone, Debug)]
struct UkfArgs {
    /// Input measurement log (CSV)
    #[arg(short, long, value_parser)]
    input: PathBuf,

    /// Output CSV file path
    #[arg(short, long, value_parser)]
    output: PathBuf,

    /// Longitudinal acceleration noise std dev (m/s²)
    #[arg(long)]
    std_a: Option<f64>,

    /// Yaw acceleration noise std dev (rad/s²)
    #[arg(long)]
    std_yawdd: Option<f64>,

    /// Ignore lidar measurements after initialization
    #[arg(long)]
    no_laser: bool,

    /// Ignore radar measurements after initialization
    #[arg(long)]
    no_radar: bool,
}

#[derive(Args, Clone, Debug)]
struct ParticleFilterArgs {
    /// Landmark map (CSV: id,x,y)
    #[arg(long, value_parser)]
    map: PathBuf,

    /// Controls per step (CSV: velocity,yaw_rate)
    #[arg(long, value_parser)]
    controls: PathBuf,

    /// Vehicle-frame observations (CSV: step,x,y)
    #[arg(long, value_parser)]
    observations: PathBuf,

    /// Ground-truth poses per step (CSV: x,y,theta); the first pose seeds the filter
    #[arg(long, value_parser)]
    ground_truth: PathBuf,

    /// Output CSV file path
    #[arg(short, long, value_parser)]
    output: PathBuf,

    /// Number of particles
    #[arg(long)]
    num_particles: Option<usize>,

    /// Random seed
    #[arg(long)]
    seed: Option<u64>,

    /// How the population is reduced to a single pose estimate
    #[arg(long, value_enum)]
    averaging: Option<ParticleAveragingStrategy>,
}

#[derive(Args, Clone, Debug)]
struct CreateConfigArgs {
    /// Output file; the format follows the extension (.toml/.json/.yaml)
    #[arg(short, long, value_parser)]
    output: PathBuf,
}

/// Initialize the logger with a timestamped format, writing to stderr or a file.
fn init_logger(log_level: &str, log_file: Option<&PathBuf>) -> Result<(), Box<dyn Error>> {
    use std::io::Write;

    let level = log_level.parse::<log::LevelFilter>().unwrap_or_else(|_| {
        eprintln!("Invalid log level '{}', defaulting to 'info'", log_level);
        log::LevelFilter::Info
    });

    let mut builder = env_logger::Builder::new();
    builder.filter_level(level);
    builder.format(|buf, record| {
        writeln!(
            buf,
            "{} [{}] - {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            record.level(),
            record.args()
        )
    });

    if let Some(log_path) = log_file {
        if let Some(parent) = log_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let target = Box::new(
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_path)?,
        );
        builder.target(env_logger::Target::Pipe(target));
    }

    builder.try_init()?;
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<FilterConfig, Box<dyn Error>> {
    match path {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            Ok(FilterConfig::from_file(path)?)
        }
        None => Ok(FilterConfig::default()),
    }
}

fn run_ukf_replay(args: &UkfArgs, mut config: FilterConfig) -> Result<(), Box<dyn Error>> {
    if let Some(std_a) = args.std_a {
        config.ukf.std_a = std_a;
    }
    if let Some(std_yawdd) = args.std_yawdd {
        config.ukf.std_yawdd = std_yawdd;
    }
    if args.no_laser {
        config.ukf.use_laser = false;
    }
    if args.no_radar {
        config.ukf.use_radar = false;
    }
    let records = MeasurementRecord::from_csv(&args.input)?;
    info!(
        "Read {} measurements from {}",
        records.len(),
        args.input.display()
    );
    let result = run_ukf(&records, &config.ukf)?;
    result.to_csv(&args.output)?;
    info!(
        "RMSE px: {:.4}, py: {:.4}, vx: {:.4}, vy: {:.4}",
        result.rmse[0], result.rmse[1], result.rmse[2], result.rmse[3]
    );
    for (sensor, fraction) in [
        ("lidar", result.nis_lidar_exceedance),
        ("radar", result.nis_radar_exceedance),
    ] {
        match fraction {
            Some(fraction) => info!(
                "{} NIS above the 95% threshold: {:.1}%",
                sensor,
                100.0 * fraction
            ),
            None => warn!("No {} updates in this run", sensor),
        }
    }
    info!("Estimates written to {}", args.output.display());
    Ok(())
}

fn run_particle_filter_replay(
    args: &ParticleFilterArgs,
    mut config: FilterConfig,
) -> Result<(), Box<dyn Error>> {
    if let Some(num_particles) = args.num_particles {
        config.particle_filter.num_particles = num_particles;
    }
    if let Some(seed) = args.seed {
        config.particle_filter.seed = seed;
    }
    if let Some(averaging) = args.averaging {
        config.particle_filter.averaging_strategy = averaging;
    }
    let scenario = ParticleScenario::from_csv(
        &args.map,
        &args.controls,
        &args.observations,
        &args.ground_truth,
    )?;
    info!(
        "Loaded {} landmarks and {} steps",
        scenario.map.landmark_list.len(),
        scenario.num_steps()
    );
    let result = run_particle_filter(&scenario, &config.particle_filter, &config.scenario)?;
    result.to_csv(&args.output)?;
    let error = result.mean_error();
    info!(
        "Mean error x: {:.4}, y: {:.4}, yaw: {:.4}",
        error[0], error[1], error[2]
    );
    info!("Estimates written to {}", args.output.display());
    Ok(())
}

fn create_config_file(args: &CreateConfigArgs, config: FilterConfig) -> Result<(), Box<dyn Error>> {
    config.to_file(&args.output)?;
    info!("Configuration template written to {}", args.output.display());
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_logger(&cli.log_level, cli.log_file.as_ref())?;
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Ukf(args) => {
            info!("Running UKF replay with input: {}", args.input.display());
            run_ukf_replay(&args, config)
        }
        Command::ParticleFilter(args) => run_particle_filter_replay(&args, config),
        Command::CreateConfig(args) => create_config_file(&args, config),
    }
}
