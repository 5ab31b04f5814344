use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, error, info};
use orion_common::io::{load_initial_conditions, load_trajectory, save_initial_conditions, save_trajectory};
use orion_common::{EngineKind, SimError, SimulationConfig};
use orion_engine::initial_conditions;
use orion_engine::reference::prepare_reference_bodies;
use orion_engine::report::{write_clusters_csv, write_final_state_csv, write_merger_summary};
use orion_engine::{
    AdaptiveReferenceIntegrator, FixedStepIntegrator, Integrator, MergerDetector, OutputSchedule, Progress,
    RunOutput, SimulationEngine, UnitConversion,
};
use std::path::{Path, PathBuf};
use std::time::Instant;

const DEFAULT_CONFIG: &str = "config.toml";

/// Direct-summation N-body simulation and merger analysis
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the config.toml file; built-in defaults are used when omitted and ./config.toml is absent
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate clustered initial conditions
    Generate {
        /// Number of bodies
        #[arg(long)]
        n: Option<usize>,
        /// Box size in Mpc
        #[arg(long = "box")]
        box_mpc: Option<f64>,
        /// Random seed
        #[arg(long)]
        seed: Option<u64>,
        /// Output file (format from extension)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Run the fast fixed-step engine
    Run {
        /// Initial conditions file
        #[arg(short, long)]
        input: Option<PathBuf>,
    },
    /// Run the adaptive high-precision reference engine
    Reference {
        /// Initial conditions file
        #[arg(short, long)]
        input: Option<PathBuf>,
    },
    /// Detect mergers in the final snapshot of a trajectory
    Analyze {
        /// Trajectory file; defaults to the configured output of `--engine`
        #[arg(short, long)]
        trajectory: Option<PathBuf>,
        /// Which engine's trajectory to analyse
        #[arg(long, value_enum, default_value_t = EngineArg::Fast)]
        engine: EngineArg,
        /// Merger radius override
        #[arg(long)]
        radius: Option<f64>,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum EngineArg {
    Fast,
    Reference,
}

impl From<EngineArg> for EngineKind {
    fn from(arg: EngineArg) -> Self {
        match arg {
            EngineArg::Fast => EngineKind::Fast,
            EngineArg::Reference => EngineKind::Reference,
        }
    }
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if let Err(e) = run_command(cli) {
        match e.downcast_ref::<SimError>() {
            Some(SimError::MissingInput { .. }) => error!("{}", e),
            _ => error!("{:#}", e),
        }
        std::process::exit(1);
    }
}

fn run_command(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref())?;
    match cli.command {
        Command::Generate { n, box_mpc, seed, output } => generate(config, n, box_mpc, seed, output),
        Command::Run { input } => run_fast(&config, input),
        Command::Reference { input } => run_reference(&config, input),
        Command::Analyze { trajectory, engine, radius } => analyze(config, trajectory, engine.into(), radius),
    }
}

fn load_config(path: Option<&Path>) -> Result<SimulationConfig> {
    match path {
        Some(path) => SimulationConfig::load(path),
        None if Path::new(DEFAULT_CONFIG).exists() => SimulationConfig::load(DEFAULT_CONFIG),
        None => {
            info!("No {} found, using built-in defaults.", DEFAULT_CONFIG);
            Ok(SimulationConfig::default())
        }
    }
}

fn generate(
    mut config: SimulationConfig,
    n: Option<usize>,
    box_mpc: Option<f64>,
    seed: Option<u64>,
    output: Option<PathBuf>,
) -> Result<()> {
    let ic_config = &mut config.initial_conditions;
    if let Some(n) = n {
        ic_config.num_bodies = n;
    }
    if let Some(box_mpc) = box_mpc {
        ic_config.box_size_mpc = box_mpc;
    }
    if let Some(seed) = seed {
        ic_config.seed = seed;
    }
    config.validate()?;

    let ic = initial_conditions::generate(&config.initial_conditions)?;
    let path = output.unwrap_or_else(|| config.output.initial_conditions_path());
    let format = orion_common::OutputFormat::from_path(&path).unwrap_or(config.output.format);
    save_initial_conditions(&path, &ic, format)
}

fn run_fast(config: &SimulationConfig, input: Option<PathBuf>) -> Result<()> {
    let params = config.get_sim_params();
    debug!("Simulation Parameters: {:#?}", params);
    info!("Using {} Rayon threads.", rayon::current_num_threads());

    let ic_path = input.unwrap_or_else(|| config.output.initial_conditions_path());
    let ic = load_initial_conditions(&ic_path)?;
    info!("Loaded {} bodies from {}", ic.len(), ic_path.display());

    let engine = SimulationEngine::from_initial_conditions(&ic, FixedStepIntegrator::from_params(&params))?
        .with_energy_tracking(params.g, params.softening_sq);
    let schedule = OutputSchedule::from_params(&params)?;
    let output = run_with_progress(engine, &schedule)?;

    save_trajectory(
        &config.output.trajectory_path(EngineKind::Fast),
        &output.trajectory,
        config.output.format,
    )?;
    if config.output.save_final_positions {
        write_final_state_csv(&config.output.final_positions_path(EngineKind::Fast), &output.final_state)?;
    } else {
        info!("Skipping saving final positions as per config.");
    }
    Ok(())
}

fn run_reference(config: &SimulationConfig, input: Option<PathBuf>) -> Result<()> {
    let params = config.get_reference_params();
    debug!("Reference Parameters: {:#?}", params);

    let ic_path = input.unwrap_or_else(|| config.output.initial_conditions_path());
    let ic = load_initial_conditions(&ic_path)?;
    let bodies = prepare_reference_bodies(&ic, &params)?;

    let engine = SimulationEngine::new(bodies, AdaptiveReferenceIntegrator::from_params(&params))
        .with_energy_tracking(params.g, params.softening_sq);
    let schedule = OutputSchedule::linspace(params.end_time, params.snapshots)?
        .with_progress_every(config.timing.progress_every);
    let mut output = run_with_progress(engine, &schedule)?;
    info!(
        "Reference integration: {} accepted and {} rejected steps, smallest step {:.3e}",
        output.stats.integration.substeps, output.stats.integration.rejected, output.stats.integration.smallest_step
    );

    save_trajectory(
        &config.output.trajectory_path(EngineKind::Reference),
        &output.trajectory,
        config.output.format,
    )?;
    if config.output.save_final_positions {
        UnitConversion::from_params(&params).from_reference_units(&mut output.final_state);
        write_final_state_csv(
            &config.output.final_positions_path(EngineKind::Reference),
            &output.final_state,
        )?;
    }
    Ok(())
}

fn run_with_progress<I: Integrator>(engine: SimulationEngine<I>, schedule: &OutputSchedule) -> Result<RunOutput> {
    let bar = ProgressBar::new(schedule.len());
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
            .context("Invalid progress bar template")?
            .progress_chars("#>-"),
    );
    let start = Instant::now();
    let mut on_progress = |p: &Progress| {
        bar.set_position(p.step);
        bar.set_message(format!("t = {:.4e}", p.time));
    };
    let result = engine.run(schedule, Some(&mut on_progress));
    bar.finish_and_clear();

    let output = result?;
    if let Some(drift) = output.stats.relative_energy_drift() {
        info!("Relative energy drift: {:.3e}", drift);
    }
    info!(
        "Simulation finished in {:.3} seconds ({:.3} minutes).",
        start.elapsed().as_secs_f64(),
        start.elapsed().as_secs_f64() / 60.0
    );
    Ok(output)
}

fn analyze(
    mut config: SimulationConfig,
    trajectory: Option<PathBuf>,
    engine: EngineKind,
    radius: Option<f64>,
) -> Result<()> {
    if let Some(radius) = radius {
        config.analysis.merger_radius = radius;
    }
    let stage = match engine {
        EngineKind::Fast => "run",
        EngineKind::Reference => "reference",
    };
    let path = trajectory.unwrap_or_else(|| config.output.trajectory_path(engine));
    let trajectory = load_trajectory(&path, stage)?;

    let detector = MergerDetector::from_config(&config.analysis)?;
    let report = detector.detect_final(&trajectory)?;

    write_clusters_csv(&config.output.clusters_path(), &report)?;
    write_merger_summary(&config.output.merger_summary_path(), &report)?;
    Ok(())
}
