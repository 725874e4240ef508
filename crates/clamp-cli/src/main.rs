//! # Clamp CLI
//!
//! Command-line front end for stimulus clamp simulation and model fitting.

use anyhow::{bail, Context};
use clamp_core::AbortFlag;
use clamp_markov::{models, KineticModel, MarkovModel};
use clamp_protocol::reference::ReferenceData;
use clamp_protocol::{
    dwt, OptimizationReport, OptimizerOptions, OptimizerProgress, Protocol, SimulationOptions,
    Simulator, SolverMethod,
};
use clap::{Args, Parser, Subcommand, ValueEnum};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::mpsc;

#[derive(Parser)]
#[command(name = "clamp")]
#[command(version = "0.1.0")]
#[command(about = "Stimulus clamp simulation of ion-channel kinetic models", long_about = None)]
struct Cli {
    /// Show debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Simulate every protocol of a configuration
    Simulate {
        /// JSON configuration file
        config: PathBuf,
        #[command(flatten)]
        run: RunArgs,
    },

    /// Fit the model's free parameters to the reference data
    Fit {
        /// JSON configuration file
        config: PathBuf,
        #[command(flatten)]
        run: RunArgs,
        #[arg(long)]
        max_iterations: Option<usize>,
        #[arg(long)]
        tolerance: Option<f64>,
    },

    /// Recover the opening rate of a two-state channel from synthetic data
    Demo {
        #[command(flatten)]
        run: RunArgs,
    },

    /// List built-in models
    List,
}

#[derive(Args)]
struct RunArgs {
    /// Solver, overriding the configuration
    #[arg(short, long, value_enum)]
    method: Option<Method>,
    /// Monte Carlo trajectories per condition
    #[arg(short, long)]
    runs: Option<usize>,
    #[arg(short, long)]
    seed: Option<u64>,
    /// Write Monte Carlo trajectories as `<base> (set,row,col).dwt`
    #[arg(short, long)]
    export: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
enum Method {
    Spectral,
    MonteCarlo,
}

impl From<Method> for SolverMethod {
    fn from(method: Method) -> Self {
        match method {
            Method::Spectral => SolverMethod::Spectral,
            Method::MonteCarlo => SolverMethod::MonteCarlo,
        }
    }
}

impl RunArgs {
    fn apply(&self, options: &mut SimulationOptions) {
        if let Some(method) = self.method {
            options.method = method.into();
        }
        if let Some(runs) = self.runs {
            options.monte_carlo_runs = runs;
        }
        if let Some(seed) = self.seed {
            options.seed = seed;
        }
    }
}

/// Built-in model name or a full model description
#[derive(Deserialize)]
#[serde(untagged)]
enum ModelSource {
    Named(String),
    Inline(MarkovModel),
}

#[derive(Deserialize)]
struct RunConfig {
    model: ModelSource,
    protocols: Vec<Protocol>,
    #[serde(default)]
    simulation: SimulationOptions,
    #[serde(default)]
    optimizer: OptimizerOptions,
}

impl RunConfig {
    fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let mut config: RunConfig = serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))?;

        // Reference files are relative to the configuration
        let dir = path.parent().unwrap_or_else(|| Path::new(""));
        for protocol in &mut config.protocols {
            for data in &mut protocol.reference_data {
                if let Some(file) = data.file.as_mut() {
                    if file.is_relative() {
                        *file = dir.join(&*file);
                    }
                }
            }
        }
        log::info!(
            "loaded {} protocol(s) from {}",
            config.protocols.len(),
            path.display()
        );
        Ok(config)
    }

    fn model(&self) -> anyhow::Result<MarkovModel> {
        match &self.model {
            ModelSource::Named(name) => match models::by_name(name) {
                Some(model) => {
                    log::debug!("using built-in model '{}'", name);
                    Ok(model)
                }
                None => bail!("unknown model '{}' (try `clamp list`)", name),
            },
            ModelSource::Inline(model) => Ok(model.clone()),
        }
    }
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn print_protocols<M: KineticModel>(sim: &Simulator<M>) {
    for protocol in &sim.protocols {
        let (rows, cols) = protocol.dims();
        println!(
            "  {} {}x{} conditions, cost {:.6e}",
            protocol.name.cyan(),
            rows,
            cols,
            protocol.cost(sim.state_names())
        );
        for summary in protocol.summaries.iter().filter(|s| s.active) {
            if let (Some(x), Some(y)) = (summary.data_x.first(), summary.data_y.first()) {
                for row in 0..x.nrows() {
                    let points: Vec<String> = x
                        .row(row)
                        .iter()
                        .zip(y.row(row))
                        .map(|(a, b)| format!("({:.4}, {:.4})", a, b))
                        .collect();
                    println!("    {}[{}] {}", summary.name, row, points.join(" "));
                }
            }
        }
    }
    println!("  unique epochs: {}", sim.unique_epochs().len());
    println!("  probability error: {:.3e}", sim.max_probability_error());
}

fn export_runs<M: KineticModel>(sim: &Simulator<M>, base: Option<&Path>) -> anyhow::Result<()> {
    let Some(base) = base else {
        return Ok(());
    };
    if sim.options.method != SolverMethod::MonteCarlo {
        log::warn!("dwt export needs the monte-carlo solver, skipped");
        return Ok(());
    }
    for protocol in &sim.protocols {
        let stem = if sim.protocols.len() > 1 {
            PathBuf::from(format!("{} {}", base.display(), protocol.name))
        } else {
            base.to_path_buf()
        };
        let written = dwt::export(protocol, &stem)?;
        println!("  wrote {} dwt file(s) for {}", written.len(), protocol.name.cyan());
    }
    Ok(())
}

fn print_report(report: &OptimizationReport) {
    let status = if report.converged {
        "converged".green().bold()
    } else if report.aborted {
        "aborted".red().bold()
    } else {
        "stopped".yellow().bold()
    };
    println!("{} after {} iterations, cost {:.6e}", status, report.iterations, report.cost);
    for (name, value) in &report.parameters {
        println!("  {} = {:.6}", name.cyan(), value);
    }
    if let Some(message) = &report.message {
        println!("  {}", message.yellow());
    }
}

fn fit<M: KineticModel>(sim: &mut Simulator<M>, options: &OptimizerOptions) -> anyhow::Result<OptimizationReport> {
    let bar = ProgressBar::new(options.max_iterations as u64);
    bar.set_style(ProgressStyle::with_template("{bar:40.cyan/blue} {pos}/{len} {msg}")?);

    let abort = AbortFlag::new();
    let (tx, rx) = mpsc::channel::<OptimizerProgress>();
    let report = std::thread::scope(|scope| {
        let progress = bar.clone();
        scope.spawn(move || {
            for update in rx {
                progress.set_position(update.iteration as u64);
                progress.set_message(format!("cost {:.4e}", update.cost));
            }
        });
        let report = sim.optimize(options, &abort, Some(&tx));
        drop(tx);
        report
    })?;
    bar.finish_and_clear();
    if report.aborted {
        log::warn!("fit aborted after {} iterations", report.iterations);
    }
    Ok(report)
}

fn demo_protocol() -> Protocol {
    let mut protocol = Protocol::new("relaxation", 2.0, 0.02);
    let time: Vec<f64> = (0..=100).map(|i| i as f64 * 0.02).collect();
    // Open probability of k12 = 1, k21 = 2 starting closed
    let open: Vec<f64> = time.iter().map(|t| (1.0 - (-3.0 * t).exp()) / 3.0).collect();
    protocol.add_reference_data(ReferenceData::new(
        "O",
        vec!["t".to_string(), "O".to_string()],
        vec![time, open],
    ));
    protocol
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Simulate { config, run } => {
            println!("{} {}", "Loading configuration:".green().bold(), config.display());
            let config = RunConfig::load(&config)?;
            let mut options = config.simulation.clone();
            run.apply(&mut options);

            let mut sim = Simulator::new(config.model()?, config.protocols, options);
            println!("{} {}", "Simulating with".green().bold(), sim.options.method);
            if sim.simulate(&AbortFlag::new())?.is_aborted() {
                bail!("simulation aborted");
            }
            print_protocols(&sim);
            println!("  total cost: {:.6e}", sim.cost());
            export_runs(&sim, run.export.as_deref())?;
        }

        Commands::Fit {
            config,
            run,
            max_iterations,
            tolerance,
        } => {
            println!("{} {}", "Loading configuration:".green().bold(), config.display());
            let config = RunConfig::load(&config)?;
            let mut options = config.simulation.clone();
            run.apply(&mut options);
            let mut optimizer = config.optimizer.clone();
            if let Some(max) = max_iterations {
                optimizer.max_iterations = max;
            }
            if let Some(tolerance) = tolerance {
                optimizer.tolerance = tolerance;
            }

            let mut sim = Simulator::new(config.model()?, config.protocols, options);
            println!(
                "{} {} free parameter(s)",
                "Fitting".green().bold(),
                sim.model().free_parameters().len()
            );
            let report = fit(&mut sim, &optimizer)?;
            print_report(&report);
            print_protocols(&sim);
            export_runs(&sim, run.export.as_deref())?;
        }

        Commands::Demo { run } => {
            let mut model = models::two_state(3.0, 2.0);
            if let Some(k12) = model.get_parameter_mut("k12") {
                *k12 = k12.clone().free(0.1, 10.0);
            }
            let mut options = SimulationOptions::default();
            run.apply(&mut options);

            println!("{}", "Fitting k12 of a two-state channel (true value 1.0)".green().bold());
            let mut sim = Simulator::new(model, vec![demo_protocol()], options);
            let report = fit(&mut sim, &OptimizerOptions::default())?;
            print_report(&report);
            export_runs(&sim, run.export.as_deref())?;
        }

        Commands::List => {
            println!("{}", "Built-in Models:".green().bold());
            println!();
            for name in models::NAMES {
                if let Some(model) = models::by_name(name) {
                    let free = model.free_parameters();
                    println!(
                        "  {} - {} states, {} transitions, {} free parameter(s)",
                        name.cyan(),
                        model.states.len(),
                        model.transitions.len(),
                        free.len()
                    );
                }
            }
        }
    }

    Ok(())
}
