//! Command-line driver: run a network described by a JSON file and stream
//! monitor samples to stdout as JSON lines.
//!
//! Examples:
//!   tractus demo
//!   tractus config > run.json
//!   tractus run run.json --checkpoint end.bin
//!   tractus run run.json --resume end.bin
//!
//! `TRACTUS_EXEC_TIER=scalar|simd|parallel` overrides the configured tier.

use std::error::Error;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::process;

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use tractus::connectivity::{self, Connectivity, WeightScaling};
use tractus::coupling::CouplingKind;
use tractus::error::EngineError;
use tractus::integrator::IntegratorConfig;
use tractus::kernels::ExecutionTier;
use tractus::model::LocalCoupling;
use tractus::models::Generic2dOscillator;
use tractus::monitors::MonitorConfig;
use tractus::noise::NoiseConfig;
use tractus::simulator::{Simulator, SimulatorConfig};

type CliResult<T> = Result<T, Box<dyn Error>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum NetworkConfig {
    /// Explicit matrices, `[target][source]`.
    Matrix {
        weights: Vec<Vec<f64>>,
        tract_lengths: Vec<Vec<f64>>,
        speed: f64,
    },
    Motif {
        motif: String,
        nodes: usize,
        radius: f64,
        speed: f64,
    },
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig::Motif {
            motif: "chain_undirected".into(),
            nodes: 8,
            radius: 20.0,
            speed: 4.0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct RunConfig {
    simulator: SimulatorConfig,
    network: NetworkConfig,
    scaling: WeightScaling,
    model: Generic2dOscillator,
    coupling: CouplingKind,
    integrator: IntegratorConfig,
    noise: Option<NoiseConfig>,
    monitors: Vec<MonitorConfig>,
    local_coupling: LocalCoupling,
}

impl RunConfig {
    fn demo() -> Self {
        RunConfig {
            simulator: SimulatorConfig::default().with_simulation_length(100.0),
            monitors: vec![MonitorConfig::TemporalAverage {
                period: 1.0,
                variables: Some(vec![0]),
            }],
            ..RunConfig::default()
        }
    }

    fn connectivity(&self) -> CliResult<Connectivity> {
        let dt = self.integrator.dt;
        let conn = match &self.network {
            NetworkConfig::Matrix {
                weights,
                tract_lengths,
                speed,
            } => Connectivity::from_tract_lengths(
                to_array2("weights", weights)?,
                &to_array2("tract_lengths", tract_lengths)?,
                *speed,
                dt,
            )?,
            NetworkConfig::Motif {
                motif,
                nodes,
                radius,
                speed,
            } => {
                let (weights, tracts) = match motif.as_str() {
                    "linear_directed" => connectivity::linear_directed(*nodes, *radius),
                    "linear_undirected" => connectivity::linear_undirected(*nodes, *radius),
                    "chain_directed" => connectivity::chain_directed(*nodes, *radius),
                    "chain_undirected" => connectivity::chain_undirected(*nodes, *radius),
                    "all_to_all" => connectivity::all_to_all(*nodes, *radius),
                    other => return Err(format!("unknown motif `{other}`").into()),
                };
                Connectivity::from_tract_lengths(weights, &tracts, *speed, dt)?
            }
        };
        Ok(conn.scaled_weights(self.scaling))
    }

    fn build(&self) -> CliResult<Simulator> {
        self.model.validate()?;
        let mut builder = Simulator::builder(Box::new(self.model), self.connectivity()?)
            .config(self.simulator)
            .coupling(self.coupling.clone())
            .integrator(self.integrator)
            .local_coupling(self.local_coupling.clone())
            .monitors(self.monitors.iter().map(MonitorConfig::build));
        if let Some(noise) = &self.noise {
            builder = builder.noise(noise.build()?);
        }
        Ok(builder.build()?)
    }
}

fn to_array2(name: &'static str, rows: &[Vec<f64>]) -> Result<Array2<f64>, EngineError> {
    let nrows = rows.len();
    let ncols = rows.first().map_or(0, Vec::len);
    if let Some(bad) = rows.iter().find(|r| r.len() != ncols) {
        return Err(EngineError::shape(name, &[nrows, ncols], &[nrows, bad.len()]));
    }
    let flat: Vec<f64> = rows.iter().flatten().copied().collect();
    Array2::from_shape_vec((nrows, ncols), flat)
        .map_err(|e| EngineError::invalid(name, e.to_string()))
}

fn print_help() {
    eprintln!("tractus: delayed-coupling network integration");
    eprintln!("Usage: tractus <command> [args]\n");
    eprintln!("Commands:");
    eprintln!("  demo                                   Run a small oscillator chain");
    eprintln!("  config                                 Print the demo run config as JSON");
    eprintln!("  run <config.json> [--checkpoint PATH] [--resume PATH]");
    eprintln!("                                         Run a config, optionally saving or");
    eprintln!("                                         resuming from a checkpoint");
    eprintln!("\nEnvironment:");
    eprintln!("  TRACTUS_EXEC_TIER=scalar|simd|parallel Override the execution tier");
}

struct RunArgs {
    config: PathBuf,
    checkpoint: Option<PathBuf>,
    resume: Option<PathBuf>,
}

fn parse_run_args(args: &[String]) -> CliResult<RunArgs> {
    let mut config = None;
    let mut checkpoint = None;
    let mut resume = None;
    let mut it = args.iter();
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--checkpoint" => {
                checkpoint = Some(PathBuf::from(it.next().ok_or("--checkpoint needs a path")?))
            }
            "--resume" => resume = Some(PathBuf::from(it.next().ok_or("--resume needs a path")?)),
            path if config.is_none() => config = Some(PathBuf::from(path)),
            other => return Err(format!("unexpected argument `{other}`").into()),
        }
    }
    Ok(RunArgs {
        config: config.ok_or("run needs a config file")?,
        checkpoint,
        resume,
    })
}

fn apply_tier_override(cfg: &mut RunConfig) {
    if let Ok(v) = std::env::var("TRACTUS_EXEC_TIER") {
        match v.parse::<ExecutionTier>() {
            Ok(tier) => cfg.simulator.execution_tier = tier,
            Err(_) => warn!("Unknown TRACTUS_EXEC_TIER value: {}", v),
        }
    }
}

fn execute(mut cfg: RunConfig, checkpoint: Option<PathBuf>, resume: Option<PathBuf>) -> CliResult<()> {
    apply_tier_override(&mut cfg);
    let mut sim = cfg.build()?;

    if let Some(path) = &resume {
        let mut r = BufReader::new(File::open(path)?);
        sim.restore_checkpoint_from(&mut r)?;
        info!(path = %path.display(), step = sim.current_step(), "resumed");
    }

    let names = sim.monitor_names();
    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    let mut emitted = 0usize;
    for output in sim.run() {
        let output = output?;
        for (name, sample) in names.iter().zip(&output.samples) {
            let Some(sample) = sample else { continue };
            let line = serde_json::json!({
                "step": output.step,
                "time": sample.time,
                "monitor": name,
                "shape": sample.data.shape(),
                "data": sample.data.iter().copied().collect::<Vec<f64>>(),
            });
            writeln!(out, "{line}")?;
            emitted += 1;
        }
    }
    out.flush()?;
    info!(
        samples = emitted,
        step = sim.current_step(),
        time = sim.current_time(),
        "run complete"
    );

    if let Some(path) = &checkpoint {
        let mut w = BufWriter::new(File::create(path)?);
        sim.save_checkpoint_to(&mut w)?;
        info!(path = %path.display(), bytes = sim.checkpoint_size_bytes()?, "checkpoint written");
    }
    Ok(())
}

fn dispatch(args: &[String]) -> CliResult<()> {
    match args.first().map(String::as_str) {
        None | Some("--help") | Some("-h") | Some("help") => {
            print_help();
            Ok(())
        }
        Some("demo") => execute(RunConfig::demo(), None, None),
        Some("config") => {
            println!("{}", serde_json::to_string_pretty(&RunConfig::demo())?);
            Ok(())
        }
        Some("run") => {
            let run = parse_run_args(&args[1..])?;
            let cfg: RunConfig = serde_json::from_reader(BufReader::new(File::open(&run.config)?))?;
            execute(cfg, run.checkpoint, run.resume)
        }
        Some(other) => {
            print_help();
            Err(format!("unknown command `{other}`").into())
        }
    }
}

fn main() {
    tracing_subscriber::fmt().with_writer(io::stderr).init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if let Err(e) = dispatch(&args) {
        eprintln!("error: {e}");
        process::exit(1);
    }
}
