//! # tractus
//!
//! Time-stepping engine for networks of neural mass models coupled through
//! delayed, weighted connections.
//!
//! Every step gathers each node's delayed inputs from a ring-buffer history,
//! reduces them through a coupling function, advances the node dynamics
//! with a deterministic or stochastic scheme and hands the new state to a
//! set of monitors.
//!
//! ## Quick Start
//!
//! ```
//! use tractus::prelude::*;
//! use tractus::connectivity;
//!
//! let dt = 0.1;
//! let (weights, tracts) = connectivity::chain_undirected(4, 20.0);
//! let conn = Connectivity::from_tract_lengths(weights, &tracts, 4.0, dt).unwrap();
//!
//! let mut sim = Simulator::builder(Box::new(Generic2dOscillator::default()), conn)
//!     .config(SimulatorConfig::default().with_simulation_length(10.0))
//!     .integrator(IntegratorConfig::new(Scheme::Heun, dt))
//!     .monitor(Box::new(TemporalAverage::new(1.0)))
//!     .build()
//!     .unwrap();
//!
//! let samples: Vec<_> = sim.run().collect::<Result<_, _>>().unwrap();
//! assert_eq!(samples.len(), 10);
//! ```
//!
//! ## Feature Flags
//!
//! - `serde` (default): serialization of configuration types, required by
//!   the `tractus` binary
//! - `parallel`: per-node coupling reduction and array kernels via rayon
//! - `simd`: `f64x4` array kernels via the `wide` crate
//!
//! ## Modules
//!
//! - [`connectivity`]: weights, delays and the per-target edge table
//! - [`history`]: delay ring buffer
//! - [`coupling`]: coupling functions
//! - [`integrator`] and [`noise`]: schemes and their noise sources
//! - [`simulator`]: the step loop, runs and checkpoints
//! - [`monitors`]: observation of the state stream

#[path = "core/error.rs"]
pub mod error;

#[path = "core/prng.rs"]
pub mod prng;

#[path = "core/kernels.rs"]
pub mod kernels;

#[path = "core/connectivity.rs"]
pub mod connectivity;

#[path = "core/model.rs"]
pub mod model;

#[path = "core/history.rs"]
pub mod history;

#[path = "core/coupling.rs"]
pub mod coupling;

#[path = "core/noise.rs"]
pub mod noise;

#[path = "core/integrator.rs"]
pub mod integrator;

#[path = "core/stimulus.rs"]
pub mod stimulus;

#[path = "core/storage.rs"]
pub mod storage;

#[path = "core/simulator.rs"]
pub mod simulator;

pub mod models;

pub mod monitors;

/// Prelude module for convenient imports.
///
/// ```
/// use tractus::prelude::*;
/// ```
pub mod prelude {
    pub use crate::connectivity::{Connectivity, WeightScaling};
    pub use crate::coupling::{Coupling, CouplingKind};
    pub use crate::error::{EngineError, EngineResult};
    pub use crate::history::{DelayHistory, Step};
    pub use crate::integrator::{Integrator, IntegratorConfig, IntegratorPhase, Scheme};
    pub use crate::kernels::ExecutionTier;
    pub use crate::model::{LocalCoupling, Model, State, StateVariable};
    pub use crate::models::Generic2dOscillator;
    pub use crate::monitors::{
        GlobalAverage, Monitor, MonitorConfig, Raw, Sample, SubSample, TemporalAverage,
    };
    pub use crate::noise::{Noise, NoiseConfig, NoiseDispersion, RandomStream};
    pub use crate::simulator::{Simulator, SimulatorConfig, StepOutput};
    pub use crate::stimulus::{PulseTrain, RegionStimulus, Stimulus};
}
