//! The step loop tying history, coupling, integrator and monitors together.
//!
//! Step `k` reads the coupling from the history as seen at `k - 1`, advances
//! the state written at `k - 1`, writes the result into the history at `k`
//! and offers it to every monitor at time `k * dt`.

use std::io::{self, Read, Write};
use std::iter::FusedIterator;

use tracing::{debug, info, warn};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::connectivity::Connectivity;
use crate::coupling::{Coupling, CouplingKind};
use crate::error::{EngineError, EngineResult};
use crate::history::{DelayHistory, DelayedStates, Step};
use crate::integrator::{Integrator, IntegratorConfig, StageCoupling, StepInputs};
use crate::kernels::ExecutionTier;
use crate::model::{random_initial_state, CouplingInput, LocalCoupling, Model, State};
use crate::monitors::{Monitor, Raw, Sample};
use crate::noise::{Noise, NoiseConfig, RandomStream, StreamState, DEFAULT_SEED};
use crate::prng::Prng;
use crate::stimulus::Stimulus;
use crate::storage;

const TAG_STEP: [u8; 4] = *b"STEP";
const TAG_SHAPE: [u8; 4] = *b"SHAP";
const TAG_STATE: [u8; 4] = *b"STAT";
const TAG_HISTORY: [u8; 4] = *b"HIST";
const TAG_STREAM: [u8; 4] = *b"PRNG";
const TAG_ETA: [u8; 4] = *b"ETA0";

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SimulatorConfig {
    /// Length of one [`Simulator::run`] (ms).
    pub simulation_length: f64,
    pub number_of_modes: usize,
    pub execution_tier: ExecutionTier,
    /// Seed for random initial conditions.
    pub initial_seed: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            simulation_length: 1000.0,
            number_of_modes: 1,
            execution_tier: ExecutionTier::Scalar,
            initial_seed: DEFAULT_SEED,
        }
    }
}

impl SimulatorConfig {
    pub fn with_simulation_length(mut self, length: f64) -> Self {
        self.simulation_length = length;
        self
    }

    pub fn with_number_of_modes(mut self, nmode: usize) -> Self {
        self.number_of_modes = nmode;
        self
    }

    pub fn with_execution_tier(mut self, tier: ExecutionTier) -> Self {
        self.execution_tier = tier;
        self
    }

    pub fn with_initial_seed(mut self, seed: u64) -> Self {
        self.initial_seed = seed;
        self
    }

    pub fn validate(&self) -> EngineResult<()> {
        check_length(self.simulation_length)?;
        if self.number_of_modes == 0 {
            return Err(EngineError::invalid("number_of_modes", "must be >= 1"));
        }
        Ok(())
    }
}

fn check_length(length: f64) -> EngineResult<()> {
    if !length.is_finite() || length <= 0.0 {
        return Err(EngineError::invalid(
            "simulation_length",
            format!("must be finite and > 0, got {length}"),
        ));
    }
    Ok(())
}

/// Number of steps covering `length`; a ratio within rounding noise of an
/// integer is not rounded up.
fn steps_for(length: f64, dt: f64) -> u64 {
    let ratio = length / dt;
    let nearest = ratio.round();
    if (ratio - nearest).abs() <= 1e-9 * nearest.max(1.0) {
        nearest as u64
    } else {
        ratio.ceil() as u64
    }
}

/// Result of one step: one slot per monitor, `Some` where it emitted.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutput {
    pub step: Step,
    pub time: f64,
    pub samples: Vec<Option<Sample>>,
}

impl StepOutput {
    pub fn any_emitted(&self) -> bool {
        self.samples.iter().any(Option::is_some)
    }
}

pub struct SimulatorBuilder {
    config: SimulatorConfig,
    model: Box<dyn Model>,
    connectivity: Connectivity,
    coupling: CouplingKind,
    integrator: IntegratorConfig,
    noise: Option<Noise>,
    monitors: Vec<Box<dyn Monitor>>,
    local: LocalCoupling,
    stimulus: Option<Box<dyn Stimulus>>,
    initial: Option<State>,
    horizon: Option<usize>,
}

impl SimulatorBuilder {
    pub fn config(mut self, config: SimulatorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn coupling(mut self, kind: CouplingKind) -> Self {
        self.coupling = kind;
        self
    }

    pub fn integrator(mut self, config: IntegratorConfig) -> Self {
        self.integrator = config;
        self
    }

    /// Noise for a stochastic scheme. Without one, a stochastic scheme
    /// gets `NoiseConfig::default()`.
    pub fn noise(mut self, noise: Noise) -> Self {
        self.noise = Some(noise);
        self
    }

    pub fn monitor(mut self, monitor: Box<dyn Monitor>) -> Self {
        self.monitors.push(monitor);
        self
    }

    pub fn monitors(mut self, monitors: impl IntoIterator<Item = Box<dyn Monitor>>) -> Self {
        self.monitors.extend(monitors);
        self
    }

    pub fn local_coupling(mut self, local: LocalCoupling) -> Self {
        self.local = local;
        self
    }

    pub fn stimulus(mut self, stimulus: Box<dyn Stimulus>) -> Self {
        self.stimulus = Some(stimulus);
        self
    }

    /// Explicit `(nvar, nnode, nmode)` initial state; otherwise drawn
    /// uniformly inside the model's state-variable bounds.
    pub fn initial_conditions(mut self, state: State) -> Self {
        self.initial = Some(state);
        self
    }

    /// History length in steps; must exceed the longest delay.
    pub fn history_horizon(mut self, horizon: usize) -> Self {
        self.horizon = Some(horizon);
        self
    }

    pub fn build(self) -> EngineResult<Simulator> {
        self.config.validate()?;
        self.integrator.validate()?;

        let nvar = self.model.nvar();
        let nnode = self.connectivity.number_of_nodes();
        let nmode = self.config.number_of_modes;
        let shape = (nvar, nnode, nmode);

        let cvar = self.model.coupling_variables().to_vec();
        if let Some(v) = cvar.iter().find(|&&v| v >= nvar) {
            return Err(EngineError::invalid(
                "coupling variables",
                format!("coupling variable {v} out of range for {nvar} state variables"),
            ));
        }
        self.local.validate(nnode)?;
        if let Some(stimulus) = &self.stimulus {
            stimulus.validate(shape)?;
        }

        let mut coupling = Coupling::new(self.coupling);
        coupling.configure()?;
        let required = coupling.kind().required_coupling_variables();
        if cvar.len() < required {
            return Err(EngineError::invalid(
                "coupling variables",
                format!(
                    "{} needs {required} coupling variables, model exposes {}",
                    coupling.kind().name(),
                    cvar.len()
                ),
            ));
        }

        let mut history = match self.horizon {
            Some(h) => DelayHistory::with_horizon(&self.connectivity, &cvar, nmode, h)?,
            None => DelayHistory::new(&self.connectivity, &cvar, nmode)?,
        };

        let tier = self.config.execution_tier.effective();
        if tier != self.config.execution_tier {
            warn!(
                requested = ?self.config.execution_tier,
                using = ?tier,
                "execution tier not compiled in, falling back"
            );
        }

        let noise = match (self.integrator.stochastic, self.noise) {
            (true, None) => Some(NoiseConfig::default().build()?),
            (_, noise) => noise,
        };
        let mut integrator = self.integrator.build(noise)?;
        integrator.set_execution_tier(tier);
        integrator.configure(self.integrator.dt, shape)?;

        let mut monitors = self.monitors;
        if monitors.is_empty() {
            monitors.push(Box::new(Raw::new()));
        }
        for m in monitors.iter_mut() {
            m.configure(self.integrator.dt, shape)?;
        }

        let initial = match self.initial {
            Some(state) => {
                if state.dim() != shape {
                    return Err(EngineError::shape(
                        "initial conditions",
                        &[nvar, nnode, nmode],
                        state.shape(),
                    ));
                }
                state
            }
            None => {
                let mut stream = RandomStream::new(self.config.initial_seed);
                random_initial_state(self.model.as_ref(), nnode, nmode, stream.prng_mut())?
            }
        };
        history.fill(0, &initial);

        info!(
            nodes = nnode,
            connections = self.connectivity.number_of_connections(),
            horizon = history.horizon(),
            coupling = coupling.kind().name(),
            scheme = integrator.scheme().name(),
            stochastic = integrator.is_stochastic(),
            monitors = monitors.len(),
            steps_per_run = steps_for(self.config.simulation_length, self.integrator.dt),
            "simulator configured"
        );

        let delayed = history.delayed_states();
        let ncvar = cvar.len();
        Ok(Simulator {
            config: self.config,
            model: self.model,
            connectivity: self.connectivity,
            coupling,
            integrator,
            monitors,
            local: self.local,
            stimulus: self.stimulus,
            state: initial.clone(),
            initial,
            step: 0,
            tier,
            delayed_next: delayed.clone(),
            delayed,
            c_now: CouplingInput::zeros((ncvar, nnode, nmode)),
            c_next: CouplingInput::zeros((ncvar, nnode, nmode)),
            stim: State::zeros(shape),
            history,
        })
    }
}

/// A configured network ready to step.
pub struct Simulator {
    config: SimulatorConfig,
    model: Box<dyn Model>,
    connectivity: Connectivity,
    coupling: Coupling,
    history: DelayHistory,
    integrator: Box<dyn Integrator>,
    monitors: Vec<Box<dyn Monitor>>,
    local: LocalCoupling,
    stimulus: Option<Box<dyn Stimulus>>,
    initial: State,
    state: State,
    step: Step,
    tier: ExecutionTier,
    // scratch reused across steps
    delayed: DelayedStates,
    delayed_next: DelayedStates,
    c_now: CouplingInput,
    c_next: CouplingInput,
    stim: State,
}

impl Simulator {
    pub fn builder(model: Box<dyn Model>, connectivity: Connectivity) -> SimulatorBuilder {
        SimulatorBuilder {
            config: SimulatorConfig::default(),
            model,
            connectivity,
            coupling: CouplingKind::default(),
            integrator: IntegratorConfig::default(),
            noise: None,
            monitors: Vec::new(),
            local: LocalCoupling::default(),
            stimulus: None,
            initial: None,
            horizon: None,
        }
    }

    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    pub fn history(&self) -> &DelayHistory {
        &self.history
    }

    pub fn integrator(&self) -> &dyn Integrator {
        self.integrator.as_ref()
    }

    pub fn monitor_names(&self) -> Vec<&'static str> {
        self.monitors.iter().map(|m| m.name()).collect()
    }

    /// Latest state, `(nvar, nnode, nmode)`.
    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn current_step(&self) -> Step {
        self.step
    }

    pub fn current_time(&self) -> f64 {
        self.step as f64 * self.integrator.dt()
    }

    pub fn dt(&self) -> f64 {
        self.integrator.dt()
    }

    /// Advance one step.
    ///
    /// Fails with [`EngineError::Finished`] after a run was exhausted; the
    /// next [`run`](Self::run) resumes.
    pub fn step(&mut self) -> EngineResult<StepOutput> {
        let prev = self.step;
        let next = prev + 1;
        let dt = self.integrator.dt();
        let time = next as f64 * dt;

        self.history.query_into(prev, &mut self.delayed);
        self.coupling
            .reduce_into(&self.delayed, self.history.edges(), self.tier, &mut self.c_now)?;

        let needs_next = self.integrator.scheme().needs_next_coupling();
        if needs_next {
            self.history.query_ahead_into(next, &mut self.delayed_next);
            self.coupling.reduce_into(
                &self.delayed_next,
                self.history.edges(),
                self.tier,
                &mut self.c_next,
            )?;
        }

        if let Some(stimulus) = &self.stimulus {
            self.stim.fill(0.0);
            stimulus.evaluate(time, &mut self.stim);
        }

        let inputs = StepInputs {
            model: self.model.as_ref(),
            coupling: StageCoupling {
                current: &self.c_now,
                next: needs_next.then_some(&self.c_next),
            },
            local: &self.local,
            stimulus: self.stimulus.as_ref().map(|_| &self.stim),
        };
        let new_state = self.integrator.scheme_step(&self.state, &inputs)?;

        self.history.update(next, &new_state);
        self.state = new_state;
        self.step = next;

        let samples = self
            .monitors
            .iter_mut()
            .map(|m| m.record(next, &self.state))
            .collect();
        Ok(StepOutput {
            step: next,
            time,
            samples,
        })
    }

    /// Lazily step through `simulation_length`, yielding on monitor emission.
    pub fn run(&mut self) -> Run<'_> {
        let steps = steps_for(self.config.simulation_length, self.integrator.dt());
        Run::new(self, steps)
    }

    /// Like [`run`](Self::run) for an explicit length (ms).
    pub fn run_for(&mut self, length: f64) -> EngineResult<Run<'_>> {
        check_length(length)?;
        let steps = steps_for(length, self.integrator.dt());
        Ok(Run::new(self, steps))
    }

    /// Back to the initial conditions with a rewound noise stream and empty
    /// monitor windows.
    pub fn reset(&mut self) -> EngineResult<()> {
        if let Some(noise) = self.integrator.noise_mut() {
            noise.generator_mut().reset()?;
        }
        self.integrator.resume()?;
        self.state = self.initial.clone();
        self.step = 0;
        self.history.fill(0, &self.initial);
        for m in self.monitors.iter_mut() {
            m.reset();
        }
        debug!("simulator reset");
        Ok(())
    }

    /// Write the resumable engine state.
    ///
    /// Monitor windows are not saved; averaging monitors start a fresh
    /// window after a restore.
    pub fn save_checkpoint_to<W: Write>(&self, w: &mut W) -> EngineResult<()> {
        w.write_all(storage::MAGIC)?;
        storage::write_u32_le(w, storage::VERSION_CURRENT)?;

        let mut buf = Vec::new();
        storage::write_u64_le(&mut buf, self.step)?;
        storage::write_f64_le(&mut buf, self.integrator.dt())?;
        storage::write_chunk_lz4(w, TAG_STEP, &buf)?;

        buf.clear();
        for dim in self.checkpoint_shape() {
            storage::write_u64_le(&mut buf, dim)?;
        }
        storage::write_chunk_lz4(w, TAG_SHAPE, &buf)?;

        buf.clear();
        storage::write_f64_seq(&mut buf, self.state.len(), self.state.iter().copied())?;
        storage::write_chunk_lz4(w, TAG_STATE, &buf)?;

        buf.clear();
        storage::write_f64_seq(&mut buf, self.history.len_values(), self.history.values())?;
        storage::write_chunk_lz4(w, TAG_HISTORY, &buf)?;

        if let Some(noise) = self.integrator.noise() {
            let generator = noise.generator();
            let stream = generator.stream().state();
            buf.clear();
            storage::write_u64_le(&mut buf, stream.word)?;
            match stream.spare {
                Some(v) => {
                    storage::write_u8(&mut buf, 1)?;
                    storage::write_f64_le(&mut buf, v)?;
                }
                None => storage::write_u8(&mut buf, 0)?,
            }
            storage::write_chunk_lz4(w, TAG_STREAM, &buf)?;

            if let Some(eta) = generator.eta() {
                buf.clear();
                storage::write_f64_seq(&mut buf, eta.len(), eta.iter().copied())?;
                storage::write_chunk_lz4(w, TAG_ETA, &buf)?;
            }
        }

        w.flush()?;
        Ok(())
    }

    pub fn checkpoint_size_bytes(&self) -> EngineResult<usize> {
        let mut w = storage::CountingWriter::new();
        self.save_checkpoint_to(&mut w)?;
        Ok(w.written())
    }

    /// Continue from a checkpoint written by a simulator of the same
    /// configuration. Nothing is modified unless the whole image is valid.
    pub fn restore_checkpoint_from<R: Read>(&mut self, r: &mut R) -> EngineResult<()> {
        let parts = CheckpointParts::read_from(r)?;

        let (step, dt) = parts.step.ok_or_else(|| missing(TAG_STEP))?;
        if dt.to_bits() != self.integrator.dt().to_bits() {
            return Err(EngineError::CorruptState(format!(
                "checkpoint dt {dt} differs from configured dt {}",
                self.integrator.dt()
            )));
        }

        let shape = parts.shape.ok_or_else(|| missing(TAG_SHAPE))?;
        if shape != self.checkpoint_shape() {
            return Err(EngineError::CorruptState(format!(
                "checkpoint shape {shape:?} differs from {:?}",
                self.checkpoint_shape()
            )));
        }

        let state = parts.state.ok_or_else(|| missing(TAG_STATE))?;
        let state = State::from_shape_vec(self.state.raw_dim(), state)
            .map_err(|e| EngineError::CorruptState(format!("state: {e}")))?;

        let history = parts.history.ok_or_else(|| missing(TAG_HISTORY))?;
        if history.len() != self.history.len_values() {
            return Err(EngineError::CorruptState(format!(
                "history holds {} values, expected {}",
                history.len(),
                self.history.len_values()
            )));
        }

        let (stream, eta) = match self.integrator.noise() {
            None => {
                if parts.stream.is_some() || parts.eta.is_some() {
                    return Err(EngineError::CorruptState(
                        "checkpoint carries noise state for a deterministic scheme".into(),
                    ));
                }
                (None, None)
            }
            Some(noise) => {
                let stream = parts.stream.ok_or_else(|| missing(TAG_STREAM))?;
                if Prng::from_state(stream).is_none() {
                    return Err(EngineError::CorruptState(format!(
                        "invalid random stream state {stream:?}"
                    )));
                }
                let eta = match (noise.generator().eta(), parts.eta) {
                    (None, None) => None,
                    (Some(current), Some(saved)) => Some(
                        State::from_shape_vec(current.raw_dim(), saved)
                            .map_err(|e| EngineError::CorruptState(format!("eta: {e}")))?,
                    ),
                    (Some(_), None) => return Err(missing(TAG_ETA)),
                    (None, Some(_)) => {
                        return Err(EngineError::CorruptState(
                            "checkpoint carries coloured-noise state for white noise".into(),
                        ))
                    }
                };
                (Some(stream), eta)
            }
        };

        // Validated; apply.
        if let Some(noise) = self.integrator.noise_mut() {
            let generator = noise.generator_mut();
            if let Some(stream) = stream {
                generator.stream_mut().set_state(stream)?;
            }
            if let Some(eta) = eta {
                generator.set_eta(eta)?;
            }
        }
        self.history.restore(&history, step)?;
        self.state = state;
        self.step = step;
        for m in self.monitors.iter_mut() {
            m.reset();
        }
        self.integrator.resume()?;
        info!(step, "checkpoint restored");
        Ok(())
    }

    fn checkpoint_shape(&self) -> [u64; 5] {
        let (nvar, nnode, nmode) = self.state.dim();
        [
            nvar as u64,
            nnode as u64,
            nmode as u64,
            self.history.horizon() as u64,
            self.history.coupling_variables().len() as u64,
        ]
    }
}

fn missing(tag: [u8; 4]) -> EngineError {
    EngineError::CorruptState(format!(
        "checkpoint lacks chunk {}",
        String::from_utf8_lossy(&tag)
    ))
}

// Truncated or undecodable input is corruption; anything else is I/O.
fn checkpoint_io(e: io::Error) -> EngineError {
    match e.kind() {
        io::ErrorKind::UnexpectedEof | io::ErrorKind::InvalidData => {
            EngineError::CorruptState(e.to_string())
        }
        _ => EngineError::Io(e),
    }
}

#[derive(Debug, Default)]
struct CheckpointParts {
    step: Option<(Step, f64)>,
    shape: Option<[u64; 5]>,
    state: Option<Vec<f64>>,
    history: Option<Vec<f64>>,
    stream: Option<StreamState>,
    eta: Option<Vec<f64>>,
}

impl CheckpointParts {
    fn read_from<R: Read>(r: &mut R) -> EngineResult<Self> {
        let magic = storage::read_exact::<8, _>(r).map_err(checkpoint_io)?;
        if &magic != storage::MAGIC {
            return Err(EngineError::CorruptState("bad checkpoint magic".into()));
        }
        let version = storage::read_u32_le(r).map_err(checkpoint_io)?;
        if version != storage::VERSION_CURRENT {
            return Err(EngineError::CorruptState(format!(
                "unsupported checkpoint version {version}"
            )));
        }

        let mut parts = Self::default();
        loop {
            let (tag, len) = match storage::read_chunk_header(r) {
                Ok(h) => h,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            };
            let payload = storage::read_chunk_payload_lz4(r, len).map_err(checkpoint_io)?;
            parts.absorb(tag, &payload).map_err(checkpoint_io)?;
        }
        Ok(parts)
    }

    fn absorb(&mut self, tag: [u8; 4], payload: &[u8]) -> io::Result<()> {
        let mut p = payload;
        let max_len = payload.len() / 8;
        match tag {
            TAG_STEP => {
                let step = storage::read_u64_le(&mut p)?;
                let dt = storage::read_f64_le(&mut p)?;
                self.step = Some((step, dt));
            }
            TAG_SHAPE => {
                let mut shape = [0u64; 5];
                for dim in shape.iter_mut() {
                    *dim = storage::read_u64_le(&mut p)?;
                }
                self.shape = Some(shape);
            }
            TAG_STATE => self.state = Some(storage::read_f64_seq(&mut p, max_len)?),
            TAG_HISTORY => self.history = Some(storage::read_f64_seq(&mut p, max_len)?),
            TAG_STREAM => {
                let word = storage::read_u64_le(&mut p)?;
                let spare = match storage::read_u8(&mut p)? {
                    0 => None,
                    1 => Some(storage::read_f64_le(&mut p)?),
                    other => {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("bad spare flag {other}"),
                        ))
                    }
                };
                self.stream = Some(StreamState { word, spare });
            }
            TAG_ETA => self.eta = Some(storage::read_f64_seq(&mut p, max_len)?),
            other => {
                debug!(tag = %String::from_utf8_lossy(&other), "skipping unknown checkpoint chunk");
            }
        }
        Ok(())
    }
}

/// Lazy run over a fixed number of steps.
///
/// Yields only steps where some monitor emitted. After the last step the
/// integrator is marked done; an error ends the run.
pub struct Run<'a> {
    sim: &'a mut Simulator,
    remaining: u64,
    started: bool,
    done: bool,
}

impl<'a> Run<'a> {
    fn new(sim: &'a mut Simulator, steps: u64) -> Self {
        Self {
            sim,
            remaining: steps,
            started: false,
            done: false,
        }
    }

    /// Steps not yet taken.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }
}

impl Iterator for Run<'_> {
    type Item = EngineResult<StepOutput>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if !self.started {
            self.started = true;
            if let Err(e) = self.sim.integrator.resume() {
                self.done = true;
                return Some(Err(e));
            }
        }
        while self.remaining > 0 {
            self.remaining -= 1;
            match self.sim.step() {
                Ok(out) if out.any_emitted() => return Some(Ok(out)),
                Ok(_) => {}
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
        self.done = true;
        self.sim.integrator.finish();
        debug!(
            step = self.sim.step,
            time = self.sim.current_time(),
            "run finished"
        );
        None
    }
}

impl FusedIterator for Run<'_> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectivity;
    use crate::integrator::{IntegratorPhase, Scheme};
    use crate::model::testing::{BrokenModel, SumModel};
    use crate::models::Generic2dOscillator;
    use crate::monitors::{SubSample, TemporalAverage};
    use crate::noise::NoiseDispersion;
    use crate::stimulus::{PulseTrain, RegionStimulus};
    use ndarray::Array2;

    // Node i is driven by node i + 1 with delay 4i + j steps.
    fn chain(n: usize) -> Connectivity {
        let weights = Array2::from_shape_fn((n, n), |(i, j)| if j == i + 1 { 1.0 } else { 0.0 });
        let delays = Array2::from_shape_fn((n, n), |(i, j)| n * i + j);
        Connectivity::new(weights, delays).unwrap()
    }

    fn chain_simulator() -> Simulator {
        Simulator::builder(Box::new(SumModel::single()), chain(4))
            .config(SimulatorConfig::default().with_simulation_length(10.0))
            .coupling(CouplingKind::Linear { a: 1.0, b: 0.0 })
            .integrator(IntegratorConfig::new(Scheme::Identity, 1.0))
            .monitor(Box::new(Raw::new()))
            .initial_conditions(State::ones((1, 4, 1)))
            .build()
            .unwrap()
    }

    fn oscillators(seed: u64) -> Simulator {
        let dt = 0.05;
        let (weights, tracts) = connectivity::chain_undirected(5, 12.0);
        let conn = Connectivity::from_tract_lengths(weights, &tracts, 4.0, dt).unwrap();
        let noise = NoiseConfig::default()
            .with_ntau(0.5)
            .with_nsig(NoiseDispersion::Uniform(0.01))
            .with_seed(seed)
            .build()
            .unwrap();
        Simulator::builder(Box::new(Generic2dOscillator::default()), conn)
            .config(
                SimulatorConfig::default()
                    .with_simulation_length(5.0)
                    .with_initial_seed(seed),
            )
            .coupling(CouplingKind::linear())
            .integrator(IntegratorConfig::new(Scheme::Heun, dt).with_stochastic(true))
            .noise(noise)
            .monitor(Box::new(Raw::new()))
            .build()
            .unwrap()
    }

    fn raw_states(run: impl Iterator<Item = EngineResult<StepOutput>>) -> Vec<State> {
        run.map(|out| out.unwrap().samples[0].clone().unwrap().data)
            .collect()
    }

    fn same_bits(a: &[State], b: &[State]) -> bool {
        a.len() == b.len()
            && a.iter().zip(b).all(|(x, y)| {
                x.iter().zip(y.iter()).all(|(p, q)| p.to_bits() == q.to_bits())
            })
    }

    #[test]
    fn delayed_chain_reproduces_reference_values() {
        let expected = [
            [2.0, 2.0, 2.0, 1.0],
            [3.0, 3.0, 3.0, 1.0],
            [5.0, 4.0, 4.0, 1.0],
            [8.0, 5.0, 5.0, 1.0],
            [12.0, 6.0, 6.0, 1.0],
            [17.0, 7.0, 7.0, 1.0],
            [23.0, 8.0, 8.0, 1.0],
            [30.0, 10.0, 9.0, 1.0],
            [38.0, 13.0, 10.0, 1.0],
            [48.0, 17.0, 11.0, 1.0],
        ];
        let mut sim = chain_simulator();
        assert_eq!(sim.history().horizon(), 16);

        let outputs: Vec<StepOutput> = sim.run().map(Result::unwrap).collect();
        assert_eq!(outputs.len(), expected.len());
        for (k, (out, row)) in outputs.iter().zip(expected.iter()).enumerate() {
            assert_eq!(out.step, k as u64 + 1);
            assert_eq!(out.time, (k + 1) as f64);
            let data = &out.samples[0].as_ref().unwrap().data;
            let got: Vec<f64> = data.iter().copied().collect();
            assert_eq!(got, row.to_vec(), "step {}", k + 1);
        }
        assert_eq!(sim.current_step(), 10);
        assert_eq!(sim.current_time(), 10.0);
    }

    #[test]
    fn exhausted_run_finishes_and_next_run_resumes() {
        let mut sim = chain_simulator();
        let first = sim.run_for(3.0).unwrap().count();
        assert_eq!(first, 3);
        assert_eq!(sim.integrator().phase(), IntegratorPhase::Done);
        assert!(matches!(sim.step(), Err(EngineError::Finished)));

        let resumed: Vec<StepOutput> = sim.run_for(2.0).unwrap().map(Result::unwrap).collect();
        assert_eq!(resumed[0].step, 4);
        let got: Vec<f64> = resumed[1].samples[0].as_ref().unwrap().data.iter().copied().collect();
        assert_eq!(got, vec![12.0, 6.0, 6.0, 1.0]);
    }

    #[test]
    fn run_yields_only_on_emission() {
        let mut sim = Simulator::builder(Box::new(SumModel::single()), chain(4))
            .coupling(CouplingKind::Linear { a: 1.0, b: 0.0 })
            .integrator(IntegratorConfig::new(Scheme::Identity, 1.0))
            .monitor(Box::new(SubSample::new(4.0)))
            .monitor(Box::new(TemporalAverage::new(5.0)))
            .initial_conditions(State::ones((1, 4, 1)))
            .build()
            .unwrap();

        let outputs: Vec<StepOutput> = sim.run_for(20.0).unwrap().map(Result::unwrap).collect();
        let steps: Vec<u64> = outputs.iter().map(|o| o.step).collect();
        assert_eq!(steps, vec![4, 5, 8, 10, 12, 15, 16, 20]);
        let both = outputs.iter().find(|o| o.step == 20).unwrap();
        assert!(both.samples.iter().all(Option::is_some));
        let only_sub = outputs.iter().find(|o| o.step == 8).unwrap();
        assert!(only_sub.samples[0].is_some() && only_sub.samples[1].is_none());
        assert_eq!(sim.current_step(), 20);
    }

    #[test]
    fn stochastic_runs_repeat_for_equal_seeds() {
        let a = raw_states(oscillators(7).run());
        let b = raw_states(oscillators(7).run());
        let c = raw_states(oscillators(8).run());
        assert_eq!(a.len(), 100);
        assert!(same_bits(&a, &b));
        assert!(!same_bits(&a, &c));
    }

    #[test]
    fn reset_replays_the_trajectory() {
        let mut sim = oscillators(3);
        let first = raw_states(sim.run());
        sim.reset().unwrap();
        assert_eq!(sim.current_step(), 0);
        let second = raw_states(sim.run());
        assert!(same_bits(&first, &second));
    }

    #[test]
    fn checkpoint_resume_is_bit_exact() {
        let mut reference = oscillators(11);
        let head = raw_states(reference.run_for(2.0).unwrap());
        let mut image = Vec::new();
        reference.save_checkpoint_to(&mut image).unwrap();
        assert_eq!(reference.checkpoint_size_bytes().unwrap(), image.len());
        let tail = raw_states(reference.run_for(3.0).unwrap());

        let mut resumed = oscillators(11);
        resumed
            .restore_checkpoint_from(&mut image.as_slice())
            .unwrap();
        assert_eq!(resumed.current_step(), head.len() as u64);
        let replay = raw_states(resumed.run_for(3.0).unwrap());
        assert!(same_bits(&tail, &replay));
    }

    #[test]
    fn corrupt_checkpoints_leave_the_simulator_untouched() {
        let mut source = oscillators(2);
        source.run_for(1.0).unwrap().for_each(drop);
        let mut image = Vec::new();
        source.save_checkpoint_to(&mut image).unwrap();

        let mut target = oscillators(2);
        let before = target.state().clone();

        let mut bad_magic = image.clone();
        bad_magic[0] ^= 0xff;
        assert!(matches!(
            target.restore_checkpoint_from(&mut bad_magic.as_slice()),
            Err(EngineError::CorruptState(_))
        ));

        let mut future = image.clone();
        future[8..12].copy_from_slice(&(storage::VERSION_CURRENT + 1).to_le_bytes());
        assert!(matches!(
            target.restore_checkpoint_from(&mut future.as_slice()),
            Err(EngineError::CorruptState(_))
        ));

        let truncated = &image[..image.len() - 3];
        assert!(matches!(
            target.restore_checkpoint_from(&mut &truncated[..]),
            Err(EngineError::CorruptState(_))
        ));

        // Header only: every chunk missing.
        assert!(matches!(
            target.restore_checkpoint_from(&mut &image[..12]),
            Err(EngineError::CorruptState(_))
        ));

        let mut deterministic = chain_simulator();
        assert!(matches!(
            deterministic.restore_checkpoint_from(&mut image.as_slice()),
            Err(EngineError::CorruptState(_))
        ));

        assert_eq!(target.current_step(), 0);
        assert_eq!(target.state(), &before);
    }

    #[test]
    fn wrong_dfun_shape_stops_the_run() {
        let mut sim = Simulator::builder(Box::new(BrokenModel), chain(3))
            .integrator(IntegratorConfig::new(Scheme::Euler, 0.1))
            .build()
            .unwrap();
        let mut run = sim.run_for(1.0).unwrap();
        assert!(matches!(
            run.next(),
            Some(Err(EngineError::ShapeMismatch { .. }))
        ));
        assert!(run.next().is_none());
    }

    #[test]
    fn build_rejects_inconsistent_inputs() {
        let bad_initial = Simulator::builder(Box::new(SumModel::single()), chain(4))
            .initial_conditions(State::ones((1, 3, 1)))
            .build();
        assert!(matches!(bad_initial, Err(EngineError::ShapeMismatch { .. })));

        let short_history = Simulator::builder(Box::new(SumModel::single()), chain(4))
            .history_horizon(8)
            .build();
        assert!(matches!(
            short_history,
            Err(EngineError::DelayExceedsHorizon { .. })
        ));

        let needs_two = Simulator::builder(Box::new(SumModel::single()), chain(4))
            .coupling(CouplingKind::sigmoidal_jansen_rit())
            .build();
        assert!(matches!(needs_two, Err(EngineError::InvalidParameter { .. })));

        let bad_local = Simulator::builder(Box::new(SumModel::single()), chain(4))
            .local_coupling(LocalCoupling::PerNode(vec![0.0; 2]))
            .build();
        assert!(matches!(bad_local, Err(EngineError::ShapeMismatch { .. })));

        let short_stimulus = Simulator::builder(Box::new(SumModel::single()), chain(4))
            .stimulus(Box::new(RegionStimulus::new(
                Box::new(PulseTrain::default()),
                vec![1.0; 2],
            )))
            .build();
        assert!(matches!(
            short_stimulus,
            Err(EngineError::ShapeMismatch { .. })
        ));

        let stimulus_variable = Simulator::builder(Box::new(SumModel::single()), chain(4))
            .stimulus(Box::new(
                RegionStimulus::new(Box::new(PulseTrain::default()), vec![1.0; 4])
                    .with_variables(vec![3]),
            ))
            .build();
        assert!(matches!(
            stimulus_variable,
            Err(EngineError::InvalidParameter { .. })
        ));

        let bad_length = Simulator::builder(Box::new(SumModel::single()), chain(4))
            .config(SimulatorConfig::default().with_simulation_length(0.0))
            .build();
        assert!(bad_length.is_err());
    }

    #[test]
    fn stimulus_drives_selected_nodes() {
        let stim = |_t: f64, out: &mut State| out[[0, 2, 0]] = 4.0;
        let mut sim = Simulator::builder(
            Box::new(SumModel::single()),
            Connectivity::without_delays(Array2::zeros((3, 3))).unwrap(),
        )
        .coupling(CouplingKind::Linear { a: 0.0, b: 0.0 })
        .integrator(IntegratorConfig::new(Scheme::Euler, 0.5))
        .stimulus(Box::new(stim))
        .initial_conditions(State::zeros((1, 3, 1)))
        .build()
        .unwrap();
        let out = sim.step().unwrap();
        assert_eq!(out.samples.len(), 1);
        assert_eq!(sim.state()[[0, 2, 0]], 2.0);
        assert_eq!(sim.state()[[0, 0, 0]], 0.0);
    }

    #[test]
    fn random_initial_conditions_follow_the_seed() {
        let build = |seed| {
            Simulator::builder(Box::new(Generic2dOscillator::default()), chain(3))
                .config(SimulatorConfig::default().with_initial_seed(seed))
                .build()
                .unwrap()
        };
        let a = build(1);
        assert_eq!(a.state(), build(1).state());
        assert_ne!(a.state(), build(2).state());
        assert!(a
            .state()
            .index_axis(ndarray::Axis(0), 0)
            .iter()
            .all(|v| (-2.0..=4.0).contains(v)));
    }

    #[test]
    fn step_counts_round_to_nearest_when_exact() {
        assert_eq!(steps_for(10.0, 1.0), 10);
        assert_eq!(steps_for(1.0, 0.1), 10);
        assert_eq!(steps_for(1.05, 0.1), 11);
        assert_eq!(steps_for(1000.0, 0.01220703125), 81920);
    }
}
