//! Numerical schemes advancing the node state by one step.
//!
//! Stage couplings: every scheme evaluates its first stage with the coupling
//! seen at the current step. Heun's corrector and the last RK4 stage use the
//! coupling of the next step, read from the history with every delay clamped
//! to the newest written state. The two RK4 midpoint stages reuse the current
//! coupling since no history exists between steps.

use core::str::FromStr;

use ndarray::Array3;
use tracing::{info, warn};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::kernels::{self, ExecutionTier};
use crate::model::{checked_dfun, CouplingInput, LocalCoupling, Model, State};
use crate::noise::{Noise, Shape};

/// Default integration step (ms).
pub const DEFAULT_DT: f64 = 0.01220703125;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Scheme {
    Identity,
    Euler,
    #[default]
    Heun,
    Rk4,
}

impl Scheme {
    pub fn name(self) -> &'static str {
        match self {
            Scheme::Identity => "identity",
            Scheme::Euler => "euler",
            Scheme::Heun => "heun",
            Scheme::Rk4 => "rk4",
        }
    }

    /// Whether a stage needs the coupling of the following step.
    pub fn needs_next_coupling(self) -> bool {
        matches!(self, Scheme::Heun | Scheme::Rk4)
    }

    pub fn supports_noise(self) -> bool {
        matches!(self, Scheme::Euler | Scheme::Heun)
    }
}

impl FromStr for Scheme {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_lowercase())
            .collect();
        match key.as_str() {
            "identity" => Ok(Scheme::Identity),
            "euler" | "eulerdeterministic" | "eulerstochastic" => Ok(Scheme::Euler),
            "heun" | "heundeterministic" | "heunstochastic" => Ok(Scheme::Heun),
            "rk4" | "rungekutta" | "rungekutta4thorderdeterministic" => Ok(Scheme::Rk4),
            _ => Err(EngineError::InvalidScheme(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct IntegratorConfig {
    pub scheme: Scheme,
    pub dt: f64,
    pub stochastic: bool,
}

impl Default for IntegratorConfig {
    fn default() -> Self {
        Self {
            scheme: Scheme::Heun,
            dt: DEFAULT_DT,
            stochastic: false,
        }
    }
}

impl IntegratorConfig {
    pub fn new(scheme: Scheme, dt: f64) -> Self {
        Self {
            scheme,
            dt,
            stochastic: false,
        }
    }

    pub fn with_stochastic(mut self, stochastic: bool) -> Self {
        self.stochastic = stochastic;
        self
    }

    pub fn validate(&self) -> EngineResult<()> {
        if !self.dt.is_finite() || self.dt <= 0.0 {
            return Err(EngineError::InvalidTimeStep(self.dt));
        }
        if self.stochastic && !self.scheme.supports_noise() {
            return Err(EngineError::InvalidScheme(format!(
                "{} has no stochastic variant",
                self.scheme.name()
            )));
        }
        Ok(())
    }

    /// Instantiate the scheme. Stochastic schemes take ownership of `noise`.
    pub fn build(&self, noise: Option<Noise>) -> EngineResult<Box<dyn Integrator>> {
        self.validate()?;
        let core = IntegratorCore::new(self.dt);
        if !self.stochastic && noise.is_some() {
            warn!(
                scheme = self.scheme.name(),
                "noise supplied to a deterministic scheme is ignored"
            );
        }
        let integrator: Box<dyn Integrator> = match (self.scheme, self.stochastic, noise) {
            (Scheme::Identity, _, _) => Box::new(Identity { core }),
            (Scheme::Euler, false, _) => Box::new(EulerDeterministic { core }),
            (Scheme::Heun, false, _) => Box::new(HeunDeterministic { core }),
            (Scheme::Rk4, _, _) => Box::new(RungeKutta4thOrderDeterministic { core }),
            (Scheme::Euler, true, Some(noise)) => Box::new(EulerStochastic { core, noise }),
            (Scheme::Heun, true, Some(noise)) => Box::new(HeunStochastic { core, noise }),
            (scheme, true, None) => {
                return Err(EngineError::InvalidScheme(format!(
                    "stochastic {} requires a noise source",
                    scheme.name()
                )))
            }
        };
        Ok(integrator)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IntegratorPhase {
    #[default]
    Unconfigured,
    Configured,
    Stepping,
    Done,
}

/// Coupling inputs for the stages of one step.
#[derive(Debug, Clone, Copy)]
pub struct StageCoupling<'a> {
    pub current: &'a CouplingInput,
    /// Coupling of the following step; `None` reuses `current`.
    pub next: Option<&'a CouplingInput>,
}

impl<'a> StageCoupling<'a> {
    pub fn constant(c: &'a CouplingInput) -> Self {
        Self {
            current: c,
            next: None,
        }
    }

    fn next_or_current(&self) -> &'a CouplingInput {
        self.next.unwrap_or(self.current)
    }
}

/// Everything a scheme reads besides the state itself.
#[derive(Clone, Copy)]
pub struct StepInputs<'a> {
    pub model: &'a dyn Model,
    pub coupling: StageCoupling<'a>,
    pub local: &'a LocalCoupling,
    /// State-shaped external drive, added as `dt * stimulus`.
    pub stimulus: Option<&'a Array3<f64>>,
}

/// Step bookkeeping shared by every scheme.
#[derive(Debug, Clone)]
pub struct IntegratorCore {
    dt: f64,
    shape: Shape,
    phase: IntegratorPhase,
    tier: ExecutionTier,
}

impl IntegratorCore {
    fn new(dt: f64) -> Self {
        Self {
            dt,
            shape: (0, 0, 0),
            phase: IntegratorPhase::Unconfigured,
            tier: ExecutionTier::Scalar,
        }
    }

    fn begin(&mut self, x: &State, inputs: &StepInputs<'_>) -> EngineResult<()> {
        match self.phase {
            IntegratorPhase::Unconfigured => return Err(EngineError::NotConfigured("integrator")),
            IntegratorPhase::Done => return Err(EngineError::Finished),
            IntegratorPhase::Configured | IntegratorPhase::Stepping => {}
        }
        let (nvar, nnode, nmode) = self.shape;
        if x.dim() != self.shape {
            return Err(EngineError::shape("integrator state", &[nvar, nnode, nmode], x.shape()));
        }
        if let Some(stim) = inputs.stimulus {
            if stim.dim() != self.shape {
                return Err(EngineError::shape("stimulus", &[nvar, nnode, nmode], stim.shape()));
            }
        }
        self.phase = IntegratorPhase::Stepping;
        Ok(())
    }

    #[inline]
    fn dfun(&self, inputs: &StepInputs<'_>, x: &State, c: &CouplingInput) -> EngineResult<State> {
        checked_dfun(inputs.model, x, c, inputs.local)
    }

    /// `x + a * f`
    fn advanced(&self, x: &State, a: f64, f: &State) -> State {
        let mut out = x.clone();
        kernels::axpy(self.tier, a, f, &mut out);
        out
    }

    fn add_stimulus(&self, inputs: &StepInputs<'_>, x: &mut State) {
        if let Some(stim) = inputs.stimulus {
            kernels::axpy(self.tier, self.dt, stim, x);
        }
    }
}

/// Common interface of the integration schemes.
pub trait Integrator {
    fn scheme(&self) -> Scheme;

    fn core(&self) -> &IntegratorCore;

    fn core_mut(&mut self) -> &mut IntegratorCore;

    /// Advance `x` by one step.
    fn scheme_step(&mut self, x: &State, inputs: &StepInputs<'_>) -> EngineResult<State>;

    fn is_stochastic(&self) -> bool {
        false
    }

    fn noise(&self) -> Option<&Noise> {
        None
    }

    fn noise_mut(&mut self) -> Option<&mut Noise> {
        None
    }

    fn dt(&self) -> f64 {
        self.core().dt
    }

    fn phase(&self) -> IntegratorPhase {
        self.core().phase
    }

    fn set_execution_tier(&mut self, tier: ExecutionTier) {
        self.core_mut().tier = tier;
    }

    /// Fix the time step and state shape; stochastic schemes also configure
    /// their noise source.
    fn configure(&mut self, dt: f64, shape: Shape) -> EngineResult<()> {
        if !dt.is_finite() || dt <= 0.0 {
            return Err(EngineError::InvalidTimeStep(dt));
        }
        if let Some(noise) = self.noise_mut() {
            noise.configure(dt, shape)?;
        }
        let scheme = self.scheme().name();
        let stochastic = self.is_stochastic();
        let core = self.core_mut();
        core.dt = dt;
        core.shape = shape;
        core.phase = IntegratorPhase::Configured;
        info!(scheme, dt, stochastic, ?shape, "integrator configured");
        Ok(())
    }

    /// Mark the current run as exhausted.
    fn finish(&mut self) {
        if self.core().phase != IntegratorPhase::Unconfigured {
            self.core_mut().phase = IntegratorPhase::Done;
        }
    }

    /// Continue stepping after [`finish`](Integrator::finish).
    fn resume(&mut self) -> EngineResult<()> {
        match self.core().phase {
            IntegratorPhase::Unconfigured => Err(EngineError::NotConfigured("integrator")),
            IntegratorPhase::Done => {
                self.core_mut().phase = IntegratorPhase::Stepping;
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// `x_{t+1} = dfun(x_t, c_t) + dt * stimulus`
#[derive(Debug)]
pub struct Identity {
    core: IntegratorCore,
}

impl Integrator for Identity {
    fn scheme(&self) -> Scheme {
        Scheme::Identity
    }

    fn core(&self) -> &IntegratorCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut IntegratorCore {
        &mut self.core
    }

    fn scheme_step(&mut self, x: &State, inputs: &StepInputs<'_>) -> EngineResult<State> {
        self.core.begin(x, inputs)?;
        let mut next = self.core.dfun(inputs, x, inputs.coupling.current)?;
        self.core.add_stimulus(inputs, &mut next);
        Ok(next)
    }
}

#[derive(Debug)]
pub struct EulerDeterministic {
    core: IntegratorCore,
}

impl Integrator for EulerDeterministic {
    fn scheme(&self) -> Scheme {
        Scheme::Euler
    }

    fn core(&self) -> &IntegratorCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut IntegratorCore {
        &mut self.core
    }

    fn scheme_step(&mut self, x: &State, inputs: &StepInputs<'_>) -> EngineResult<State> {
        self.core.begin(x, inputs)?;
        let f = self.core.dfun(inputs, x, inputs.coupling.current)?;
        let mut next = self.core.advanced(x, self.core.dt, &f);
        self.core.add_stimulus(inputs, &mut next);
        Ok(next)
    }
}

/// Euler-Maruyama.
#[derive(Debug)]
pub struct EulerStochastic {
    core: IntegratorCore,
    noise: Noise,
}

impl Integrator for EulerStochastic {
    fn scheme(&self) -> Scheme {
        Scheme::Euler
    }

    fn core(&self) -> &IntegratorCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut IntegratorCore {
        &mut self.core
    }

    fn is_stochastic(&self) -> bool {
        true
    }

    fn noise(&self) -> Option<&Noise> {
        Some(&self.noise)
    }

    fn noise_mut(&mut self) -> Option<&mut Noise> {
        Some(&mut self.noise)
    }

    fn scheme_step(&mut self, x: &State, inputs: &StepInputs<'_>) -> EngineResult<State> {
        self.core.begin(x, inputs)?;
        let f = self.core.dfun(inputs, x, inputs.coupling.current)?;
        let dw = self.noise.increment(x, self.core.tier)?;
        let mut next = self.core.advanced(x, self.core.dt, &f);
        kernels::add_assign(self.core.tier, &dw, &mut next);
        self.core.add_stimulus(inputs, &mut next);
        Ok(next)
    }
}

/// Predictor `x* = x + dt f(x, c_t)`, corrector
/// `x + dt/2 (f(x, c_t) + f(x*, c_{t+1}))`.
#[derive(Debug)]
pub struct HeunDeterministic {
    core: IntegratorCore,
}

impl Integrator for HeunDeterministic {
    fn scheme(&self) -> Scheme {
        Scheme::Heun
    }

    fn core(&self) -> &IntegratorCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut IntegratorCore {
        &mut self.core
    }

    fn scheme_step(&mut self, x: &State, inputs: &StepInputs<'_>) -> EngineResult<State> {
        self.core.begin(x, inputs)?;
        heun_step(&self.core, x, inputs, None)
    }
}

/// Stochastic Heun: the same increment enters predictor and corrector.
#[derive(Debug)]
pub struct HeunStochastic {
    core: IntegratorCore,
    noise: Noise,
}

impl Integrator for HeunStochastic {
    fn scheme(&self) -> Scheme {
        Scheme::Heun
    }

    fn core(&self) -> &IntegratorCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut IntegratorCore {
        &mut self.core
    }

    fn is_stochastic(&self) -> bool {
        true
    }

    fn noise(&self) -> Option<&Noise> {
        Some(&self.noise)
    }

    fn noise_mut(&mut self) -> Option<&mut Noise> {
        Some(&mut self.noise)
    }

    fn scheme_step(&mut self, x: &State, inputs: &StepInputs<'_>) -> EngineResult<State> {
        self.core.begin(x, inputs)?;
        let dw = self.noise.increment(x, self.core.tier)?;
        heun_step(&self.core, x, inputs, Some(&dw))
    }
}

fn heun_step(
    core: &IntegratorCore,
    x: &State,
    inputs: &StepInputs<'_>,
    dw: Option<&State>,
) -> EngineResult<State> {
    let dt = core.dt;
    let f0 = core.dfun(inputs, x, inputs.coupling.current)?;

    let mut predictor = core.advanced(x, dt, &f0);
    if let Some(dw) = dw {
        kernels::add_assign(core.tier, dw, &mut predictor);
    }
    core.add_stimulus(inputs, &mut predictor);

    let mut slope = core.dfun(inputs, &predictor, inputs.coupling.next_or_current())?;
    kernels::add_assign(core.tier, &f0, &mut slope);

    let mut next = core.advanced(x, dt / 2.0, &slope);
    if let Some(dw) = dw {
        kernels::add_assign(core.tier, dw, &mut next);
    }
    core.add_stimulus(inputs, &mut next);
    Ok(next)
}

/// Classical four-stage Runge-Kutta.
#[derive(Debug)]
pub struct RungeKutta4thOrderDeterministic {
    core: IntegratorCore,
}

impl Integrator for RungeKutta4thOrderDeterministic {
    fn scheme(&self) -> Scheme {
        Scheme::Rk4
    }

    fn core(&self) -> &IntegratorCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut IntegratorCore {
        &mut self.core
    }

    fn scheme_step(&mut self, x: &State, inputs: &StepInputs<'_>) -> EngineResult<State> {
        self.core.begin(x, inputs)?;
        let core = &self.core;
        let dt = core.dt;
        let half = dt / 2.0;
        let c = inputs.coupling.current;

        let k1 = core.dfun(inputs, x, c)?;
        let k2 = core.dfun(inputs, &core.advanced(x, half, &k1), c)?;
        let k3 = core.dfun(inputs, &core.advanced(x, half, &k2), c)?;
        let k4 = core.dfun(
            inputs,
            &core.advanced(x, dt, &k3),
            inputs.coupling.next_or_current(),
        )?;

        let mut slope = k1;
        kernels::axpy(core.tier, 2.0, &k2, &mut slope);
        kernels::axpy(core.tier, 2.0, &k3, &mut slope);
        kernels::add_assign(core.tier, &k4, &mut slope);

        let mut next = core.advanced(x, dt / 6.0, &slope);
        core.add_stimulus(inputs, &mut next);
        Ok(next)
    }
}
