//! Random perturbations for the stochastic schemes.
//!
//! [`NoiseGenerator`] produces white (`ntau == 0`) or Ornstein-Uhlenbeck
//! coloured increments from a seeded [`RandomStream`]; [`Noise`] scales them
//! by the diffusion coefficient `sqrt(2 nsig) [* b(x)]`.

use ndarray::{Array3, Axis};
use tracing::info;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::kernels::{self, ExecutionTier};
use crate::prng::{Prng, PrngState};

pub const DEFAULT_SEED: u64 = 42;

pub type Shape = (usize, usize, usize);

/// Saved position of a [`RandomStream`].
pub type StreamState = PrngState;

/// Seedable normal variate source that can be rewound to its seed.
#[derive(Debug, Clone, PartialEq)]
pub struct RandomStream {
    init_seed: u64,
    rng: Prng,
}

impl Default for RandomStream {
    fn default() -> Self {
        Self::new(DEFAULT_SEED)
    }
}

impl RandomStream {
    pub fn new(init_seed: u64) -> Self {
        Self {
            init_seed,
            rng: Prng::new(init_seed),
        }
    }

    pub fn init_seed(&self) -> u64 {
        self.init_seed
    }

    /// Rewind to the initial seed.
    pub fn reset(&mut self) {
        self.rng = Prng::new(self.init_seed);
    }

    pub fn state(&self) -> StreamState {
        self.rng.state()
    }

    pub fn set_state(&mut self, state: StreamState) -> EngineResult<()> {
        self.rng = Prng::from_state(state).ok_or_else(|| {
            EngineError::CorruptState(format!("invalid random stream state {state:?}"))
        })?;
        Ok(())
    }

    #[inline]
    pub fn standard_normal(&mut self) -> f64 {
        self.rng.standard_normal()
    }

    pub fn normal(&mut self, shape: Shape) -> Array3<f64> {
        let mut out = Array3::zeros(shape);
        self.fill_normal(&mut out);
        out
    }

    pub fn fill_normal(&mut self, out: &mut Array3<f64>) {
        for x in out.iter_mut() {
            *x = self.rng.standard_normal();
        }
    }

    pub(crate) fn prng_mut(&mut self) -> &mut Prng {
        &mut self.rng
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Colored {
    e: f64,
    sqrt_1_e2: f64,
    dt_sqrt_lambda: f64,
    eta: Array3<f64>,
}

/// White or coloured noise source.
#[derive(Debug, Clone, PartialEq)]
pub struct NoiseGenerator {
    ntau: f64,
    stream: RandomStream,
    dt: Option<f64>,
    shape: Shape,
    colored: Option<Colored>,
}

impl NoiseGenerator {
    pub fn new(ntau: f64, seed: u64) -> EngineResult<Self> {
        if !ntau.is_finite() || ntau < 0.0 {
            return Err(EngineError::invalid(
                "ntau",
                format!("correlation time must be finite and >= 0, got {ntau}"),
            ));
        }
        Ok(Self {
            ntau,
            stream: RandomStream::new(seed),
            dt: None,
            shape: (0, 0, 0),
            colored: None,
        })
    }

    pub fn ntau(&self) -> f64 {
        self.ntau
    }

    pub fn is_colored(&self) -> bool {
        self.ntau > 0.0
    }

    pub fn stream(&self) -> &RandomStream {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut RandomStream {
        &mut self.stream
    }

    /// Derive the per-step constants; coloured noise also draws its initial
    /// `eta` here.
    pub fn configure(&mut self, dt: f64, shape: Shape) -> EngineResult<()> {
        if !dt.is_finite() || dt <= 0.0 {
            return Err(EngineError::InvalidTimeStep(dt));
        }
        self.dt = Some(dt);
        self.shape = shape;
        self.colored = if self.is_colored() {
            let e = (-dt / self.ntau).exp();
            let colored = Colored {
                e,
                sqrt_1_e2: (1.0 - e * e).sqrt(),
                dt_sqrt_lambda: dt * (1.0 / self.ntau).sqrt(),
                eta: self.stream.normal(shape),
            };
            info!(
                dt,
                ntau = self.ntau,
                e = colored.e,
                sqrt_1_e2 = colored.sqrt_1_e2,
                "coloured noise configured"
            );
            Some(colored)
        } else {
            info!(dt, "white noise configured");
            None
        };
        Ok(())
    }

    /// Rewind the stream and, for coloured noise, redraw `eta`.
    pub fn reset(&mut self) -> EngineResult<()> {
        self.stream.reset();
        match self.dt {
            Some(dt) => self.configure(dt, self.shape),
            None => Ok(()),
        }
    }

    pub fn generate(&mut self, shape: Shape) -> EngineResult<Array3<f64>> {
        let mut out = Array3::zeros(shape);
        self.generate_into(&mut out)?;
        Ok(out)
    }

    pub fn generate_into(&mut self, out: &mut Array3<f64>) -> EngineResult<()> {
        let dt = self.dt.ok_or(EngineError::NotConfigured("noise generator"))?;
        match self.colored.as_mut() {
            None => {
                let sqrt_dt = dt.sqrt();
                for x in out.iter_mut() {
                    *x = sqrt_dt * self.stream.standard_normal();
                }
            }
            Some(c) => {
                if out.dim() != c.eta.dim() {
                    return Err(EngineError::shape("coloured noise", c.eta.shape(), out.shape()));
                }
                for (x, eta) in out.iter_mut().zip(c.eta.iter_mut()) {
                    let h = c.sqrt_1_e2 * self.stream.standard_normal();
                    *eta = *eta * c.e + h;
                    *x = c.dt_sqrt_lambda * *eta;
                }
            }
        }
        Ok(())
    }

    /// Persistent coloured-noise state, if any.
    pub fn eta(&self) -> Option<&Array3<f64>> {
        self.colored.as_ref().map(|c| &c.eta)
    }

    pub(crate) fn set_eta(&mut self, eta: Array3<f64>) -> EngineResult<()> {
        let c = self
            .colored
            .as_mut()
            .ok_or(EngineError::NotConfigured("coloured noise"))?;
        if eta.dim() != c.eta.dim() {
            return Err(EngineError::CorruptState(format!(
                "eta shape {:?} does not match {:?}",
                eta.shape(),
                c.eta.shape()
            )));
        }
        c.eta = eta;
        Ok(())
    }
}

/// Noise intensity `nsig`.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum NoiseDispersion {
    Uniform(f64),
    PerVariable(Vec<f64>),
    PerNode(Vec<f64>),
}

impl Default for NoiseDispersion {
    fn default() -> Self {
        NoiseDispersion::Uniform(1.0)
    }
}

impl NoiseDispersion {
    fn values(&self) -> &[f64] {
        match self {
            NoiseDispersion::Uniform(v) => core::slice::from_ref(v),
            NoiseDispersion::PerVariable(v) | NoiseDispersion::PerNode(v) => v,
        }
    }

    pub fn validate(&self, shape: Shape) -> EngineResult<()> {
        let (nvar, nnode, _) = shape;
        if self
            .values()
            .iter()
            .any(|v| !v.is_finite() || *v < 0.0)
        {
            return Err(EngineError::invalid("nsig", "entries must be finite and >= 0"));
        }
        match self {
            NoiseDispersion::Uniform(_) => Ok(()),
            NoiseDispersion::PerVariable(v) if v.len() == nvar => Ok(()),
            NoiseDispersion::PerNode(v) if v.len() == nnode => Ok(()),
            NoiseDispersion::PerVariable(v) => Err(EngineError::shape("nsig", &[nvar], &[v.len()])),
            NoiseDispersion::PerNode(v) => Err(EngineError::shape("nsig", &[nnode], &[v.len()])),
        }
    }

    #[inline]
    fn at(&self, var: usize, node: usize) -> f64 {
        match self {
            NoiseDispersion::Uniform(v) => *v,
            NoiseDispersion::PerVariable(v) => v[var],
            NoiseDispersion::PerNode(v) => v[node],
        }
    }
}

/// Opaque scalar function: the multiplicative diffusion coefficient `b(x)`,
/// or the time profile of a stimulus.
pub trait ScalarFunction: Send + Sync {
    fn eval(&self, x: f64) -> f64;
}

impl<F> ScalarFunction for F
where
    F: Fn(f64) -> f64 + Send + Sync,
{
    fn eval(&self, x: f64) -> f64 {
        self(x)
    }
}

/// `a * x + b`
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LinearFunction {
    pub a: f64,
    pub b: f64,
}

impl Default for LinearFunction {
    fn default() -> Self {
        Self { a: 1.0, b: 0.0 }
    }
}

impl ScalarFunction for LinearFunction {
    fn eval(&self, x: f64) -> f64 {
        self.a * x + self.b
    }
}

pub enum Diffusion {
    /// `sqrt(2 nsig)`, independent of the state.
    Additive,
    /// `sqrt(2 nsig) * b(x)`
    Multiplicative(Box<dyn ScalarFunction>),
}

impl core::fmt::Debug for Diffusion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Diffusion::Additive => f.write_str("Additive"),
            Diffusion::Multiplicative(_) => f.write_str("Multiplicative(..)"),
        }
    }
}

/// Noise source plus diffusion coefficient, as consumed by the stochastic
/// integrators.
#[derive(Debug)]
pub struct Noise {
    generator: NoiseGenerator,
    nsig: NoiseDispersion,
    diffusion: Diffusion,
}

impl Noise {
    pub fn additive(generator: NoiseGenerator, nsig: NoiseDispersion) -> Self {
        Self {
            generator,
            nsig,
            diffusion: Diffusion::Additive,
        }
    }

    pub fn multiplicative(
        generator: NoiseGenerator,
        nsig: NoiseDispersion,
        b: Box<dyn ScalarFunction>,
    ) -> Self {
        Self {
            generator,
            nsig,
            diffusion: Diffusion::Multiplicative(b),
        }
    }

    pub fn generator(&self) -> &NoiseGenerator {
        &self.generator
    }

    pub fn generator_mut(&mut self) -> &mut NoiseGenerator {
        &mut self.generator
    }

    pub fn nsig(&self) -> &NoiseDispersion {
        &self.nsig
    }

    pub fn configure(&mut self, dt: f64, shape: Shape) -> EngineResult<()> {
        self.nsig.validate(shape)?;
        self.generator.configure(dt, shape)
    }

    /// Diffusion coefficient evaluated at `state`.
    pub fn gfun(&self, state: &Array3<f64>) -> Array3<f64> {
        let mut g = Array3::zeros(state.raw_dim());
        for (v, mut plane) in g.axis_iter_mut(Axis(0)).enumerate() {
            for ((n, _), x) in plane.indexed_iter_mut() {
                *x = (2.0 * self.nsig.at(v, n)).sqrt();
            }
        }
        if let Diffusion::Multiplicative(b) = &self.diffusion {
            for (g, x) in g.iter_mut().zip(state.iter()) {
                *g *= b.eval(*x);
            }
        }
        g
    }

    /// One scaled noise increment `gfun(state) * dW`.
    pub fn increment(&mut self, state: &Array3<f64>, tier: ExecutionTier) -> EngineResult<Array3<f64>> {
        let mut dw = self.generator.generate(state.dim())?;
        let g = self.gfun(state);
        kernels::mul_assign(tier, &g, &mut dw);
        Ok(dw)
    }
}

/// Serializable noise description.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct NoiseConfig {
    pub ntau: f64,
    pub nsig: NoiseDispersion,
    pub seed: u64,
    pub diffusion: DiffusionConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "kind", rename_all = "snake_case"))]
pub enum DiffusionConfig {
    #[default]
    Additive,
    Multiplicative { a: f64, b: f64 },
}

impl Default for NoiseConfig {
    fn default() -> Self {
        Self {
            ntau: 0.0,
            nsig: NoiseDispersion::default(),
            seed: DEFAULT_SEED,
            diffusion: DiffusionConfig::Additive,
        }
    }
}

impl NoiseConfig {
    pub fn with_ntau(mut self, ntau: f64) -> Self {
        self.ntau = ntau;
        self
    }

    pub fn with_nsig(mut self, nsig: NoiseDispersion) -> Self {
        self.nsig = nsig;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn build(&self) -> EngineResult<Noise> {
        let generator = NoiseGenerator::new(self.ntau, self.seed)?;
        Ok(match self.diffusion {
            DiffusionConfig::Additive => Noise::additive(generator, self.nsig.clone()),
            DiffusionConfig::Multiplicative { a, b } => Noise::multiplicative(
                generator,
                self.nsig.clone(),
                Box::new(LinearFunction { a, b }),
            ),
        })
    }
}
