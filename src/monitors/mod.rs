//! Consumers of the state stream.
//!
//! A monitor sees every `(step, state)` pair and decides on its own cadence
//! whether to emit a [`Sample`]. Periods are converted to whole steps
//! (`istep = round(period / dt)`) at configure time.

use ndarray::{Array3, Axis};
use tracing::{info, warn};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::history::Step;
use crate::model::State;
use crate::noise::Shape;

/// Default sampling period (ms), 1024 Hz.
pub const DEFAULT_PERIOD: f64 = 0.9765625;

/// One emitted observation.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub time: f64,
    /// `(variable of interest, node, mode)`; the node axis has length 1 for
    /// spatial averages.
    pub data: Array3<f64>,
}

pub trait Monitor {
    fn name(&self) -> &'static str;

    fn configure(&mut self, dt: f64, shape: Shape) -> EngineResult<()>;

    /// Offer the state produced at `step`.
    fn record(&mut self, step: Step, state: &State) -> Option<Sample>;

    /// Drop any partially accumulated window.
    fn reset(&mut self);
}

// Period, variable selection and step bookkeeping shared by all monitors.
#[derive(Debug, Clone, PartialEq)]
struct Sampling {
    period: f64,
    variables: Option<Vec<usize>>,
    voi: Vec<usize>,
    dt: f64,
    istep: u64,
}

impl Sampling {
    fn new(period: f64, variables: Option<Vec<usize>>) -> Self {
        Self {
            period,
            variables,
            voi: Vec::new(),
            dt: 0.0,
            istep: 0,
        }
    }

    fn configure(&mut self, name: &'static str, dt: f64, shape: Shape) -> EngineResult<()> {
        if !dt.is_finite() || dt <= 0.0 {
            return Err(EngineError::InvalidTimeStep(dt));
        }
        if !self.period.is_finite() || self.period <= 0.0 {
            return Err(EngineError::invalid(
                "period",
                format!("{name} period must be finite and > 0, got {}", self.period),
            ));
        }
        let ratio = self.period / dt;
        let istep = ratio.round();
        if istep < 1.0 {
            return Err(EngineError::invalid(
                "period",
                format!("{name} period {} is shorter than dt {dt}", self.period),
            ));
        }
        if (ratio - istep).abs() > 1e-6 * ratio {
            warn!(
                monitor = name,
                period = self.period,
                dt,
                effective = istep * dt,
                "monitor period is not an integer multiple of dt"
            );
        }

        let nvar = shape.0;
        self.voi = match &self.variables {
            None => (0..nvar).collect(),
            Some(v) if v.is_empty() => {
                return Err(EngineError::invalid(
                    "variables",
                    format!("{name} needs at least one variable of interest"),
                ))
            }
            Some(v) => {
                if let Some(bad) = v.iter().find(|&&i| i >= nvar) {
                    return Err(EngineError::invalid(
                        "variables",
                        format!("{name}: variable {bad} out of range for {nvar} state variables"),
                    ));
                }
                v.clone()
            }
        };
        self.dt = dt;
        self.istep = istep as u64;
        info!(
            monitor = name,
            istep = self.istep,
            variables = ?self.voi,
            "monitor configured"
        );
        Ok(())
    }

    #[inline]
    fn due(&self, step: Step) -> bool {
        step % self.istep == 0
    }

    fn select(&self, state: &State) -> Array3<f64> {
        state.select(Axis(0), &self.voi)
    }
}

/// Every state, unmodified.
#[derive(Debug, Clone, PartialEq)]
pub struct Raw {
    dt: f64,
}

impl Raw {
    pub fn new() -> Self {
        Self { dt: 0.0 }
    }
}

impl Default for Raw {
    fn default() -> Self {
        Self::new()
    }
}

impl Monitor for Raw {
    fn name(&self) -> &'static str {
        "Raw"
    }

    fn configure(&mut self, dt: f64, _shape: Shape) -> EngineResult<()> {
        if !dt.is_finite() || dt <= 0.0 {
            return Err(EngineError::InvalidTimeStep(dt));
        }
        self.dt = dt;
        Ok(())
    }

    fn record(&mut self, step: Step, state: &State) -> Option<Sample> {
        Some(Sample {
            time: step as f64 * self.dt,
            data: state.clone(),
        })
    }

    fn reset(&mut self) {}
}

/// Every `istep`-th state, restricted to the variables of interest.
#[derive(Debug, Clone, PartialEq)]
pub struct SubSample {
    sampling: Sampling,
}

impl SubSample {
    pub fn new(period: f64) -> Self {
        Self {
            sampling: Sampling::new(period, None),
        }
    }

    pub fn with_variables(mut self, variables: Vec<usize>) -> Self {
        self.sampling.variables = Some(variables);
        self
    }

    pub fn istep(&self) -> u64 {
        self.sampling.istep
    }
}

impl Monitor for SubSample {
    fn name(&self) -> &'static str {
        "SubSample"
    }

    fn configure(&mut self, dt: f64, shape: Shape) -> EngineResult<()> {
        self.sampling.configure(self.name(), dt, shape)
    }

    fn record(&mut self, step: Step, state: &State) -> Option<Sample> {
        if !self.sampling.due(step) {
            return None;
        }
        Some(Sample {
            time: step as f64 * self.sampling.dt,
            data: self.sampling.select(state),
        })
    }

    fn reset(&mut self) {}
}

/// Sub-sampled mean over nodes.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalAverage {
    sampling: Sampling,
}

impl GlobalAverage {
    pub fn new(period: f64) -> Self {
        Self {
            sampling: Sampling::new(period, None),
        }
    }

    pub fn with_variables(mut self, variables: Vec<usize>) -> Self {
        self.sampling.variables = Some(variables);
        self
    }
}

impl Monitor for GlobalAverage {
    fn name(&self) -> &'static str {
        "GlobalAverage"
    }

    fn configure(&mut self, dt: f64, shape: Shape) -> EngineResult<()> {
        self.sampling.configure(self.name(), dt, shape)
    }

    fn record(&mut self, step: Step, state: &State) -> Option<Sample> {
        if !self.sampling.due(step) {
            return None;
        }
        let selected = self.sampling.select(state);
        let data = selected
            .mean_axis(Axis(1))
            .map(|m| m.insert_axis(Axis(1)))?;
        Some(Sample {
            time: step as f64 * self.sampling.dt,
            data,
        })
    }

    fn reset(&mut self) {}
}

/// Mean of the states seen since the previous emission, stamped at the
/// middle of the window.
#[derive(Debug, Clone, PartialEq)]
pub struct TemporalAverage {
    sampling: Sampling,
    sum: Option<Array3<f64>>,
    count: u64,
}

impl TemporalAverage {
    pub fn new(period: f64) -> Self {
        Self {
            sampling: Sampling::new(period, None),
            sum: None,
            count: 0,
        }
    }

    pub fn with_variables(mut self, variables: Vec<usize>) -> Self {
        self.sampling.variables = Some(variables);
        self
    }
}

impl Monitor for TemporalAverage {
    fn name(&self) -> &'static str {
        "TemporalAverage"
    }

    fn configure(&mut self, dt: f64, shape: Shape) -> EngineResult<()> {
        self.sampling.configure(self.name(), dt, shape)?;
        self.reset();
        Ok(())
    }

    fn record(&mut self, step: Step, state: &State) -> Option<Sample> {
        let selected = self.sampling.select(state);
        match self.sum.as_mut() {
            Some(sum) => *sum += &selected,
            None => self.sum = Some(selected),
        }
        self.count += 1;

        if !self.sampling.due(step) {
            return None;
        }
        let sum = self.sum.take()?;
        let data = sum / self.count as f64;
        self.count = 0;
        let istep = self.sampling.istep as f64;
        Some(Sample {
            time: (step as f64 - istep / 2.0) * self.sampling.dt,
            data,
        })
    }

    fn reset(&mut self) {
        self.sum = None;
        self.count = 0;
    }
}

/// Serializable monitor description.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "kind", rename_all = "snake_case"))]
pub enum MonitorConfig {
    Raw,
    SubSample {
        #[cfg_attr(feature = "serde", serde(default = "default_period"))]
        period: f64,
        #[cfg_attr(feature = "serde", serde(default))]
        variables: Option<Vec<usize>>,
    },
    TemporalAverage {
        #[cfg_attr(feature = "serde", serde(default = "default_period"))]
        period: f64,
        #[cfg_attr(feature = "serde", serde(default))]
        variables: Option<Vec<usize>>,
    },
    GlobalAverage {
        #[cfg_attr(feature = "serde", serde(default = "default_period"))]
        period: f64,
        #[cfg_attr(feature = "serde", serde(default))]
        variables: Option<Vec<usize>>,
    },
}

#[cfg(feature = "serde")]
fn default_period() -> f64 {
    DEFAULT_PERIOD
}

impl MonitorConfig {
    pub fn build(&self) -> Box<dyn Monitor> {
        match self.clone() {
            MonitorConfig::Raw => Box::new(Raw::new()),
            MonitorConfig::SubSample { period, variables } => Box::new(SubSample {
                sampling: Sampling::new(period, variables),
            }),
            MonitorConfig::TemporalAverage { period, variables } => Box::new(TemporalAverage {
                sampling: Sampling::new(period, variables),
                sum: None,
                count: 0,
            }),
            MonitorConfig::GlobalAverage { period, variables } => Box::new(GlobalAverage {
                sampling: Sampling::new(period, variables),
            }),
        }
    }
}
