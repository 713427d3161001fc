//! External drive added to the state at every step.

use ndarray::Axis;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::model::State;
use crate::noise::ScalarFunction;

/// State-shaped drive evaluated at the time of the step being produced.
///
/// `out` arrives zeroed; implementations write only what they drive.
pub trait Stimulus {
    fn evaluate(&self, time: f64, out: &mut State);

    /// Check the stimulus against a `(nvar, nnode, nmode)` state before the
    /// first step.
    fn validate(&self, _shape: (usize, usize, usize)) -> EngineResult<()> {
        Ok(())
    }
}

impl<F> Stimulus for F
where
    F: Fn(f64, &mut State),
{
    fn evaluate(&self, time: f64, out: &mut State) {
        self(time, out)
    }
}

/// Rectangular pulses of `amplitude`, `width` ms long, every `period` ms
/// from `onset` on.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PulseTrain {
    pub onset: f64,
    pub period: f64,
    pub width: f64,
    pub amplitude: f64,
}

impl Default for PulseTrain {
    fn default() -> Self {
        Self {
            onset: 30.0,
            period: 100.0,
            width: 0.0,
            amplitude: 1.0,
        }
    }
}

impl PulseTrain {
    pub fn validate(&self) -> EngineResult<()> {
        if !(self.period.is_finite() && self.period > 0.0) {
            return Err(EngineError::invalid("period", "must be finite and > 0"));
        }
        if !(self.width.is_finite() && self.width >= 0.0) {
            return Err(EngineError::invalid("width", "must be finite and >= 0"));
        }
        if !(self.onset.is_finite() && self.amplitude.is_finite()) {
            return Err(EngineError::invalid("onset/amplitude", "must be finite"));
        }
        Ok(())
    }
}

impl ScalarFunction for PulseTrain {
    fn eval(&self, t: f64) -> f64 {
        if t < self.onset {
            return 0.0;
        }
        if (t - self.onset).rem_euclid(self.period) < self.width {
            self.amplitude
        } else {
            0.0
        }
    }
}

/// Separable stimulus: a temporal profile scaled by a per-node weight and
/// applied to selected state variables in every mode.
pub struct RegionStimulus {
    temporal: Box<dyn ScalarFunction>,
    weights: Vec<f64>,
    variables: Vec<usize>,
}

impl core::fmt::Debug for RegionStimulus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RegionStimulus")
            .field("weights", &self.weights)
            .field("variables", &self.variables)
            .finish_non_exhaustive()
    }
}

impl RegionStimulus {
    pub fn new(temporal: Box<dyn ScalarFunction>, weights: Vec<f64>) -> Self {
        Self {
            temporal,
            weights,
            variables: vec![0],
        }
    }

    pub fn with_variables(mut self, variables: Vec<usize>) -> Self {
        self.variables = variables;
        self
    }
}

impl Stimulus for RegionStimulus {
    fn evaluate(&self, time: f64, out: &mut State) {
        let amplitude = self.temporal.eval(time);
        if amplitude == 0.0 {
            return;
        }
        for &v in &self.variables {
            let mut var = out.index_axis_mut(Axis(0), v);
            for (n, mut node) in var.axis_iter_mut(Axis(0)).enumerate() {
                node.fill(amplitude * self.weights[n]);
            }
        }
    }

    fn validate(&self, shape: (usize, usize, usize)) -> EngineResult<()> {
        let (nvar, nnode, _) = shape;
        if self.weights.len() != nnode {
            return Err(EngineError::shape(
                "stimulus weights",
                &[nnode],
                &[self.weights.len()],
            ));
        }
        if let Some(v) = self.variables.iter().find(|&&v| v >= nvar) {
            return Err(EngineError::invalid(
                "stimulus variables",
                format!("variable {v} out of range for {nvar} state variables"),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pulse_train_is_on_inside_each_window() {
        let p = PulseTrain {
            onset: 10.0,
            period: 5.0,
            width: 1.0,
            amplitude: 2.0,
        };
        assert_eq!(p.eval(9.9), 0.0);
        assert_eq!(p.eval(10.0), 2.0);
        assert_eq!(p.eval(10.5), 2.0);
        assert_eq!(p.eval(11.5), 0.0);
        assert_eq!(p.eval(15.25), 2.0);
        assert!(PulseTrain { period: 0.0, ..p }.validate().is_err());
    }

    #[test]
    fn region_stimulus_scales_by_node_weight() {
        let stim = RegionStimulus::new(Box::new(|t: f64| t), vec![0.0, 1.0, 0.5])
            .with_variables(vec![1]);
        assert!(stim.validate((2, 3, 1)).is_ok());
        assert!(stim.validate((1, 3, 1)).is_err());
        assert!(stim.validate((2, 4, 1)).is_err());

        let mut out = State::zeros((2, 3, 1));
        stim.evaluate(4.0, &mut out);
        assert_eq!(out.index_axis(Axis(0), 0).sum(), 0.0);
        assert_eq!(out[[1, 1, 0]], 4.0);
        assert_eq!(out[[1, 2, 0]], 2.0);
    }

    #[test]
    fn closures_are_stimuli() {
        let stim = |t: f64, out: &mut State| out.fill(t * 2.0);
        let mut out = State::zeros((1, 2, 1));
        Stimulus::evaluate(&stim, 1.5, &mut out);
        assert!(out.iter().all(|v| *v == 3.0));
    }
}
