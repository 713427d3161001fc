//! Node dynamics shipped with the engine.

use ndarray::Axis;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::model::{CouplingInput, LocalCoupling, Model, State, StateVariable};

/// FitzHugh-Nagumo style oscillator with a fast variable `V` and a slow
/// recovery variable `W`:
///
/// ```text
/// dV = tau (omega W + upsilon V - gamma V^3 / 3 + c + l V)
/// dW = (a - eta V - b W) / tau
/// ```
///
/// Long-range coupling enters through `V` only.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Generic2dOscillator {
    pub tau: f64,
    pub a: f64,
    pub b: f64,
    pub omega: f64,
    pub upsilon: f64,
    pub gamma: f64,
    pub eta: f64,
}

impl Default for Generic2dOscillator {
    fn default() -> Self {
        Self {
            tau: 1.25,
            a: 1.05,
            b: 0.2,
            omega: 1.0,
            upsilon: 1.0,
            gamma: 1.0,
            eta: 1.0,
        }
    }
}

impl Generic2dOscillator {
    const CVAR: [usize; 1] = [0];

    pub fn validate(&self) -> EngineResult<()> {
        let params = [
            ("tau", self.tau),
            ("a", self.a),
            ("b", self.b),
            ("omega", self.omega),
            ("upsilon", self.upsilon),
            ("gamma", self.gamma),
            ("eta", self.eta),
        ];
        if let Some(&(name, v)) = params.iter().find(|(_, v)| !v.is_finite()) {
            return Err(EngineError::invalid(name, format!("must be finite, got {v}")));
        }
        if self.tau == 0.0 {
            return Err(EngineError::invalid("tau", "must be non-zero"));
        }
        Ok(())
    }
}

impl Model for Generic2dOscillator {
    fn nvar(&self) -> usize {
        2
    }

    fn coupling_variables(&self) -> &[usize] {
        &Self::CVAR
    }

    fn state_variables(&self) -> Vec<StateVariable> {
        vec![
            StateVariable::new("V", -2.0, 4.0),
            StateVariable::new("W", -6.0, 6.0),
        ]
    }

    fn dfun(&self, state: &State, coupling: &CouplingInput, local: &LocalCoupling) -> State {
        let mut out = State::zeros(state.raw_dim());
        let v = state.index_axis(Axis(0), 0);
        let w = state.index_axis(Axis(0), 1);
        let c = coupling.index_axis(Axis(0), 0);

        for ((n, m), &vv) in v.indexed_iter() {
            let ww = w[[n, m]];
            out[[0, n, m]] = self.tau
                * (self.omega * ww + self.upsilon * vv - self.gamma * vv.powi(3) / 3.0
                    + c[[n, m]]
                    + local.at(n) * vv);
            out[[1, n, m]] = (self.a - self.eta * vv - self.b * ww) / self.tau;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivative_at_known_point() {
        let model = Generic2dOscillator::default();
        let state = State::from_shape_vec((2, 1, 1), vec![1.0, 0.5]).unwrap();
        let c = CouplingInput::from_elem((1, 1, 1), 0.25);
        let d = model.dfun(&state, &c, &LocalCoupling::Scalar(2.0));

        let dv = 1.25 * (0.5 + 1.0 - 1.0 / 3.0 + 0.25 + 2.0);
        let dw = (1.05 - 1.0 - 0.2 * 0.5) / 1.25;
        assert!((d[[0, 0, 0]] - dv).abs() < 1e-12);
        assert!((d[[1, 0, 0]] - dw).abs() < 1e-12);
    }

    #[test]
    fn exposes_fitzhugh_nagumo_layout() {
        let model = Generic2dOscillator::default();
        assert_eq!(model.nvar(), 2);
        assert_eq!(model.coupling_variables(), &[0]);
        let vars = model.state_variables();
        assert_eq!(vars[1].name, "W");
        assert_eq!((vars[0].lo, vars[0].hi), (-2.0, 4.0));
        assert!(model.validate().is_ok());
        assert!(Generic2dOscillator { tau: 0.0, ..model }.validate().is_err());
    }
}
