use ndarray::Array3;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::prng::Prng;

/// Node state indexed `(state variable, node, mode)`.
pub type State = Array3<f64>;

/// Coupling input indexed `(coupling variable, node, mode)`.
pub type CouplingInput = Array3<f64>;

/// Named state variable with the range random initial conditions are drawn from.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct StateVariable {
    pub name: String,
    pub lo: f64,
    pub hi: f64,
}

impl StateVariable {
    pub fn new(name: impl Into<String>, lo: f64, hi: f64) -> Self {
        Self {
            name: name.into(),
            lo,
            hi,
        }
    }
}

/// Short-range coupling term handed unchanged to every `dfun` call.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(untagged))]
pub enum LocalCoupling {
    Scalar(f64),
    PerNode(Vec<f64>),
}

impl Default for LocalCoupling {
    fn default() -> Self {
        LocalCoupling::Scalar(0.0)
    }
}

impl LocalCoupling {
    #[inline]
    pub fn at(&self, node: usize) -> f64 {
        match self {
            LocalCoupling::Scalar(v) => *v,
            LocalCoupling::PerNode(values) => values[node],
        }
    }

    pub fn validate(&self, nnode: usize) -> EngineResult<()> {
        match self {
            LocalCoupling::Scalar(_) => Ok(()),
            LocalCoupling::PerNode(values) if values.len() == nnode => Ok(()),
            LocalCoupling::PerNode(values) => Err(EngineError::shape(
                "local coupling",
                &[nnode],
                &[values.len()],
            )),
        }
    }
}

/// Right-hand side of the node dynamics.
///
/// `dfun` must return an array shaped exactly like `state`; coupling rows
/// follow the order of [`coupling_variables`](Model::coupling_variables).
pub trait Model {
    fn nvar(&self) -> usize;

    /// Indices of the state variables read by the coupling function.
    fn coupling_variables(&self) -> &[usize];

    fn state_variables(&self) -> Vec<StateVariable>;

    fn dfun(&self, state: &State, coupling: &CouplingInput, local: &LocalCoupling) -> State;
}

/// `dfun` with the output shape enforced.
pub fn checked_dfun(
    model: &dyn Model,
    state: &State,
    coupling: &CouplingInput,
    local: &LocalCoupling,
) -> EngineResult<State> {
    let out = model.dfun(state, coupling, local);
    if out.shape() != state.shape() {
        return Err(EngineError::shape("model dfun", state.shape(), out.shape()));
    }
    Ok(out)
}

/// Uniform draw inside each state variable's bounds.
pub fn random_initial_state(
    model: &dyn Model,
    nnode: usize,
    nmode: usize,
    rng: &mut Prng,
) -> EngineResult<State> {
    let vars = model.state_variables();
    if vars.len() != model.nvar() {
        return Err(EngineError::invalid(
            "state_variables",
            format!("model declares {} bounds for {} variables", vars.len(), model.nvar()),
        ));
    }
    for v in &vars {
        if !(v.lo.is_finite() && v.hi.is_finite() && v.lo <= v.hi) {
            return Err(EngineError::invalid(
                "state_variables",
                format!("bounds of `{}` must be finite with lo <= hi", v.name),
            ));
        }
    }

    let mut state = State::zeros((vars.len(), nnode, nmode));
    for (v, bounds) in vars.iter().enumerate() {
        for x in state.index_axis_mut(ndarray::Axis(0), v).iter_mut() {
            *x = rng.gen_range_f64(bounds.lo, bounds.hi);
        }
    }
    Ok(state)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// `dfun = x + c + l`, coupling added to the coupling variables only.
    pub struct SumModel {
        pub nvar: usize,
        pub cvar: Vec<usize>,
    }

    impl SumModel {
        pub fn single() -> Self {
            Self {
                nvar: 1,
                cvar: vec![0],
            }
        }
    }

    impl Model for SumModel {
        fn nvar(&self) -> usize {
            self.nvar
        }

        fn coupling_variables(&self) -> &[usize] {
            &self.cvar
        }

        fn state_variables(&self) -> Vec<StateVariable> {
            (0..self.nvar)
                .map(|i| StateVariable::new(format!("x{i}"), -1.0, 1.0))
                .collect()
        }

        fn dfun(&self, state: &State, coupling: &CouplingInput, local: &LocalCoupling) -> State {
            let mut out = state.clone();
            let (_, nnode, nmode) = state.dim();
            for (k, &v) in self.cvar.iter().enumerate() {
                for n in 0..nnode {
                    for m in 0..nmode {
                        out[[v, n, m]] += coupling[[k, n, m]];
                    }
                }
            }
            for n in 0..nnode {
                let l = local.at(n);
                for v in 0..self.nvar {
                    for m in 0..nmode {
                        out[[v, n, m]] += l;
                    }
                }
            }
            out
        }
    }

    /// Constant derivative `k` everywhere.
    pub struct ConstantModel {
        pub k: f64,
        pub cvar: Vec<usize>,
    }

    impl Model for ConstantModel {
        fn nvar(&self) -> usize {
            1
        }

        fn coupling_variables(&self) -> &[usize] {
            &self.cvar
        }

        fn state_variables(&self) -> Vec<StateVariable> {
            vec![StateVariable::new("x", 0.0, 1.0)]
        }

        fn dfun(&self, state: &State, _: &CouplingInput, _: &LocalCoupling) -> State {
            State::from_elem(state.raw_dim(), self.k)
        }
    }

    /// Returns the wrong shape on purpose.
    pub struct BrokenModel;

    impl Model for BrokenModel {
        fn nvar(&self) -> usize {
            1
        }

        fn coupling_variables(&self) -> &[usize] {
            &[0]
        }

        fn state_variables(&self) -> Vec<StateVariable> {
            vec![StateVariable::new("x", 0.0, 1.0)]
        }

        fn dfun(&self, state: &State, _: &CouplingInput, _: &LocalCoupling) -> State {
            let (v, n, m) = state.dim();
            State::zeros((v, n + 1, m))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn shape_mismatch_is_reported() {
        let state = State::zeros((1, 3, 1));
        let c = CouplingInput::zeros((1, 3, 1));
        let err = checked_dfun(&BrokenModel, &state, &c, &LocalCoupling::default()).unwrap_err();
        assert!(matches!(err, EngineError::ShapeMismatch { .. }));
    }

    #[test]
    fn local_coupling_reaches_dfun() {
        let model = SumModel::single();
        let state = State::ones((1, 2, 1));
        let c = CouplingInput::zeros((1, 2, 1));
        let local = LocalCoupling::PerNode(vec![0.5, -1.0]);
        let d = checked_dfun(&model, &state, &c, &local).unwrap();
        assert_eq!(d[[0, 0, 0]], 1.5);
        assert_eq!(d[[0, 1, 0]], 0.0);
        assert!(LocalCoupling::PerNode(vec![1.0]).validate(2).is_err());
    }

    #[test]
    fn random_initial_state_respects_bounds() {
        let model = SumModel {
            nvar: 2,
            cvar: vec![0],
        };
        let mut rng = Prng::new(42);
        let s = random_initial_state(&model, 10, 3, &mut rng).unwrap();
        assert_eq!(s.dim(), (2, 10, 3));
        assert!(s.iter().all(|x| (-1.0..1.0).contains(x)));

        let mut again = Prng::new(42);
        assert_eq!(random_initial_state(&model, 10, 3, &mut again).unwrap(), s);
    }
}
