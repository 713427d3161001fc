//! Long-range coupling: delayed neighbour states reduced into one input per
//! node.
//!
//! Every variant is a `pre` function applied per edge, a weighted sum over
//! the target's incoming edges and a `post` function applied to the sum.
//! Two-variable variants combine a pair of coupling variables in `pre` and
//! write the reduced value into every coupling-variable row.

use ndarray::Array3;
use tracing::debug;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::connectivity::EdgeTable;
use crate::error::{EngineError, EngineResult};
use crate::history::{DelayHistory, DelayedStates, Step};
use crate::kernels::ExecutionTier;

/// Coupling function and its parameters.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "kind", rename_all = "snake_case"))]
pub enum CouplingKind {
    /// `a * Σ w x_j + b`
    Linear { a: f64, b: f64 },
    /// `a * Σ w x_j`
    Scaling { a: f64 },
    /// `a * Σ w (x_j - x_i)`
    Difference { a: f64 },
    /// `Σ w a (1 + tanh((b x_j - midpoint) / sigma))`
    HyperbolicTangent {
        a: f64,
        b: f64,
        midpoint: f64,
        sigma: f64,
    },
    /// `cmin + (cmax - cmin) / (1 + exp(-a (Σ w x_j - midpoint) / sigma))`
    Sigmoidal {
        cmin: f64,
        cmax: f64,
        midpoint: f64,
        sigma: f64,
        a: f64,
    },
    /// `a * Σ w S(x_j0 - x_j1)`, `S` a sigmoid between `cmin` and `cmax`.
    SigmoidalJansenRit {
        cmin: f64,
        cmax: f64,
        midpoint: f64,
        r: f64,
        a: f64,
    },
    /// `a * Σ w sin(x_j - x_i)`
    Kuramoto { a: f64 },
    /// `Σ w H (Q + tanh(G (P x_j0 - x_j1 - θ)))`
    ///
    /// With `dynamic`, θ is re-estimated on every call from the undelayed
    /// state `P x_i0 - x_i1`: per target node, or averaged over nodes when
    /// `global_t` is set. Otherwise θ is the fixed `theta`.
    PreSigmoidal {
        h: f64,
        q: f64,
        g: f64,
        p: f64,
        theta: f64,
        dynamic: bool,
        global_t: bool,
    },
}

impl Default for CouplingKind {
    fn default() -> Self {
        Self::linear()
    }
}

impl CouplingKind {
    pub fn linear() -> Self {
        CouplingKind::Linear {
            a: 0.00390625,
            b: 0.0,
        }
    }

    pub fn scaling() -> Self {
        CouplingKind::Scaling { a: 0.00390625 }
    }

    pub fn difference() -> Self {
        CouplingKind::Difference { a: 0.1 }
    }

    pub fn hyperbolic_tangent() -> Self {
        CouplingKind::HyperbolicTangent {
            a: 1.0,
            b: 1.0,
            midpoint: 0.0,
            sigma: 1.0,
        }
    }

    pub fn sigmoidal() -> Self {
        CouplingKind::Sigmoidal {
            cmin: -1.0,
            cmax: 1.0,
            midpoint: 0.0,
            sigma: 230.0,
            a: 1.0,
        }
    }

    pub fn sigmoidal_jansen_rit() -> Self {
        CouplingKind::SigmoidalJansenRit {
            cmin: 0.0,
            cmax: 2.0 * 0.0025,
            midpoint: 6.0,
            r: 1.0,
            a: 0.56,
        }
    }

    pub fn kuramoto() -> Self {
        CouplingKind::Kuramoto { a: 1.0 }
    }

    pub fn pre_sigmoidal() -> Self {
        CouplingKind::PreSigmoidal {
            h: 0.5,
            q: 1.0,
            g: 60.0,
            p: 1.0,
            theta: 0.5,
            dynamic: true,
            global_t: false,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CouplingKind::Linear { .. } => "Linear",
            CouplingKind::Scaling { .. } => "Scaling",
            CouplingKind::Difference { .. } => "Difference",
            CouplingKind::HyperbolicTangent { .. } => "HyperbolicTangent",
            CouplingKind::Sigmoidal { .. } => "Sigmoidal",
            CouplingKind::SigmoidalJansenRit { .. } => "SigmoidalJansenRit",
            CouplingKind::Kuramoto { .. } => "Kuramoto",
            CouplingKind::PreSigmoidal { .. } => "PreSigmoidal",
        }
    }

    /// Number of coupling variables the model must expose.
    pub fn required_coupling_variables(&self) -> usize {
        match self {
            CouplingKind::SigmoidalJansenRit { .. } | CouplingKind::PreSigmoidal { .. } => 2,
            _ => 1,
        }
    }

    pub fn validate(&self) -> EngineResult<()> {
        let finite = |name: &'static str, v: f64| {
            if v.is_finite() {
                Ok(())
            } else {
                Err(EngineError::invalid(name, format!("must be finite, got {v}")))
            }
        };
        let nonzero = |name: &'static str, v: f64| {
            finite(name, v)?;
            if v == 0.0 {
                Err(EngineError::invalid(name, "must be non-zero"))
            } else {
                Ok(())
            }
        };
        match *self {
            CouplingKind::Linear { a, b } => {
                finite("a", a)?;
                finite("b", b)
            }
            CouplingKind::Scaling { a }
            | CouplingKind::Difference { a }
            | CouplingKind::Kuramoto { a } => finite("a", a),
            CouplingKind::HyperbolicTangent {
                a,
                b,
                midpoint,
                sigma,
            } => {
                finite("a", a)?;
                finite("b", b)?;
                finite("midpoint", midpoint)?;
                nonzero("sigma", sigma)
            }
            CouplingKind::Sigmoidal {
                cmin,
                cmax,
                midpoint,
                sigma,
                a,
            } => {
                finite("cmin", cmin)?;
                finite("cmax", cmax)?;
                finite("midpoint", midpoint)?;
                finite("a", a)?;
                nonzero("sigma", sigma)
            }
            CouplingKind::SigmoidalJansenRit {
                cmin,
                cmax,
                midpoint,
                r,
                a,
            } => {
                finite("cmin", cmin)?;
                finite("cmax", cmax)?;
                finite("midpoint", midpoint)?;
                finite("r", r)?;
                finite("a", a)
            }
            CouplingKind::PreSigmoidal {
                h, q, g, p, theta, ..
            } => {
                finite("H", h)?;
                finite("Q", q)?;
                finite("G", g)?;
                finite("P", p)?;
                finite("theta", theta)
            }
        }
    }
}

// Constants derived from the parameters at configure time. Fields a variant
// does not use stay zero.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Derived {
    a: f64,
    b: f64,
    midpoint: f64,
    inv_sigma: f64,
    cmin: f64,
    span: f64,
    r: f64,
    h: f64,
    q: f64,
    g: f64,
    p: f64,
    theta: f64,
}

#[derive(Clone, Copy)]
enum Pre {
    /// `(x_i, x_j)` of one coupling variable.
    Elementwise(fn(&Derived, f64, f64) -> f64),
    /// `(x_j0, x_j1, θ_i)` of the first two coupling variables.
    Paired(fn(&Derived, f64, f64, f64) -> f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Threshold {
    Fixed,
    PerNode,
    Global,
}

#[derive(Clone, Copy)]
struct Table {
    pre: Pre,
    post: fn(&Derived, f64) -> f64,
    threshold: Threshold,
    derived: Derived,
}

fn pre_source(_: &Derived, _x_i: f64, x_j: f64) -> f64 {
    x_j
}

fn pre_difference(_: &Derived, x_i: f64, x_j: f64) -> f64 {
    x_j - x_i
}

fn pre_phase(_: &Derived, x_i: f64, x_j: f64) -> f64 {
    (x_j - x_i).sin()
}

fn pre_tanh(d: &Derived, _x_i: f64, x_j: f64) -> f64 {
    d.a * (1.0 + ((d.b * x_j - d.midpoint) * d.inv_sigma).tanh())
}

fn pre_jansen_rit(d: &Derived, x_j0: f64, x_j1: f64, _theta: f64) -> f64 {
    d.cmin + d.span / (1.0 + (d.r * (d.midpoint - (x_j0 - x_j1))).exp())
}

fn pre_sigmoid_threshold(d: &Derived, x_j0: f64, x_j1: f64, theta: f64) -> f64 {
    d.h * (d.q + (d.g * (d.p * x_j0 - x_j1 - theta)).tanh())
}

fn post_identity(_: &Derived, gx: f64) -> f64 {
    gx
}

fn post_scale(d: &Derived, gx: f64) -> f64 {
    d.a * gx
}

fn post_affine(d: &Derived, gx: f64) -> f64 {
    d.a * gx + d.b
}

fn post_sigmoid(d: &Derived, gx: f64) -> f64 {
    d.cmin + d.span / (1.0 + (-d.a * (gx - d.midpoint) * d.inv_sigma).exp())
}

fn table_for(kind: &CouplingKind) -> Table {
    let fixed = |pre, post, derived| Table {
        pre,
        post,
        threshold: Threshold::Fixed,
        derived,
    };
    match *kind {
        CouplingKind::Linear { a, b } => fixed(
            Pre::Elementwise(pre_source),
            post_affine,
            Derived {
                a,
                b,
                ..Derived::default()
            },
        ),
        CouplingKind::Scaling { a } => fixed(
            Pre::Elementwise(pre_source),
            post_scale,
            Derived {
                a,
                ..Derived::default()
            },
        ),
        CouplingKind::Difference { a } => fixed(
            Pre::Elementwise(pre_difference),
            post_scale,
            Derived {
                a,
                ..Derived::default()
            },
        ),
        CouplingKind::Kuramoto { a } => fixed(
            Pre::Elementwise(pre_phase),
            post_scale,
            Derived {
                a,
                ..Derived::default()
            },
        ),
        CouplingKind::HyperbolicTangent {
            a,
            b,
            midpoint,
            sigma,
        } => fixed(
            Pre::Elementwise(pre_tanh),
            post_identity,
            Derived {
                a,
                b,
                midpoint,
                inv_sigma: 1.0 / sigma,
                ..Derived::default()
            },
        ),
        CouplingKind::Sigmoidal {
            cmin,
            cmax,
            midpoint,
            sigma,
            a,
        } => fixed(
            Pre::Elementwise(pre_source),
            post_sigmoid,
            Derived {
                a,
                midpoint,
                inv_sigma: 1.0 / sigma,
                cmin,
                span: cmax - cmin,
                ..Derived::default()
            },
        ),
        CouplingKind::SigmoidalJansenRit {
            cmin,
            cmax,
            midpoint,
            r,
            a,
        } => fixed(
            Pre::Paired(pre_jansen_rit),
            post_scale,
            Derived {
                a,
                midpoint,
                cmin,
                span: cmax - cmin,
                r,
                ..Derived::default()
            },
        ),
        CouplingKind::PreSigmoidal {
            h,
            q,
            g,
            p,
            theta,
            dynamic,
            global_t,
        } => Table {
            pre: Pre::Paired(pre_sigmoid_threshold),
            post: post_identity,
            threshold: match (dynamic, global_t) {
                (false, _) => Threshold::Fixed,
                (true, false) => Threshold::PerNode,
                (true, true) => Threshold::Global,
            },
            derived: Derived {
                h,
                q,
                g,
                p,
                theta,
                ..Derived::default()
            },
        },
    }
}

/// A coupling function bound to its configured evaluation table.
#[derive(Clone)]
pub struct Coupling {
    kind: CouplingKind,
    table: Option<Table>,
}

impl core::fmt::Debug for Coupling {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Coupling")
            .field("kind", &self.kind)
            .field("configured", &self.table.is_some())
            .finish()
    }
}

impl Coupling {
    pub fn new(kind: CouplingKind) -> Self {
        Self { kind, table: None }
    }

    pub fn kind(&self) -> &CouplingKind {
        &self.kind
    }

    pub fn is_configured(&self) -> bool {
        self.table.is_some()
    }

    /// Validate parameters and precompute derived constants. Idempotent.
    pub fn configure(&mut self) -> EngineResult<()> {
        self.kind.validate()?;
        self.table = Some(table_for(&self.kind));
        debug!(kind = self.kind.name(), "coupling configured");
        Ok(())
    }

    /// Coupling input `(ncvar, nnode, nmode)` seen at `step`.
    pub fn evaluate(&self, step: Step, history: &DelayHistory) -> EngineResult<Array3<f64>> {
        let delayed = history.query(step);
        let mut out = Array3::zeros(delayed.x_i.raw_dim());
        self.reduce_into(&delayed, history.edges(), ExecutionTier::Scalar, &mut out)?;
        Ok(out)
    }

    /// Reduce gathered delayed states into `out` (`(ncvar, nnode, nmode)`).
    pub fn reduce_into(
        &self,
        delayed: &DelayedStates,
        edges: &EdgeTable,
        tier: ExecutionTier,
        out: &mut Array3<f64>,
    ) -> EngineResult<()> {
        let table = self.table.ok_or(EngineError::NotConfigured("coupling"))?;
        let (ncvar, nnode, nmode) = delayed.x_i.dim();
        let required = self.kind.required_coupling_variables();
        if ncvar < required {
            return Err(EngineError::invalid(
                "coupling variables",
                format!(
                    "{} needs {required} coupling variables, model exposes {ncvar}",
                    self.kind.name()
                ),
            ));
        }
        if out.dim() != (ncvar, nnode, nmode) {
            return Err(EngineError::shape(
                "coupling output",
                &[ncvar, nnode, nmode],
                out.shape(),
            ));
        }

        let thresholds = thresholds(&table, delayed);
        let stride = ncvar * nmode;
        let mut flat = vec![0.0; nnode * stride];
        let reduce = |(target, chunk): (usize, &mut [f64])| {
            reduce_node(&table, delayed, edges, &thresholds, target, chunk)
        };

        match tier.effective() {
            #[cfg(feature = "parallel")]
            ExecutionTier::Parallel => flat.par_chunks_mut(stride).enumerate().for_each(reduce),
            _ => flat.chunks_mut(stride).enumerate().for_each(reduce),
        }

        for target in 0..nnode {
            for k in 0..ncvar {
                for m in 0..nmode {
                    out[[k, target, m]] = flat[target * stride + k * nmode + m];
                }
            }
        }
        Ok(())
    }
}

// θ per (node, mode), flattened node-major. Empty when fixed.
fn thresholds(table: &Table, delayed: &DelayedStates) -> Vec<f64> {
    let (_, nnode, nmode) = delayed.x_i.dim();
    let d = &table.derived;
    let local = |n: usize, m: usize| d.p * delayed.x_i[[0, n, m]] - delayed.x_i[[1, n, m]];
    match table.threshold {
        Threshold::Fixed => Vec::new(),
        Threshold::PerNode => (0..nnode)
            .flat_map(|n| (0..nmode).map(move |m| (n, m)))
            .map(|(n, m)| local(n, m))
            .collect(),
        Threshold::Global => {
            let means: Vec<f64> = (0..nmode)
                .map(|m| (0..nnode).map(|n| local(n, m)).sum::<f64>() / nnode as f64)
                .collect();
            (0..nnode).flat_map(|_| means.iter().copied()).collect()
        }
    }
}

fn reduce_node(
    table: &Table,
    delayed: &DelayedStates,
    edges: &EdgeTable,
    thresholds: &[f64],
    target: usize,
    out: &mut [f64],
) {
    let (ncvar, _, nmode) = delayed.x_i.dim();
    let d = &table.derived;
    let weights = edges.weights();
    match table.pre {
        Pre::Elementwise(pre) => {
            for k in 0..ncvar {
                for m in 0..nmode {
                    let x_i = delayed.x_i[[k, target, m]];
                    let mut gx = 0.0;
                    for e in edges.edges_into(target) {
                        gx += weights[e] * pre(d, x_i, delayed.x_j[[e, k, m]]);
                    }
                    out[k * nmode + m] = (table.post)(d, gx);
                }
            }
        }
        Pre::Paired(pre) => {
            for m in 0..nmode {
                let theta = if thresholds.is_empty() {
                    d.theta
                } else {
                    thresholds[target * nmode + m]
                };
                let mut gx = 0.0;
                for e in edges.edges_into(target) {
                    gx += weights[e] * pre(d, delayed.x_j[[e, 0, m]], delayed.x_j[[e, 1, m]], theta);
                }
                let value = (table.post)(d, gx);
                for k in 0..ncvar {
                    out[k * nmode + m] = value;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectivity::Connectivity;
    use crate::model::State;
    use ndarray::{array, Array2};

    fn history_for(weights: Array2<f64>, state: &State, cvar: &[usize]) -> DelayHistory {
        let conn = Connectivity::without_delays(weights).unwrap();
        let mut hist = DelayHistory::new(&conn, cvar, state.dim().2).unwrap();
        hist.fill(0, state);
        hist
    }

    fn configured(kind: CouplingKind) -> Coupling {
        let mut c = Coupling::new(kind);
        c.configure().unwrap();
        c
    }

    #[test]
    fn defaults_match_reference_parameters() {
        assert_eq!(
            CouplingKind::linear(),
            CouplingKind::Linear {
                a: 0.00390625,
                b: 0.0
            }
        );
        assert_eq!(CouplingKind::difference(), CouplingKind::Difference { a: 0.1 });
        match CouplingKind::sigmoidal_jansen_rit() {
            CouplingKind::SigmoidalJansenRit { cmax, midpoint, a, .. } => {
                assert_eq!(cmax, 0.005);
                assert_eq!(midpoint, 6.0);
                assert_eq!(a, 0.56);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(CouplingKind::pre_sigmoidal().required_coupling_variables(), 2);
        assert_eq!(CouplingKind::kuramoto().required_coupling_variables(), 1);
    }

    #[test]
    fn unit_linear_coupling_is_neighbour_sum() {
        let (w, _) = crate::connectivity::all_to_all(4, 1.0);
        let state = State::from_shape_vec((1, 4, 1), vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let hist = history_for(w, &state, &[0]);
        let c = configured(CouplingKind::Linear { a: 1.0, b: 0.0 });
        let out = c.evaluate(0, &hist).unwrap();
        let total: f64 = state.sum();
        for i in 0..4 {
            assert_eq!(out[[0, i, 0]], total - state[[0, i, 0]]);
        }
    }

    #[test]
    fn evaluate_before_configure_fails() {
        let state = State::ones((1, 2, 1));
        let hist = history_for(array![[0.0, 1.0], [1.0, 0.0]], &state, &[0]);
        let c = Coupling::new(CouplingKind::scaling());
        assert!(matches!(
            c.evaluate(0, &hist),
            Err(EngineError::NotConfigured("coupling"))
        ));
    }

    #[test]
    fn elementwise_variants() {
        let w = array![[0.0, 2.0], [1.0, 0.0]];
        let state = State::from_shape_vec((1, 2, 1), vec![0.5, 1.5]).unwrap();
        let hist = history_for(w, &state, &[0]);

        let out = configured(CouplingKind::Difference { a: 0.1 })
            .evaluate(0, &hist)
            .unwrap();
        assert!((out[[0, 0, 0]] - 0.1 * 2.0 * 1.0).abs() < 1e-15);
        assert!((out[[0, 1, 0]] - 0.1 * -1.0).abs() < 1e-15);

        let out = configured(CouplingKind::kuramoto()).evaluate(0, &hist).unwrap();
        assert!((out[[0, 0, 0]] - 2.0 * 1.0f64.sin()).abs() < 1e-15);
        assert!((out[[0, 1, 0]] - (-1.0f64).sin()).abs() < 1e-15);

        let out = configured(CouplingKind::hyperbolic_tangent())
            .evaluate(0, &hist)
            .unwrap();
        assert!((out[[0, 0, 0]] - 2.0 * (1.0 + 1.5f64.tanh())).abs() < 1e-12);

        let out = configured(CouplingKind::sigmoidal()).evaluate(0, &hist).unwrap();
        let expected = -1.0 + 2.0 / (1.0 + (-3.0f64 / 230.0).exp());
        assert!((out[[0, 0, 0]] - expected).abs() < 1e-15);

        let out = configured(CouplingKind::Linear { a: 0.5, b: 1.0 })
            .evaluate(0, &hist)
            .unwrap();
        assert_eq!(out[[0, 1, 0]], 1.25);
    }

    #[test]
    fn paired_variants_fill_every_coupling_row() {
        let w = array![[0.0, 1.0], [1.0, 0.0]];
        let state = State::from_shape_vec((2, 2, 1), vec![7.0, 3.0, 1.0, 2.0]).unwrap();
        let hist = history_for(w, &state, &[0, 1]);

        let out = configured(CouplingKind::sigmoidal_jansen_rit())
            .evaluate(0, &hist)
            .unwrap();
        // Node 0 sees node 1: x_j0 - x_j1 = 1.
        let s = 0.005 / (1.0 + (1.0f64 * (6.0 - 1.0)).exp());
        assert!((out[[0, 0, 0]] - 0.56 * s).abs() < 1e-15);
        assert_eq!(out[[0, 0, 0]], out[[1, 0, 0]]);
    }

    #[test]
    fn pre_sigmoidal_threshold_modes() {
        let w = array![[0.0, 1.0], [1.0, 0.0]];
        let state = State::from_shape_vec((2, 2, 1), vec![1.0, 2.0, 0.25, 0.5]).unwrap();
        let hist = history_for(w, &state, &[0, 1]);
        let u = [0.75, 1.5];

        let kind = |dynamic, global_t| CouplingKind::PreSigmoidal {
            h: 0.5,
            q: 1.0,
            g: 2.0,
            p: 1.0,
            theta: 0.1,
            dynamic,
            global_t,
        };
        let pre = |u_j: f64, theta: f64| 0.5 * (1.0 + (2.0 * (u_j - theta)).tanh());

        let fixed = configured(kind(false, false)).evaluate(0, &hist).unwrap();
        assert!((fixed[[0, 0, 0]] - pre(u[1], 0.1)).abs() < 1e-15);

        let local = configured(kind(true, false)).evaluate(0, &hist).unwrap();
        assert!((local[[0, 0, 0]] - pre(u[1], u[0])).abs() < 1e-15);
        assert!((local[[0, 1, 0]] - pre(u[0], u[1])).abs() < 1e-15);

        let global = configured(kind(true, true)).evaluate(0, &hist).unwrap();
        let mean = (u[0] + u[1]) / 2.0;
        assert!((global[[1, 0, 0]] - pre(u[1], mean)).abs() < 1e-15);
    }

    #[test]
    fn configure_is_idempotent() {
        let w = array![[0.0, 1.0, 0.5], [1.0, 0.0, 0.0], [0.2, 0.3, 0.0]];
        let state = State::from_shape_fn((2, 3, 2), |(v, n, m)| (v + 2 * n + 3 * m) as f64 * 0.1);
        let hist = history_for(w, &state, &[0, 1]);

        let mut c = Coupling::new(CouplingKind::pre_sigmoidal());
        c.configure().unwrap();
        let first = c.evaluate(0, &hist).unwrap();
        c.configure().unwrap();
        let second = c.evaluate(0, &hist).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn rejects_missing_coupling_variables_and_bad_params() {
        let state = State::ones((1, 2, 1));
        let hist = history_for(array![[0.0, 1.0], [1.0, 0.0]], &state, &[0]);
        let c = configured(CouplingKind::pre_sigmoidal());
        assert!(c.evaluate(0, &hist).is_err());

        let mut bad = Coupling::new(CouplingKind::Sigmoidal {
            cmin: 0.0,
            cmax: 1.0,
            midpoint: 0.0,
            sigma: 0.0,
            a: 1.0,
        });
        assert!(bad.configure().is_err());
        assert!(!bad.is_configured());
    }

    #[test]
    fn parallel_tier_matches_scalar() {
        let (w, _) = crate::connectivity::all_to_all(16, 1.0);
        let state = State::from_shape_fn((1, 16, 3), |(_, n, m)| (n as f64 * 0.3 + m as f64).sin());
        let hist = history_for(w, &state, &[0]);
        let c = configured(CouplingKind::kuramoto());
        let delayed = hist.query(0);
        let mut a = Array3::zeros((1, 16, 3));
        let mut b = Array3::zeros((1, 16, 3));
        c.reduce_into(&delayed, hist.edges(), ExecutionTier::Scalar, &mut a)
            .unwrap();
        c.reduce_into(&delayed, hist.edges(), ExecutionTier::Parallel, &mut b)
            .unwrap();
        assert_eq!(a, b);
    }
}
