use core::ops::Range;
use core::str::FromStr;

use ndarray::Array2;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

pub type NodeId = usize;

/// Longest delay a connectivity may carry, in steps.
pub const MAX_DELAY_STEPS: usize = i32::MAX as usize;

/// Structural network: edge strengths plus conduction delays in whole steps.
///
/// Both matrices are indexed `[target, source]`: `weights[[i, j]]` is the
/// strength of the edge carrying node `j`'s state into node `i`.
#[derive(Debug, Clone, PartialEq)]
pub struct Connectivity {
    weights: Array2<f64>,
    delay_steps: Array2<usize>,
}

/// Normalisation applied by [`Connectivity::scaled_weights`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum WeightScaling {
    /// Divide by the largest absolute edge weight.
    Tract,
    /// Divide by the largest absolute incoming weight sum.
    Region,
    #[default]
    None,
}

impl FromStr for WeightScaling {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tract" | "edge" => Ok(WeightScaling::Tract),
            "region" | "node" => Ok(WeightScaling::Region),
            "none" => Ok(WeightScaling::None),
            other => Err(EngineError::invalid(
                "weight scaling",
                format!("unknown mode `{other}` (expected tract|region|none)"),
            )),
        }
    }
}

impl Connectivity {
    pub fn new(weights: Array2<f64>, delay_steps: Array2<usize>) -> EngineResult<Self> {
        let (rows, cols) = weights.dim();
        if rows != cols {
            return Err(EngineError::invalid(
                "weights",
                format!("matrix must be square, got {rows}x{cols}"),
            ));
        }
        if delay_steps.dim() != weights.dim() {
            return Err(EngineError::shape(
                "connectivity delays",
                &[rows, cols],
                delay_steps.shape(),
            ));
        }
        if weights.iter().any(|w| !w.is_finite()) {
            return Err(EngineError::invalid("weights", "entries must be finite"));
        }
        if let Some(d) = delay_steps.iter().find(|d| **d > MAX_DELAY_STEPS) {
            return Err(EngineError::invalid(
                "delay_steps",
                format!("delay of {d} steps exceeds the limit of {MAX_DELAY_STEPS}"),
            ));
        }
        Ok(Self {
            weights,
            delay_steps,
        })
    }

    /// All edges act instantaneously (one-slot history).
    pub fn without_delays(weights: Array2<f64>) -> EngineResult<Self> {
        let delay_steps = Array2::zeros(weights.dim());
        Self::new(weights, delay_steps)
    }

    /// Discretise conduction delays as `rint(length / speed / dt)`.
    ///
    /// Halfway cases round to even.
    pub fn from_tract_lengths(
        weights: Array2<f64>,
        tract_lengths: &Array2<f64>,
        speed: f64,
        dt: f64,
    ) -> EngineResult<Self> {
        if !dt.is_finite() || dt <= 0.0 {
            return Err(EngineError::InvalidTimeStep(dt));
        }
        if !speed.is_finite() || speed <= 0.0 {
            return Err(EngineError::invalid(
                "speed",
                format!("conduction speed must be finite and > 0, got {speed}"),
            ));
        }
        if tract_lengths.dim() != weights.dim() {
            return Err(EngineError::shape(
                "tract lengths",
                weights.shape(),
                tract_lengths.shape(),
            ));
        }
        if tract_lengths.iter().any(|l| !l.is_finite() || *l < 0.0) {
            return Err(EngineError::invalid(
                "tract_lengths",
                "lengths must be finite and >= 0",
            ));
        }
        let ratios = tract_lengths.mapv(|l| (l / speed / dt).round_ties_even());
        if let Some(r) = ratios
            .iter()
            .find(|r| !r.is_finite() || **r > MAX_DELAY_STEPS as f64)
        {
            return Err(EngineError::invalid(
                "tract_lengths",
                format!(
                    "delay of {r} steps at speed {speed} and dt {dt} exceeds the limit of {MAX_DELAY_STEPS}"
                ),
            ));
        }
        let delay_steps = ratios.mapv(|r| r as usize);
        Self::new(weights, delay_steps)
    }

    pub fn number_of_nodes(&self) -> usize {
        self.weights.nrows()
    }

    pub fn weights(&self) -> &Array2<f64> {
        &self.weights
    }

    pub fn delay_steps(&self) -> &Array2<usize> {
        &self.delay_steps
    }

    /// Number of non-zero weights.
    pub fn number_of_connections(&self) -> usize {
        self.weights.iter().filter(|w| **w != 0.0).count()
    }

    pub fn max_delay(&self) -> usize {
        self.delay_steps.iter().copied().max().unwrap_or(0)
    }

    /// History slots needed so every delay stays readable.
    pub fn horizon(&self) -> usize {
        self.max_delay() + 1
    }

    pub fn is_undirected(&self) -> bool {
        self.weights == self.weights.t()
    }

    /// Copy with weights normalised according to `mode`.
    ///
    /// Only non-zero entries are rescaled; an all-zero matrix is returned
    /// unchanged.
    pub fn scaled_weights(&self, mode: WeightScaling) -> Self {
        let scale = match mode {
            WeightScaling::None => return self.clone(),
            WeightScaling::Tract => self.weights.iter().fold(0.0f64, |m, w| m.max(w.abs())),
            WeightScaling::Region => self
                .weights
                .rows()
                .into_iter()
                .map(|row| row.sum().abs())
                .fold(0.0f64, f64::max),
        };
        if scale == 0.0 {
            return self.clone();
        }
        let weights = self
            .weights
            .mapv(|w| if w != 0.0 { w / scale } else { w });
        Self {
            weights,
            delay_steps: self.delay_steps.clone(),
        }
    }

    pub fn without_self_connections(&self) -> Self {
        let mut weights = self.weights.clone();
        weights.diag_mut().fill(0.0);
        Self {
            weights,
            delay_steps: self.delay_steps.clone(),
        }
    }

    /// Sparse view of the non-zero edges, grouped by target node.
    pub fn edge_table(&self) -> EdgeTable {
        EdgeTable::from_connectivity(self)
    }
}

/// One incoming edge of a target node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Edge {
    pub source: NodeId,
    pub weight: f64,
    pub delay: usize,
}

/// Compressed sparse row storage of incoming edges.
///
/// Target `i` owns edges `offsets[i]..offsets[i + 1]`; sources are sorted
/// ascending within a target.
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeTable {
    offsets: Vec<usize>,
    sources: Vec<NodeId>,
    weights: Vec<f64>,
    delays: Vec<usize>,
}

impl EdgeTable {
    fn from_connectivity(conn: &Connectivity) -> Self {
        let n = conn.number_of_nodes();
        let nnz = conn.number_of_connections();
        let mut offsets = Vec::with_capacity(n + 1);
        let mut sources = Vec::with_capacity(nnz);
        let mut weights = Vec::with_capacity(nnz);
        let mut delays = Vec::with_capacity(nnz);

        offsets.push(0);
        for target in 0..n {
            for source in 0..n {
                let w = conn.weights[[target, source]];
                if w != 0.0 {
                    sources.push(source);
                    weights.push(w);
                    delays.push(conn.delay_steps[[target, source]]);
                }
            }
            offsets.push(sources.len());
        }

        Self {
            offsets,
            sources,
            weights,
            delays,
        }
    }

    pub fn number_of_nodes(&self) -> usize {
        self.offsets.len() - 1
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Edge indices owned by `target`.
    #[inline]
    pub fn edges_into(&self, target: NodeId) -> Range<usize> {
        self.offsets[target]..self.offsets[target + 1]
    }

    #[inline]
    pub fn edge(&self, idx: usize) -> Edge {
        Edge {
            source: self.sources[idx],
            weight: self.weights[idx],
            delay: self.delays[idx],
        }
    }

    pub fn incoming(&self, target: NodeId) -> impl Iterator<Item = Edge> + '_ {
        self.edges_into(target).map(move |idx| self.edge(idx))
    }

    pub fn sources(&self) -> &[NodeId] {
        &self.sources
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    pub fn delays(&self) -> &[usize] {
        &self.delays
    }
}

// Reference graph motifs. Each returns `(weights, tract_lengths)` with
// tract lengths equal to `max_radius` on every edge.

/// `w[i][i+1] = 1`: node `i` is driven by node `i + 1`.
pub fn linear_directed(number_of_nodes: usize, max_radius: f64) -> (Array2<f64>, Array2<f64>) {
    let mut weights = Array2::zeros((number_of_nodes, number_of_nodes));
    for i in 0..number_of_nodes.saturating_sub(1) {
        weights[[i, i + 1]] = 1.0;
    }
    with_tracts(weights, max_radius)
}

pub fn linear_undirected(number_of_nodes: usize, max_radius: f64) -> (Array2<f64>, Array2<f64>) {
    let (directed, _) = linear_directed(number_of_nodes, max_radius);
    let weights = &directed + &directed.t();
    with_tracts(weights, max_radius)
}

/// Linear motif closed into a ring by the edge `w[n-1][0]`.
pub fn chain_directed(number_of_nodes: usize, max_radius: f64) -> (Array2<f64>, Array2<f64>) {
    let (mut weights, _) = linear_directed(number_of_nodes, max_radius);
    if number_of_nodes > 1 {
        weights[[number_of_nodes - 1, 0]] = 1.0;
    }
    with_tracts(weights, max_radius)
}

pub fn chain_undirected(number_of_nodes: usize, max_radius: f64) -> (Array2<f64>, Array2<f64>) {
    let (mut weights, _) = chain_directed(number_of_nodes, max_radius);
    if number_of_nodes > 1 {
        weights[[0, number_of_nodes - 1]] = 1.0;
    }
    for i in 0..number_of_nodes.saturating_sub(1) {
        weights[[i + 1, i]] = 1.0;
    }
    with_tracts(weights, max_radius)
}

/// Every pair connected, no self-connections.
pub fn all_to_all(number_of_nodes: usize, max_radius: f64) -> (Array2<f64>, Array2<f64>) {
    let mut weights = Array2::ones((number_of_nodes, number_of_nodes));
    weights.diag_mut().fill(0.0);
    with_tracts(weights, max_radius)
}

fn with_tracts(weights: Array2<f64>, max_radius: f64) -> (Array2<f64>, Array2<f64>) {
    let tracts = weights.mapv(|w| if w != 0.0 { max_radius } else { 0.0 });
    (weights, tracts)
}
