use ndarray::{Array3, Array4, Axis};
use tracing::{info, warn};

use crate::connectivity::{Connectivity, EdgeTable};
use crate::error::{EngineError, EngineResult};
use crate::model::State;

pub type Step = u64;

const LARGE_HISTORY_BYTES: usize = 1 << 30;

/// Delayed inputs gathered for one coupling evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct DelayedStates {
    /// Undelayed coupling variables of every node, `(ncvar, nnode, nmode)`.
    pub x_i: Array3<f64>,
    /// Coupling variables of each edge's source at `step - delay`,
    /// `(nedges, ncvar, nmode)` in edge-table order.
    pub x_j: Array3<f64>,
}

/// Ring buffer of recent coupling-variable states.
///
/// Slot `step % horizon` holds the state written at `step`. Every slot is
/// pre-filled with the initial condition, so reads reaching back before the
/// first step see that state.
#[derive(Debug, Clone)]
pub struct DelayHistory {
    // (horizon, ncvar, nnode, nmode)
    buffer: Array4<f64>,
    cvar: Vec<usize>,
    edges: EdgeTable,
    newest: Step,
}

impl DelayHistory {
    /// Buffer sized to the connectivity's own horizon (max delay + 1).
    pub fn new(conn: &Connectivity, cvar: &[usize], nmode: usize) -> EngineResult<Self> {
        Self::with_horizon(conn, cvar, nmode, conn.horizon())
    }

    pub fn with_horizon(
        conn: &Connectivity,
        cvar: &[usize],
        nmode: usize,
        horizon: usize,
    ) -> EngineResult<Self> {
        if cvar.is_empty() {
            return Err(EngineError::invalid(
                "coupling variables",
                "at least one coupling variable is required",
            ));
        }
        if nmode == 0 {
            return Err(EngineError::invalid("number_of_modes", "must be >= 1"));
        }
        if horizon == 0 {
            return Err(EngineError::invalid("horizon", "must be >= 1"));
        }

        let edges = conn.edge_table();
        for target in 0..edges.number_of_nodes() {
            for edge in edges.incoming(target) {
                if edge.delay >= horizon {
                    return Err(EngineError::DelayExceedsHorizon {
                        source_node: edge.source,
                        target_node: target,
                        delay: edge.delay,
                        horizon,
                    });
                }
            }
        }

        let nnode = conn.number_of_nodes();
        let bytes = Self::estimated_bytes(horizon, cvar.len(), nnode, nmode);
        if bytes > LARGE_HISTORY_BYTES {
            warn!(
                horizon,
                bytes, "delay history exceeds 1 GiB; consider a coarser dt or slower-speed cutoff"
            );
        }
        info!(
            horizon,
            ncvar = cvar.len(),
            nnode,
            nmode,
            edges = edges.len(),
            bytes,
            "delay history allocated"
        );

        Ok(Self {
            buffer: Array4::zeros((horizon, cvar.len(), nnode, nmode)),
            cvar: cvar.to_vec(),
            edges,
            newest: 0,
        })
    }

    pub fn estimated_bytes(horizon: usize, ncvar: usize, nnode: usize, nmode: usize) -> usize {
        horizon
            .saturating_mul(ncvar)
            .saturating_mul(nnode)
            .saturating_mul(nmode)
            .saturating_mul(core::mem::size_of::<f64>())
    }

    pub fn horizon(&self) -> usize {
        self.buffer.len_of(Axis(0))
    }

    pub fn coupling_variables(&self) -> &[usize] {
        &self.cvar
    }

    pub fn number_of_nodes(&self) -> usize {
        self.buffer.len_of(Axis(2))
    }

    pub fn number_of_modes(&self) -> usize {
        self.buffer.len_of(Axis(3))
    }

    pub fn edges(&self) -> &EdgeTable {
        &self.edges
    }

    /// Most recent step written.
    pub fn newest_step(&self) -> Step {
        self.newest
    }

    #[inline]
    fn slot(&self, step: i128) -> usize {
        step.rem_euclid(self.horizon() as i128) as usize
    }

    /// Write `state` into every slot and mark it as written at `step`.
    pub fn fill(&mut self, step: Step, state: &State) {
        self.check_state(state);
        for (k, &v) in self.cvar.iter().enumerate() {
            let src = state.index_axis(Axis(0), v);
            for mut slot in self.buffer.axis_iter_mut(Axis(0)) {
                slot.index_axis_mut(Axis(0), k).assign(&src);
            }
        }
        self.newest = step;
    }

    /// Record the state produced at `step`, which must directly follow the
    /// newest step.
    pub fn update(&mut self, step: Step, state: &State) {
        assert_eq!(
            step,
            self.newest + 1,
            "history updated out of order (newest {})",
            self.newest
        );
        self.check_state(state);
        let slot = self.slot(step as i128);
        let mut dst = self.buffer.index_axis_mut(Axis(0), slot);
        for (k, &v) in self.cvar.iter().enumerate() {
            dst.index_axis_mut(Axis(0), k)
                .assign(&state.index_axis(Axis(0), v));
        }
        self.newest = step;
    }

    /// Empty gather target with this history's dimensions.
    pub fn delayed_states(&self) -> DelayedStates {
        let ncvar = self.cvar.len();
        let nnode = self.number_of_nodes();
        let nmode = self.number_of_modes();
        DelayedStates {
            x_i: Array3::zeros((ncvar, nnode, nmode)),
            x_j: Array3::zeros((self.edges.len(), ncvar, nmode)),
        }
    }

    /// Delayed states as seen at `step`: each edge reads `step - delay`.
    pub fn query(&self, step: Step) -> DelayedStates {
        let mut out = self.delayed_states();
        self.query_into(step, &mut out);
        out
    }

    pub fn query_into(&self, step: Step, out: &mut DelayedStates) {
        assert!(
            step <= self.newest,
            "query of unwritten step {step} (newest {})",
            self.newest
        );
        self.gather(step, out);
    }

    /// Like [`query_into`](Self::query_into) for a step that may lie ahead of
    /// the newest write; every read is clamped to the newest step.
    pub fn query_ahead_into(&self, step: Step, out: &mut DelayedStates) {
        self.gather(step, out);
    }

    fn gather(&self, step: Step, out: &mut DelayedStates) {
        let newest = self.newest as i128;
        let oldest_kept = newest - self.horizon() as i128 + 1;
        let now = (step as i128).min(newest);

        out.x_i
            .assign(&self.buffer.index_axis(Axis(0), self.slot(now)));

        let nmode = self.number_of_modes();
        for target in 0..self.edges.number_of_nodes() {
            for e in self.edges.edges_into(target) {
                let edge = self.edges.edge(e);
                let read = (step as i128 - edge.delay as i128).min(newest);
                debug_assert!(
                    read >= oldest_kept || oldest_kept <= 0,
                    "step {read} already overwritten"
                );
                let slot = self.buffer.index_axis(Axis(0), self.slot(read));
                for k in 0..self.cvar.len() {
                    for m in 0..nmode {
                        out.x_j[[e, k, m]] = slot[[k, edge.source, m]];
                    }
                }
            }
        }
    }

    fn check_state(&self, state: &State) {
        let (nvar, nnode, nmode) = state.dim();
        assert!(
            nnode == self.number_of_nodes() && nmode == self.number_of_modes(),
            "state shape {:?} does not match history ({} nodes, {} modes)",
            state.shape(),
            self.number_of_nodes(),
            self.number_of_modes()
        );
        debug_assert!(self.cvar.iter().all(|&v| v < nvar));
    }

    /// Buffer contents in slot-major order, for checkpoints.
    pub(crate) fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.buffer.iter().copied()
    }

    pub(crate) fn len_values(&self) -> usize {
        self.buffer.len()
    }

    pub(crate) fn restore(&mut self, flat: &[f64], newest: Step) -> EngineResult<()> {
        if flat.len() != self.buffer.len() {
            return Err(EngineError::CorruptState(format!(
                "history holds {} values, expected {}",
                flat.len(),
                self.buffer.len()
            )));
        }
        for (dst, src) in self.buffer.iter_mut().zip(flat) {
            *dst = *src;
        }
        self.newest = newest;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array2};

    fn ring_connectivity(delays: Array2<usize>) -> Connectivity {
        let n = delays.nrows();
        let mut w = Array2::zeros((n, n));
        for i in 0..n {
            for j in 0..n {
                if i != j {
                    w[[i, j]] = 1.0;
                }
            }
        }
        Connectivity::new(w, delays).unwrap()
    }

    fn state_at(step: Step, nnode: usize) -> State {
        Array3::from_shape_fn((2, nnode, 1), |(v, n, _)| {
            step as f64 * 100.0 + n as f64 + v as f64 * 0.5
        })
    }

    #[test]
    fn horizon_is_max_delay_plus_one() {
        let conn = ring_connectivity(array![[0, 3], [5, 0]]);
        let hist = DelayHistory::new(&conn, &[0], 1).unwrap();
        assert_eq!(hist.horizon(), 6);
    }

    #[test]
    fn short_explicit_horizon_is_rejected() {
        let conn = ring_connectivity(array![[0, 3], [5, 0]]);
        let err = DelayHistory::with_horizon(&conn, &[0], 1, 4).unwrap_err();
        match err {
            EngineError::DelayExceedsHorizon {
                source_node,
                target_node,
                delay,
                horizon,
            } => {
                assert_eq!((source_node, target_node, delay, horizon), (0, 1, 5, 4));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn prefilled_history_answers_early_queries() {
        let conn = ring_connectivity(array![[0, 2], [1, 0]]);
        let mut hist = DelayHistory::new(&conn, &[1], 1).unwrap();
        let s0 = state_at(0, 2);
        hist.fill(0, &s0);

        let q = hist.query(0);
        // Only variable 1 is stored.
        assert_eq!(q.x_i[[0, 0, 0]], 0.5);
        assert_eq!(q.x_i[[0, 1, 0]], 1.5);
        for e in 0..2 {
            let src = hist.edges().edge(e).source;
            assert_eq!(q.x_j[[e, 0, 0]], s0[[1, src, 0]]);
        }
    }

    #[test]
    fn queries_return_state_written_delay_steps_earlier() {
        let delays = array![[0, 1, 4], [2, 0, 3], [0, 4, 0]];
        let conn = ring_connectivity(delays.clone());
        let mut hist = DelayHistory::new(&conn, &[0, 1], 1).unwrap();
        assert_eq!(hist.horizon(), 5);
        hist.fill(0, &state_at(0, 3));

        for t in 1..=20 {
            hist.update(t, &state_at(t, 3));
            if t < hist.horizon() as Step {
                continue;
            }
            let q = hist.query(t);
            for target in 0..3 {
                for e in hist.edges().edges_into(target) {
                    let edge = hist.edges().edge(e);
                    let expected = state_at(t - edge.delay as Step, 3);
                    assert_eq!(edge.delay, delays[[target, edge.source]]);
                    assert_eq!(q.x_j[[e, 0, 0]], expected[[0, edge.source, 0]]);
                    assert_eq!(q.x_j[[e, 1, 0]], expected[[1, edge.source, 0]]);
                }
            }
        }
    }

    #[test]
    fn lookahead_reads_clamp_to_newest() {
        let conn = ring_connectivity(array![[0, 0], [2, 0]]);
        let mut hist = DelayHistory::new(&conn, &[0], 1).unwrap();
        hist.fill(0, &state_at(0, 2));
        for t in 1..=4 {
            hist.update(t, &state_at(t, 2));
        }

        let mut out = hist.delayed_states();
        hist.query_ahead_into(5, &mut out);
        // Edge 0 is 1 -> 0 with delay 0: clamps to step 4.
        assert_eq!(out.x_j[[0, 0, 0]], 401.0);
        // Edge 1 is 0 -> 1 with delay 2: reads step 3.
        assert_eq!(out.x_j[[1, 0, 0]], 300.0);
        assert_eq!(out.x_i[[0, 1, 0]], 401.0);
    }

    #[test]
    #[should_panic(expected = "out of order")]
    fn skipping_a_step_panics() {
        let conn = ring_connectivity(array![[0, 1], [1, 0]]);
        let mut hist = DelayHistory::new(&conn, &[0], 1).unwrap();
        hist.fill(0, &state_at(0, 2));
        hist.update(2, &state_at(2, 2));
    }

    #[test]
    fn memory_estimate() {
        assert_eq!(DelayHistory::estimated_bytes(10, 2, 76, 1), 10 * 2 * 76 * 8);
    }
}
