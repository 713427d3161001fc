//! Element-wise array updates shared by the integration schemes.
//!
//! Every tier performs the same floating point operations in the same order
//! (no fused multiply-add), so trajectories do not depend on the tier.

use core::str::FromStr;

use ndarray::{Array3, Zip};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

#[cfg(feature = "simd")]
use wide::f64x4;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Below this many elements the parallel tier runs the scalar loop.
#[cfg(feature = "parallel")]
const PARALLEL_MIN_LEN: usize = 4096;

/// Execution tier for array kernels and the coupling reduction.
///
/// - `Scalar`: single-threaded loops (default, works everywhere)
/// - `Simd`: single-threaded `f64x4` lanes (requires `simd` feature)
/// - `Parallel`: multi-threaded via rayon (requires `parallel` feature)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum ExecutionTier {
    #[default]
    Scalar,
    Simd,
    Parallel,
}

impl ExecutionTier {
    /// The tier that will actually run, given the compiled features.
    pub fn effective(self) -> ExecutionTier {
        match self {
            ExecutionTier::Scalar => ExecutionTier::Scalar,
            ExecutionTier::Simd => {
                #[cfg(feature = "simd")]
                {
                    ExecutionTier::Simd
                }
                #[cfg(not(feature = "simd"))]
                {
                    ExecutionTier::Scalar
                }
            }
            ExecutionTier::Parallel => {
                #[cfg(feature = "parallel")]
                {
                    ExecutionTier::Parallel
                }
                #[cfg(not(feature = "parallel"))]
                {
                    ExecutionTier::Scalar
                }
            }
        }
    }

    /// Best tier available in this build.
    pub fn auto() -> ExecutionTier {
        #[cfg(feature = "parallel")]
        {
            ExecutionTier::Parallel
        }
        #[cfg(all(not(feature = "parallel"), feature = "simd"))]
        {
            ExecutionTier::Simd
        }
        #[cfg(all(not(feature = "parallel"), not(feature = "simd")))]
        {
            ExecutionTier::Scalar
        }
    }
}

impl FromStr for ExecutionTier {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "scalar" => Ok(ExecutionTier::Scalar),
            "simd" => Ok(ExecutionTier::Simd),
            "parallel" => Ok(ExecutionTier::Parallel),
            other => Err(EngineError::invalid(
                "execution tier",
                format!("unknown tier `{other}` (expected scalar|simd|parallel)"),
            )),
        }
    }
}

/// `y += a * x`
pub fn axpy(tier: ExecutionTier, a: f64, x: &Array3<f64>, y: &mut Array3<f64>) {
    debug_assert_eq!(x.shape(), y.shape());
    let tier = tier.effective();
    if let (Some(xs), Some(ys)) = (x.as_slice(), y.as_slice_mut()) {
        match tier {
            ExecutionTier::Scalar => axpy_scalar(a, xs, ys),
            ExecutionTier::Simd => axpy_simd(a, xs, ys),
            ExecutionTier::Parallel => axpy_parallel(a, xs, ys),
        }
        return;
    }
    Zip::from(y).and(x).for_each(|y, &x| *y += a * x);
}

/// `y += x`
pub fn add_assign(tier: ExecutionTier, x: &Array3<f64>, y: &mut Array3<f64>) {
    debug_assert_eq!(x.shape(), y.shape());
    let tier = tier.effective();
    if let (Some(xs), Some(ys)) = (x.as_slice(), y.as_slice_mut()) {
        match tier {
            ExecutionTier::Scalar => add_scalar(xs, ys),
            ExecutionTier::Simd => add_simd(xs, ys),
            ExecutionTier::Parallel => add_parallel(xs, ys),
        }
        return;
    }
    Zip::from(y).and(x).for_each(|y, &x| *y += x);
}

/// `y *= x`
pub fn mul_assign(tier: ExecutionTier, x: &Array3<f64>, y: &mut Array3<f64>) {
    debug_assert_eq!(x.shape(), y.shape());
    let tier = tier.effective();
    if let (Some(xs), Some(ys)) = (x.as_slice(), y.as_slice_mut()) {
        match tier {
            ExecutionTier::Scalar => mul_scalar(xs, ys),
            ExecutionTier::Simd => mul_simd(xs, ys),
            ExecutionTier::Parallel => mul_parallel(xs, ys),
        }
        return;
    }
    Zip::from(y).and(x).for_each(|y, &x| *y *= x);
}

#[inline]
fn axpy_scalar(a: f64, x: &[f64], y: &mut [f64]) {
    for (y, x) in y.iter_mut().zip(x) {
        *y += a * x;
    }
}

#[inline]
fn add_scalar(x: &[f64], y: &mut [f64]) {
    for (y, x) in y.iter_mut().zip(x) {
        *y += x;
    }
}

#[inline]
fn mul_scalar(x: &[f64], y: &mut [f64]) {
    for (y, x) in y.iter_mut().zip(x) {
        *y *= x;
    }
}

#[cfg(feature = "simd")]
fn lanes(x: &[f64]) -> f64x4 {
    f64x4::from([x[0], x[1], x[2], x[3]])
}

#[cfg(feature = "simd")]
fn axpy_simd(a: f64, x: &[f64], y: &mut [f64]) {
    let n = y.len();
    let simd_end = n - (n % 4);
    let av = f64x4::splat(a);
    for i in (0..simd_end).step_by(4) {
        let out = lanes(&y[i..]) + av * lanes(&x[i..]);
        y[i..(i + 4)].copy_from_slice(&out.to_array());
    }
    axpy_scalar(a, &x[simd_end..], &mut y[simd_end..]);
}

#[cfg(feature = "simd")]
fn add_simd(x: &[f64], y: &mut [f64]) {
    let n = y.len();
    let simd_end = n - (n % 4);
    for i in (0..simd_end).step_by(4) {
        let out = lanes(&y[i..]) + lanes(&x[i..]);
        y[i..(i + 4)].copy_from_slice(&out.to_array());
    }
    add_scalar(&x[simd_end..], &mut y[simd_end..]);
}

#[cfg(feature = "simd")]
fn mul_simd(x: &[f64], y: &mut [f64]) {
    let n = y.len();
    let simd_end = n - (n % 4);
    for i in (0..simd_end).step_by(4) {
        let out = lanes(&y[i..]) * lanes(&x[i..]);
        y[i..(i + 4)].copy_from_slice(&out.to_array());
    }
    mul_scalar(&x[simd_end..], &mut y[simd_end..]);
}

#[cfg(not(feature = "simd"))]
fn axpy_simd(a: f64, x: &[f64], y: &mut [f64]) {
    axpy_scalar(a, x, y);
}

#[cfg(not(feature = "simd"))]
fn add_simd(x: &[f64], y: &mut [f64]) {
    add_scalar(x, y);
}

#[cfg(not(feature = "simd"))]
fn mul_simd(x: &[f64], y: &mut [f64]) {
    mul_scalar(x, y);
}

#[cfg(feature = "parallel")]
fn axpy_parallel(a: f64, x: &[f64], y: &mut [f64]) {
    if y.len() < PARALLEL_MIN_LEN {
        return axpy_scalar(a, x, y);
    }
    y.par_iter_mut().zip(x.par_iter()).for_each(|(y, x)| *y += a * x);
}

#[cfg(feature = "parallel")]
fn add_parallel(x: &[f64], y: &mut [f64]) {
    if y.len() < PARALLEL_MIN_LEN {
        return add_scalar(x, y);
    }
    y.par_iter_mut().zip(x.par_iter()).for_each(|(y, x)| *y += x);
}

#[cfg(feature = "parallel")]
fn mul_parallel(x: &[f64], y: &mut [f64]) {
    if y.len() < PARALLEL_MIN_LEN {
        return mul_scalar(x, y);
    }
    y.par_iter_mut().zip(x.par_iter()).for_each(|(y, x)| *y *= x);
}

#[cfg(not(feature = "parallel"))]
fn axpy_parallel(a: f64, x: &[f64], y: &mut [f64]) {
    axpy_scalar(a, x, y);
}

#[cfg(not(feature = "parallel"))]
fn add_parallel(x: &[f64], y: &mut [f64]) {
    add_scalar(x, y);
}

#[cfg(not(feature = "parallel"))]
fn mul_parallel(x: &[f64], y: &mut [f64]) {
    mul_scalar(x, y);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(len: usize, scale: f64) -> Array3<f64> {
        Array3::from_shape_fn((2, len, 1), |(v, n, _)| scale * (v * len + n) as f64 + 0.25)
    }

    #[test]
    fn tiers_agree_bit_for_bit() {
        let x = ramp(4099, 0.3);
        let mut reference = ramp(4099, -1.7);
        axpy(ExecutionTier::Scalar, 0.01, &x, &mut reference);
        add_assign(ExecutionTier::Scalar, &x, &mut reference);
        mul_assign(ExecutionTier::Scalar, &x, &mut reference);

        for tier in [ExecutionTier::Simd, ExecutionTier::Parallel] {
            let mut y = ramp(4099, -1.7);
            axpy(tier, 0.01, &x, &mut y);
            add_assign(tier, &x, &mut y);
            mul_assign(tier, &x, &mut y);
            assert!(
                y.iter()
                    .zip(reference.iter())
                    .all(|(a, b)| a.to_bits() == b.to_bits()),
                "tier {tier:?} diverged"
            );
        }
    }

    #[test]
    fn non_contiguous_arrays_fall_back() {
        let x = Array3::from_elem((3, 2, 1), 1.5);
        let mut y = Array3::<f64>::ones((1, 2, 3)).reversed_axes();
        assert!(y.as_slice().is_none());
        axpy(ExecutionTier::Simd, 2.0, &x, &mut y);
        assert!(y.iter().all(|v| *v == 4.0));
    }

    #[test]
    fn effective_tier_respects_features() {
        assert_eq!(ExecutionTier::Scalar.effective(), ExecutionTier::Scalar);
        #[cfg(not(feature = "simd"))]
        assert_eq!(ExecutionTier::Simd.effective(), ExecutionTier::Scalar);
        #[cfg(feature = "simd")]
        assert_eq!(ExecutionTier::Simd.effective(), ExecutionTier::Simd);
        #[cfg(not(feature = "parallel"))]
        assert_eq!(ExecutionTier::Parallel.effective(), ExecutionTier::Scalar);
        assert_eq!(ExecutionTier::auto(), ExecutionTier::auto().effective());
        assert_eq!("SIMD".parse::<ExecutionTier>().unwrap(), ExecutionTier::Simd);
        assert!("gpu".parse::<ExecutionTier>().is_err());
    }
}
