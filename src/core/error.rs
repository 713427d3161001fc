use std::io;

use thiserror::Error;

/// Errors raised while configuring, stepping or checkpointing the engine.
///
/// Numerical blow-up (`NaN`/`Inf` in the state) is never reported here; it
/// flows through the state stream unchanged.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Unknown scheme name, or a scheme that cannot run in the requested mode.
    #[error("invalid integration scheme: {0}")]
    InvalidScheme(String),

    #[error("invalid time step {0}: dt must be finite and > 0")]
    InvalidTimeStep(f64),

    #[error("invalid parameter `{name}`: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    /// An explicit history horizon that cannot hold the longest edge delay.
    #[error(
        "delay {delay} on edge {source_node} -> {target_node} does not fit a history horizon of {horizon}"
    )]
    DelayExceedsHorizon {
        source_node: usize,
        target_node: usize,
        delay: usize,
        horizon: usize,
    },

    #[error("shape mismatch in {context}: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        context: &'static str,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("{0} used before configure()")]
    NotConfigured(&'static str),

    /// Stepping requested after the run reached its end without `resume()`.
    #[error("integrator run already finished")]
    Finished,

    /// A checkpoint or random-stream state that cannot be resumed from.
    #[error("corrupt saved state: {0}")]
    CorruptState(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl EngineError {
    pub fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        EngineError::InvalidParameter {
            name,
            reason: reason.into(),
        }
    }

    pub fn shape(context: &'static str, expected: &[usize], found: &[usize]) -> Self {
        EngineError::ShapeMismatch {
            context,
            expected: expected.to_vec(),
            found: found.to_vec(),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
