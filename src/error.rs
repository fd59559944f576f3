//! Error types for VMC training.

use std::fmt;

/// Fatal errors raised during configuration resolution or training.
///
/// Configuration problems are raised before any sampler or optimizer state
/// is allocated. Numerical problems abort the run at the offending
/// iteration; the last written checkpoint remains the recovery point.
#[derive(Debug)]
pub enum TrainError {
    /// Inconsistent system/electron/spin specification or invalid settings.
    Config(String),
    /// A non-finite energy, loss, or gradient was detected while
    /// `debug.check_nan` is enabled.
    NumericalInstability { iteration: u64, quantity: String },
    /// Checkpoint bundle could not be written or read back.
    Checkpoint(String),
    /// Underlying I/O failure (stats files, checkpoint directories).
    Io(std::io::Error),
}

impl fmt::Display for TrainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainError::Config(msg) => write!(f, "configuration error: {msg}"),
            TrainError::NumericalInstability { iteration, quantity } => write!(
                f,
                "non-finite {quantity} at iteration {iteration}; aborting without applying the update"
            ),
            TrainError::Checkpoint(msg) => write!(f, "checkpoint error: {msg}"),
            TrainError::Io(err) => write!(f, "io error: {err}"),
        }
    }
}

impl std::error::Error for TrainError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TrainError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TrainError {
    fn from(err: std::io::Error) -> Self {
        TrainError::Io(err)
    }
}
