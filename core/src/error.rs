//! Error type for the localizer.
//!
//! Apart from [`LocalizerError::InvalidConfig`] (raised once, at construction) and I/O failures,
//! every variant describes a recoverable condition: the controller reports it and carries on with
//! the next sensor frame.
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LocalizerError {
    /// A frame transform could not be resolved within the configured timeout. The cycle is skipped.
    #[error("transform {source_frame} -> {target_frame} unavailable at t = {stamp:.3} s")]
    TransformUnavailable {
        target_frame: String,
        source_frame: String,
        stamp: f64,
    },
    /// The particle weights summed to zero or a non-finite value.
    #[error("degenerate particle weights (sum = {sum})")]
    DegenerateWeights { sum: f64 },
    /// The range-sensor batch contained no usable points.
    #[error("range-sensor batch contained no usable points")]
    EmptySensorBatch,
    /// Data arrived before the particle cloud was initialized.
    #[error("particle cloud has not been initialized")]
    UninitializedCloud,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl LocalizerError {
    /// Whether the filter can keep running after this error.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, LocalizerError::InvalidConfig(_) | LocalizerError::Io(_))
    }
}
