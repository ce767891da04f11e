//! Error types shared across the crate.

use thiserror::Error;

use crate::models::ModelKind;

/// Result alias for library operations.
pub type Result<T> = std::result::Result<T, NowcastError>;

/// Errors raised while estimating or forecasting with a model.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    /// Too few usable observations for the requested model.
    #[error("Insufficient data: need at least {required} points, got {actual}")]
    InsufficientData { required: usize, actual: usize },

    /// Invalid model parameter.
    #[error("Invalid parameter '{name}': {reason}")]
    InvalidParameter { name: String, reason: String },

    /// A column the model depends on is absent or entirely missing.
    #[error("Column '{0}' is missing or has no observations")]
    MissingColumn(String),

    /// Estimation produced non-finite values.
    #[error("Estimation failed to converge: {0}")]
    ConvergenceFailure(String),

    /// Singular or ill-conditioned linear system.
    #[error("Numerical error: {0}")]
    NumericalError(String),
}

/// Top-level error for the nowcasting library.
#[derive(Error, Debug)]
pub enum NowcastError {
    /// An upstream provider answered with an error or an unreadable payload.
    #[error("Fetch from {source_name} failed: {message}")]
    Fetch {
        source_name: String,
        message: String,
    },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    /// The requested model has no pre-trained artifact.
    #[error("No pre-trained {0} model is available")]
    ModelUnavailable(ModelKind),

    /// The registry holds no models at all.
    #[error("No models available. Please train models first.")]
    NoModels,

    #[error("Unknown model '{0}'")]
    UnknownModel(String),

    #[error("Forecast horizon must be between 1 and {max} hours, got {requested}")]
    InvalidHorizon { requested: usize, max: usize },

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl NowcastError {
    pub fn fetch(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Fetch {
            source_name: source_name.into(),
            message: message.into(),
        }
    }

    /// Returns `true` when the error is caused by the caller's input rather
    /// than the service state.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::UnknownModel(_) | Self::InvalidHorizon { .. } | Self::InvalidData(_)
        )
    }
}
