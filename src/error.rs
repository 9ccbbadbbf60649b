use std::path::PathBuf;

/// Errors produced while configuring, fitting or using an estimator.
#[derive(Debug, thiserror::Error)]
pub enum MlpError {
    #[error("invalid parameter `{name}`: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error("expected {expected} features, got {got}")]
    FeatureMismatch { expected: usize, got: usize },

    #[error("inconsistent number of samples: {features} feature rows, {targets} targets")]
    SampleMismatch { features: usize, targets: usize },

    #[error("input contains no samples")]
    EmptyInput,

    #[error("input contains NaN or infinity")]
    NonFinite,

    #[error("estimator is not fitted yet; call `fit` first")]
    NotFitted,

    #[error("classifier needs at least two classes, got {0}")]
    SingleClass(usize),

    #[error("label {0} is not among the classes seen by the estimator")]
    UnknownLabel(String),

    #[error("`classes` must be passed on the first call to `partial_fit`")]
    MissingClasses,

    #[error("`partial_fit` is only available for stochastic solvers, not {0}")]
    PartialFitUnsupported(&'static str),

    #[error("could not parse {value:?} at row {row}, column {column}")]
    Parse {
        row: usize,
        column: usize,
        value: String,
    },

    #[error("target column {0} not found")]
    MissingColumn(String),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(#[from] toml::de::Error),

    #[error("failed to draw plot: {0}")]
    Plot(String),
}

impl MlpError {
    pub(crate) fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            name,
            reason: reason.into(),
        }
    }
}

pub type Result<T, E = MlpError> = std::result::Result<T, E>;
