use thiserror::Error;

pub type SendFlowResult<T> = Result<T, SendFlowError>;

/// Error taxonomy observable to callers. Retryable vs. poison is a property
/// of the kind, not the call site.
#[derive(Error, Debug)]
pub enum SendFlowError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Identity unresolved: {0}")]
    IdentityUnresolved(String),

    #[error("Curve unavailable: {0}")]
    CurveUnavailable(String),

    #[error("Predictor unavailable: {0}")]
    PredictorUnavailable(String),

    #[error("Send window expired: {0}")]
    WindowExpired(String),

    #[error("Deadline exceeded: {0}")]
    Timeout(String),

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl SendFlowError {
    /// Stable machine-readable code surfaced on the API and in DLQ payloads.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::IdentityUnresolved(_) => "identity_unresolved",
            Self::CurveUnavailable(_) => "curve_unavailable",
            Self::PredictorUnavailable(_) => "predictor_unavailable",
            Self::WindowExpired(_) => "window_expired",
            Self::Timeout(_) => "timeout",
            Self::BackendUnavailable(_) => "backend_unavailable",
            Self::Serialization(_) => "serialization_error",
            Self::Io(_) => "io_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Retryable errors get exponential backoff in the ingestion pipeline;
    /// everything else is poison and goes to the DLQ on first occurrence.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::BackendUnavailable(_) | Self::Timeout(_) | Self::Io(_)
        )
    }
}
