use thiserror::Error;

/// Error taxonomy for the recognition pipeline. Public entry points return
/// `anyhow::Result`; internal retry/dispatch logic matches on these variants
/// directly before they get wrapped.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("audio source error: {0}")]
    AudioSource(String),

    #[error("processing error: {0}")]
    Processing(String),

    #[error("recognition transport error (retryable): {0}")]
    RecognitionTransport(String),

    #[error("recognition protocol error: {0}")]
    RecognitionProtocol(String),

    #[error("ordering violation: sequence {sequence} arrived after {last_emitted} was already emitted")]
    OrderingViolation { sequence: i64, last_emitted: i64 },

    #[error("shutdown error: {0}")]
    Shutdown(String),
}

impl PipelineError {
    /// Whether this error kind should be retried by a caller with its own backoff loop.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::RecognitionTransport(_))
    }
}
