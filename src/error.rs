//! Error handling for Lipscan

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Platform has no usable capture device
    #[error("Camera unavailable: {0}")]
    CameraUnavailable(String),

    /// Camera access was declined or the device is locked
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Network/HTTP failure talking to the analysis service
    #[error("Analysis transport error: {0}")]
    AnalysisTransport(String),

    /// Analysis service answered with an error payload instead of a result
    #[error("Analysis refused: {0}")]
    AnalysisRefused(String),

    /// Analysis response did not match the expected report shape
    #[error("Analysis parse error: {0}")]
    AnalysisParse(String),

    /// History store failure (non-fatal, logged only)
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Identity bootstrap failure (history degrades to disabled)
    #[error("Identity unavailable: {0}")]
    IdentityUnavailable(String),

    /// Action rejected while a conflicting one is in flight
    #[error("Busy: {0}")]
    Busy(String),

    /// Result discarded because the session moved on
    #[error("Superseded: {0}")]
    Superseded(String),

    /// Supplied image payload could not be decoded
    #[error("Invalid image: {0}")]
    InvalidImage(String),

    /// Config error
    #[error("Config error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}
