use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ScreenshotError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("URL not allowed: {0}")]
    BlockedUrl(String),

    #[error("Invalid parameter {name}: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error("Navigation timeout after {0:?}")]
    NavigationTimeout(Duration),

    #[error("Could not resolve host: {0}")]
    DnsResolution(String),

    #[error("Browser launch failed: {0}")]
    BrowserLaunchFailed(String),

    #[error("Page error: {0}")]
    PageError(String),

    #[error("Screenshot capture failed: {0}")]
    CaptureFailed(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Coarse grouping used to decide how a failure propagates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Rejected before any job or cache entry exists
    Validation,
    /// Raised by the capture engine, retried inside the scheduler
    Capture,
    /// Cache storage problems, never fatal to a job
    Storage,
    Internal,
}

impl ScreenshotError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ScreenshotError::InvalidUrl(_)
            | ScreenshotError::BlockedUrl(_)
            | ScreenshotError::InvalidParameter { .. } => ErrorKind::Validation,
            ScreenshotError::NavigationTimeout(_)
            | ScreenshotError::DnsResolution(_)
            | ScreenshotError::BrowserLaunchFailed(_)
            | ScreenshotError::PageError(_)
            | ScreenshotError::CaptureFailed(_) => ErrorKind::Capture,
            ScreenshotError::Storage(_) => ErrorKind::Storage,
            ScreenshotError::Configuration(_)
            | ScreenshotError::Io(_)
            | ScreenshotError::Serialization(_) => ErrorKind::Internal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Capture
    }

    /// HTTP status a transport layer should answer with for this error
    pub fn status_code(&self) -> u16 {
        match self {
            ScreenshotError::NavigationTimeout(_) => 504,
            ScreenshotError::DnsResolution(_) => 502,
            _ if self.kind() == ErrorKind::Validation => 400,
            _ => 500,
        }
    }
}

impl From<std::io::Error> for ScreenshotError {
    fn from(err: std::io::Error) -> Self {
        ScreenshotError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for ScreenshotError {
    fn from(err: serde_json::Error) -> Self {
        ScreenshotError::Serialization(err.to_string())
    }
}
