use std::time::Duration;
use thiserror::Error;
use tokio::sync::AcquireError;

#[derive(Debug, Clone, Error)]
pub enum ExportError {
    #[error("Asset fetch failed: {0}")]
    AssetFetchFailed(String),

    #[error("Browser unavailable")]
    BrowserUnavailable,

    #[error("Browser launch failed: {0}")]
    BrowserLaunchFailed(String),

    #[error("No worker available after {0:?}")]
    AcquireTimeout(Duration),

    #[error("Worker creation failed: {0}")]
    CreateFailed(String),

    #[error("Chart did not rasterize within {0:?}")]
    RasterizationTimeout(Duration),

    #[error("Invalid render input: {0}")]
    InvalidRenderInput(String),

    #[error("Export failed: {0}")]
    ExportFailed(String),

    #[error("Resource injection failed: {0}")]
    ResourceInjectionFailed(String),

    #[error("Page error: {0}")]
    PageError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Semaphore acquire error: {0}")]
    SemaphoreError(String),
}

impl ExportError {
    /// Whether the caller can reasonably retry the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExportError::AssetFetchFailed(_)
                | ExportError::BrowserUnavailable
                | ExportError::AcquireTimeout(_)
                | ExportError::CreateFailed(_)
                | ExportError::RasterizationTimeout(_)
                | ExportError::PageError(_)
        )
    }

    /// Whether the error implies the page JS state may be corrupt. A lease
    /// that fails this way is destroyed instead of soft-reset.
    pub fn corrupts_page(&self) -> bool {
        matches!(
            self,
            ExportError::RasterizationTimeout(_)
                | ExportError::ExportFailed(_)
                | ExportError::PageError(_)
        )
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            ExportError::InvalidRenderInput(_) => ErrorSeverity::Low,
            ExportError::ResourceInjectionFailed(_) => ErrorSeverity::Low,
            ExportError::ConfigurationError(_) => ErrorSeverity::High,
            ExportError::BrowserLaunchFailed(_) => ErrorSeverity::High,
            ExportError::BrowserUnavailable => ErrorSeverity::Critical,
            _ => ErrorSeverity::Medium,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl From<AcquireError> for ExportError {
    fn from(err: AcquireError) -> Self {
        ExportError::SemaphoreError(err.to_string())
    }
}

impl From<std::io::Error> for ExportError {
    fn from(err: std::io::Error) -> Self {
        ExportError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for ExportError {
    fn from(err: serde_json::Error) -> Self {
        ExportError::SerializationError(err.to_string())
    }
}

impl From<reqwest::Error> for ExportError {
    fn from(err: reqwest::Error) -> Self {
        ExportError::AssetFetchFailed(err.to_string())
    }
}
