use reqwest::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("download cancelled")]
    Cancelled,

    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("request failed with HTTP {status} during {operation} for {url}")]
    HttpStatus {
        status: StatusCode,
        url: String,
        operation: &'static str,
    },

    #[error("manifest error: {reason}")]
    Manifest { reason: String },

    #[error("storage error at `{key}`: {source}")]
    Storage {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("mux error: {reason}")]
    Mux { reason: String },
}

impl DownloadError {
    pub fn http_status(status: StatusCode, url: impl Into<String>, operation: &'static str) -> Self {
        Self::HttpStatus {
            status,
            url: url.into(),
            operation,
        }
    }

    pub fn manifest(reason: impl Into<String>) -> Self {
        Self::Manifest {
            reason: reason.into(),
        }
    }

    pub fn storage(key: impl Into<String>, source: std::io::Error) -> Self {
        Self::Storage {
            key: key.into(),
            source,
        }
    }

    pub fn mux(reason: impl Into<String>) -> Self {
        Self::Mux {
            reason: reason.into(),
        }
    }

    /// Only transport failures and non-success responses are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network { .. } | Self::HttpStatus { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, DownloadError>;
