use reqwest::StatusCode;

/// Error taxonomy for the cache engine.
///
/// Per-entry probe failures (enumeration, access-time updates, metadata
/// persistence) never surface as this type; they are logged and swallowed
/// at the call site instead. This enum is for errors that propagate out of
/// a creation path, a download, or a playlist fetch.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("download cancelled")]
    Cancelled,

    #[error("invalid URL `{input}`: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("request for {url} failed with HTTP {status}")]
    HttpStatus { status: StatusCode, url: String },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("playlist error: {reason}")]
    Playlist { reason: String },

    #[error("metadata store error: {reason}")]
    Metadata { reason: String },

    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    #[error("operation timed out: {reason}")]
    Timeout { reason: String },

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl CacheError {
    pub fn invalid_url(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub fn http_status(status: StatusCode, url: impl Into<String>) -> Self {
        Self::HttpStatus {
            status,
            url: url.into(),
        }
    }

    pub fn playlist(reason: impl Into<String>) -> Self {
        Self::Playlist {
            reason: reason.into(),
        }
    }

    /// Whether a caller should expect a retry (elsewhere, driven by the next
    /// user-triggered prefetch) to have a chance of succeeding.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Cancelled | Self::InvalidUrl { .. } | Self::Configuration { .. } => false,
            Self::HttpStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::Network { .. }
            | Self::Io { .. }
            | Self::Playlist { .. }
            | Self::Metadata { .. }
            | Self::Timeout { .. }
            | Self::Internal { .. } => true,
        }
    }
}
