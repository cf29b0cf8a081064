//! HSO error taxonomy, mirroring `crates/ts/src/error.rs`'s layering for the
//! playlist/fetch/pipeline side of the workspace.

#[derive(Debug, thiserror::Error)]
pub enum HlsError {
    #[error("invalid playlist at {uri}: {reason}")]
    InvalidPlaylist { uri: String, reason: String },

    #[error("transport error fetching {uri}: {source}")]
    TransportError {
        uri: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("HTTP {status} fetching {uri}")]
    HttpStatus { uri: String, status: u16 },

    #[error("fragment fetch failed for {uri}: {reason}")]
    FragmentFetchFailed { uri: String, reason: String },

    #[error("resource not found: {uri}")]
    NotFoundUri { uri: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("invalid configuration: {reason}")]
    Configuration { reason: String },

    #[error("no keyframe found in seek window")]
    NoKeyframe,
}

impl HlsError {
    pub fn invalid_playlist(uri: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPlaylist {
            uri: uri.into(),
            reason: reason.into(),
        }
    }

    pub fn transport_error(uri: impl Into<String>, source: reqwest::Error) -> Self {
        Self::TransportError {
            uri: uri.into(),
            source,
        }
    }

    pub fn http_status(uri: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            uri: uri.into(),
            status,
        }
    }

    pub fn fragment_fetch_failed(uri: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::FragmentFetchFailed {
            uri: uri.into(),
            reason: reason.into(),
        }
    }

    pub fn not_found(uri: impl Into<String>) -> Self {
        Self::NotFoundUri { uri: uri.into() }
    }

    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    /// Whether retrying the same operation unchanged might succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Cancelled
            | Self::InvalidPlaylist { .. }
            | Self::NotFoundUri { .. }
            | Self::Configuration { .. }
            | Self::NoKeyframe => false,
            Self::HttpStatus { status, .. } => *status >= 500 || *status == 429,
            Self::TransportError { .. } | Self::FragmentFetchFailed { .. } | Self::Io { .. } => {
                true
            }
        }
    }

    /// Whether this error should tear down the whole pipeline rather than
    /// being handled locally (§7 "Surfaced" list).
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Cancelled)
    }
}
