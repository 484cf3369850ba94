use std::time::Duration;

/// Boxed error used for transport and body stream failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum FanoutError {
    #[error("Unsupported body payload: {0}")]
    UnsupportedBody(&'static str),

    #[error("Body stream was already consumed by an earlier batch")]
    StreamConsumed,

    #[error("Invalid URL for request {index}: {source}")]
    InvalidUrl {
        index: usize,
        #[source]
        source: url::ParseError,
    },

    #[error("Unsupported URL scheme `{scheme}` for request {index}")]
    UnsupportedScheme { index: usize, scheme: String },

    #[error("Failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("No Tokio runtime available to dispatch the batch")]
    NoRuntime,

    #[error("Request {index} timed out after {after:?}")]
    Timeout { index: usize, after: Duration },

    #[error("Transport error for request {index}: {source}")]
    Transport {
        index: usize,
        #[source]
        source: BoxError,
    },

    #[error("Failed reading body of response {index}: {source}")]
    Body {
        index: usize,
        #[source]
        source: BoxError,
    },

    #[error("Body of response {index} was already consumed")]
    BodyConsumed { index: usize },

    #[error("Failed decoding body of response {index}: {source}")]
    Decode {
        index: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("Result slot was dropped before it settled")]
    Abandoned,
}

impl FanoutError {
    /// Batch index of the request this error belongs to, when it belongs to a single request.
    pub fn index(&self) -> Option<usize> {
        match self {
            FanoutError::InvalidUrl { index, .. }
            | FanoutError::UnsupportedScheme { index, .. }
            | FanoutError::Timeout { index, .. }
            | FanoutError::Transport { index, .. }
            | FanoutError::Body { index, .. }
            | FanoutError::BodyConsumed { index }
            | FanoutError::Decode { index, .. } => Some(*index),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, FanoutError::Timeout { .. })
    }
}
