//! Error types for remote requests.

/// Errors raised while building or dispatching a remote request.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RemoteError {
    /// The request could not be resolved from its configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A builder argument was rejected.
    #[error("Invalid argument '{name}': {message}")]
    InvalidArgument {
        /// Name of the rejected parameter.
        name: &'static str,
        /// Why it was rejected.
        message: String,
    },

    /// A media type, charset or similar token could not be parsed.
    #[error("Format error: {0}")]
    Format(String),

    /// The operation is not supported through this API.
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// Invalid URL provided.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Invalid header name or value.
    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    /// Content could not be serialized or deserialized.
    #[error("Content error: {0}")]
    Content(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(String),

    /// Connection refused or failed.
    #[error("Connection error: {0}")]
    Connection(String),

    /// HTTP request failed in the transport.
    #[error("HTTP request error: {0}")]
    Request(String),

    /// HTTP error status (raised when success is enforced).
    #[error("{}", format_status(*status, message.as_deref()))]
    HttpStatus {
        /// The HTTP status code.
        status: u16,
        /// Optional reason or body excerpt.
        message: Option<String>,
    },

    /// The request-level timeout expired.
    #[error("Request timed out after {elapsed_ms} ms")]
    Timeout {
        /// Milliseconds elapsed when the timer fired.
        elapsed_ms: u64,
    },

    /// The caller cancelled the request.
    #[error("Request was cancelled")]
    Cancelled,

    /// The buffered response exceeded the configured limit.
    #[error("Cannot write more bytes to the buffer than the configured maximum buffer size: {limit}")]
    ContentTooLarge {
        /// The configured limit in bytes.
        limit: u64,
    },
}

fn format_status(status: u16, message: Option<&str>) -> String {
    match message {
        Some(msg) => format!("HTTP {status}: {msg}"),
        None => format!("HTTP {status}"),
    }
}

/// Classifier for [`RemoteError`] used by suppression sets.
///
/// Kinds form a small hierarchy: [`ErrorKind::Any`] covers everything and
/// [`ErrorKind::Transport`] covers every failure that happened on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Matches every error.
    Any,
    /// Connection, request, status, timeout and buffer-limit failures.
    Transport,
    /// Connection could not be established.
    Connection,
    /// The transport reported a failure.
    Request,
    /// Non-success status under ensure-success.
    HttpStatus,
    /// Request-level timeout.
    Timeout,
    /// Response buffer limit exceeded.
    ContentTooLarge,
    /// Serialization or deserialization failure.
    Content,
    /// Builder or resolution failure.
    Configuration,
    /// Caller cancellation.
    Cancelled,
}

impl ErrorKind {
    /// Whether `self` is `kind` or one of its supertypes.
    pub fn is_supertype_of(self, kind: ErrorKind) -> bool {
        if self == kind || self == Self::Any {
            return true;
        }
        self == Self::Transport
            && matches!(
                kind,
                Self::Connection
                    | Self::Request
                    | Self::HttpStatus
                    | Self::Timeout
                    | Self::ContentTooLarge
            )
    }
}

impl RemoteError {
    /// Build an [`RemoteError::InvalidArgument`].
    pub fn invalid_argument(name: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            name,
            message: message.into(),
        }
    }

    /// The classifier of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_)
            | Self::InvalidArgument { .. }
            | Self::Format(_)
            | Self::UnsupportedOperation(_)
            | Self::InvalidUrl(_)
            | Self::InvalidHeader(_) => ErrorKind::Configuration,
            Self::Content(_) | Self::Json(_) | Self::Io(_) => ErrorKind::Content,
            Self::Connection(_) => ErrorKind::Connection,
            Self::Request(_) => ErrorKind::Request,
            Self::HttpStatus { .. } => ErrorKind::HttpStatus,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::ContentTooLarge { .. } => ErrorKind::ContentTooLarge,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Whether this error is a caller cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Whether this error is a request-level timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Whether a suppression set may swallow this error.
    ///
    /// Configuration errors and cancellation always propagate.
    pub fn is_suppressible(&self) -> bool {
        !matches!(self.kind(), ErrorKind::Configuration | ErrorKind::Cancelled)
    }

    /// Whether any kind in `set` covers this error.
    pub fn is_suppressed_by(&self, set: &[ErrorKind]) -> bool {
        self.is_suppressible() && set.iter().any(|kind| kind.is_supertype_of(self.kind()))
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout { elapsed_ms: 0 }
        } else if err.is_connect() {
            Self::Connection(err.to_string())
        } else if err.is_decode() {
            Self::Content(err.to_string())
        } else {
            Self::Request(err.to_string())
        }
    }
}

impl From<url::ParseError> for RemoteError {
    fn from(err: url::ParseError) -> Self {
        Self::InvalidUrl(err.to_string())
    }
}

impl From<serde_json::Error> for RemoteError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err.to_string())
    }
}

impl From<std::io::Error> for RemoteError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<http::header::InvalidHeaderName> for RemoteError {
    fn from(err: http::header::InvalidHeaderName) -> Self {
        Self::InvalidHeader(err.to_string())
    }
}

impl From<http::header::InvalidHeaderValue> for RemoteError {
    fn from(err: http::header::InvalidHeaderValue) -> Self {
        Self::InvalidHeader(err.to_string())
    }
}

impl From<base64::DecodeError> for RemoteError {
    fn from(err: base64::DecodeError) -> Self {
        Self::Content(format!("invalid base64: {err}"))
    }
}

impl From<toml::de::Error> for RemoteError {
    fn from(err: toml::de::Error) -> Self {
        Self::Configuration(err.to_string())
    }
}

/// A specialized Result type for remote request operations.
pub type Result<T> = std::result::Result<T, RemoteError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_hierarchy() {
        assert!(ErrorKind::Any.is_supertype_of(ErrorKind::Timeout));
        assert!(ErrorKind::Transport.is_supertype_of(ErrorKind::Connection));
        assert!(ErrorKind::Transport.is_supertype_of(ErrorKind::HttpStatus));
        assert!(!ErrorKind::Transport.is_supertype_of(ErrorKind::Content));
        assert!(!ErrorKind::Timeout.is_supertype_of(ErrorKind::Transport));
    }

    #[test]
    fn test_suppression() {
        let err = RemoteError::Connection("refused".to_string());
        assert!(err.is_suppressed_by(&[ErrorKind::Transport]));
        assert!(!err.is_suppressed_by(&[ErrorKind::Timeout]));
        assert!(!RemoteError::Cancelled.is_suppressed_by(&[ErrorKind::Any]));
        assert!(!RemoteError::Configuration("x".into()).is_suppressed_by(&[ErrorKind::Any]));
    }

    #[test]
    fn test_status_display() {
        let err = RemoteError::HttpStatus {
            status: 404,
            message: Some("Not Found".to_string()),
        };
        assert_eq!(err.to_string(), "HTTP 404: Not Found");
        let err = RemoteError::HttpStatus {
            status: 500,
            message: None,
        };
        assert_eq!(err.to_string(), "HTTP 500");
    }
}
