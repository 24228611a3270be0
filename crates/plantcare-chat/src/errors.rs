/// Failures of the HTTP exchange with the chat endpoint.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The request could not be sent (DNS, connect, TLS, timeout before headers).
    #[error("chat request failed: {message}")]
    Request { message: String },
    /// The endpoint answered with a non-success status.
    #[error("chat endpoint returned status {status}: {body}")]
    Status { status: u16, body: String },
    /// Still unauthorized after the credential refresh retries were spent.
    #[error("chat endpoint rejected credentials: {message}")]
    Unauthorized { message: String },
    /// The response body failed mid-stream.
    #[error("chat stream read failed: {message}")]
    Read { message: String },
}

impl TransportError {
    pub fn request(message: impl Into<String>) -> Self {
        Self::Request {
            message: message.into(),
        }
    }

    pub fn read(message: impl Into<String>) -> Self {
        Self::Read {
            message: message.into(),
        }
    }

    /// HTTP status when the endpoint answered at all.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Unauthorized { .. } => Some(401),
            Self::Request { .. } | Self::Read { .. } => None,
        }
    }
}

/// Failures of the credential provider.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("no refresh token available")]
    MissingRefreshToken,
    #[error("token refresh failed: {0}")]
    Refresh(String),
}

/// Terminal failure of a reply, carried by `ReplyEvent::Failed`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, serde::Serialize, serde::Deserialize)]
pub enum ReplyFailure {
    /// Request, status or body read failure.
    #[error("transport failure: {message}")]
    Transport {
        message: String,
        status: Option<u16>,
    },
    /// The reply was aborted by the caller.
    #[error("reply cancelled")]
    Cancelled,
}

impl ReplyFailure {
    /// True when the endpoint answered with a non-success status, as opposed to a
    /// request or read failure.
    pub fn is_status_error(&self) -> bool {
        matches!(self, Self::Transport { status: Some(_), .. })
    }
}

impl From<&TransportError> for ReplyFailure {
    fn from(err: &TransportError) -> Self {
        ReplyFailure::Transport {
            message: err.to_string(),
            status: err.status_code(),
        }
    }
}

/// Top-level error type for the public chat API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChatError {
    /// Invalid client configuration.
    #[error("config error: {0}")]
    Config(String),
    /// Invalid caller input.
    #[error("validation error: {0}")]
    Validation(String),
    /// No credentials present where the caller requires them.
    #[error("not authenticated")]
    Unauthenticated,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    /// Terminal failure returned from a started reply.
    #[error(transparent)]
    ReplyFailed(#[from] ReplyFailure),
    /// Internal protocol misuse or invariant violation.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl ChatError {
    pub(crate) fn protocol_msg(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }
}
