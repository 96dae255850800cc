//! Client-side error types.
//!
//! This module provides [`ClientError`], the error type for every client
//! operation, and [`BoxError`] for listener and task failures.

use std::time::Duration;

use grpcweb_core::{Code, EnvelopeError, ErrorDetail, Status};

/// Error type returned by listener callbacks and event loop tasks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Client-side error variants.
///
/// Argument, sequencing, and schema errors are local and reported
/// synchronously. [`ClientError::Status`] is a structured protocol failure
/// reported by the server; unary calls surface it as an
/// [`InvokeResponse`](crate::InvokeResponse) rather than an error.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ClientError {
    /// A bad or missing request value or option.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A metadata entry that cannot be sent as a header.
    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),

    /// The dispatch path is not registered.
    #[error("method {0:?} not found in file descriptors")]
    MethodNotFound(String),

    /// Operation called in the wrong lifecycle phase.
    #[error("{0}")]
    Sequencing(String),

    /// Schema files could not be read or compiled.
    #[error("failed to parse schema: {0}")]
    Parse(String),

    /// Server reflection did not produce a usable schema.
    #[error("reflection failed: {0}")]
    Discovery(String),

    /// A status reported by the server.
    #[error("{}", display_status(*code, message))]
    Status {
        code: Code,
        message: Option<String>,
        details: Vec<ErrorDetail>,
    },

    /// Transport-level error (connection failed, reset, etc.).
    #[error("transport error: {0}")]
    Transport(String),

    /// The call did not finish before its deadline.
    #[error("deadline of {0:?} exceeded")]
    TimedOut(Duration),

    /// A field kind the dynamic codec does not handle.
    #[error("field {field}: unsupported kind {kind}")]
    UnsupportedKind { field: String, kind: String },

    /// Message encoding error.
    #[error("encode error: {0}")]
    Encode(String),

    /// Message decoding error.
    #[error("decode error: {0}")]
    Decode(String),

    /// Malformed frames or unexpected data.
    #[error("protocol error: {0}")]
    Protocol(String),
}

fn display_status(code: Code, message: &Option<String>) -> String {
    match message {
        Some(message) => format!("{}: {}", code, message),
        None => code.to_string(),
    }
}

impl ClientError {
    /// Create a new status error with a code and message.
    pub fn new<S: Into<String>>(code: Code, message: S) -> Self {
        ClientError::Status {
            code,
            message: Some(message.into()),
            details: vec![],
        }
    }

    /// Create a new status error with just a code.
    pub fn from_code(code: Code) -> Self {
        ClientError::Status {
            code,
            message: None,
            details: vec![],
        }
    }

    /// Get the gRPC code that best describes this error.
    pub fn code(&self) -> Code {
        match self {
            ClientError::Status { code, .. } => *code,
            ClientError::InvalidArgument(_)
            | ClientError::InvalidMetadata(_)
            | ClientError::Parse(_) => Code::InvalidArgument,
            ClientError::MethodNotFound(_) => Code::NotFound,
            ClientError::Sequencing(_) => Code::FailedPrecondition,
            ClientError::Discovery(_) | ClientError::Transport(_) => Code::Unavailable,
            ClientError::TimedOut(_) => Code::DeadlineExceeded,
            ClientError::UnsupportedKind { .. }
            | ClientError::Encode(_)
            | ClientError::Decode(_)
            | ClientError::Protocol(_) => Code::Internal,
        }
    }

    /// Get the error message, without the variant prefix.
    pub fn message(&self) -> Option<String> {
        match self {
            ClientError::Status { message, .. } => message.clone(),
            ClientError::InvalidArgument(msg)
            | ClientError::InvalidMetadata(msg)
            | ClientError::Sequencing(msg)
            | ClientError::Parse(msg)
            | ClientError::Discovery(msg)
            | ClientError::Transport(msg)
            | ClientError::Encode(msg)
            | ClientError::Decode(msg)
            | ClientError::Protocol(msg) => Some(msg.clone()),
            other => Some(other.to_string()),
        }
    }

    /// Get the error details (only for the Status variant).
    pub fn details(&self) -> &[ErrorDetail] {
        match self {
            ClientError::Status { details, .. } => details,
            _ => &[],
        }
    }

    /// Whether the server explicitly rejected the call.
    pub fn is_status(&self) -> bool {
        matches!(self, ClientError::Status { .. })
    }

    /// Whether the error was raised locally before any network activity.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            ClientError::InvalidArgument(_)
                | ClientError::InvalidMetadata(_)
                | ClientError::MethodNotFound(_)
                | ClientError::Sequencing(_)
                | ClientError::Parse(_)
                | ClientError::UnsupportedKind { .. }
                | ClientError::Encode(_)
        )
    }

    /// Convert a status error into a [`Status`].
    pub fn to_status(&self) -> Status {
        match self {
            ClientError::Status {
                code,
                message,
                details,
            } => {
                let status = match message {
                    Some(m) => Status::new(*code, m.clone()),
                    None => Status::from_code(*code),
                };
                status.with_details(details.clone())
            }
            other => Status::new(other.code(), other.to_string()),
        }
    }
}

impl From<Status> for ClientError {
    fn from(status: Status) -> Self {
        let (code, message, details) = status.into_parts();
        ClientError::Status {
            code,
            message,
            details,
        }
    }
}

impl From<EnvelopeError> for ClientError {
    fn from(err: EnvelopeError) -> Self {
        match err {
            EnvelopeError::Decompression(msg) => {
                ClientError::Decode(format!("decompression failed: {}", msg))
            }
            other => ClientError::Protocol(other.to_string()),
        }
    }
}
