//! Error types for every phase: binding, templates, requests and hosting.

use std::fmt;

use hyper::StatusCode;
use thiserror::Error;

use crate::controller::Roles;

/// Errors raised while assembling the handler tree.
///
/// These never reach request time: `AppBuilder::build` fails and the process
/// is expected to stop.
#[derive(Debug, Error)]
pub enum BindError {
    #[error("template '{template}': outlet defined more than once (byte {first} and byte {second})")]
    DuplicateOutlet {
        template: String,
        first: usize,
        second: usize,
    },

    #[error("template '{template}': {message}")]
    Template { template: String, message: String },

    #[error("route '{pattern}': a raw handler cannot be combined with {roles:?}")]
    ExclusiveRoles { pattern: String, roles: Roles },

    #[error("{role} expects view model '{expected}' but the loader produces '{found}'")]
    ViewModelMismatch {
        role: &'static str,
        expected: &'static str,
        found: &'static str,
    },

    #[error("route '{pattern}': a custom renderer needs a loader to supply its view model")]
    MissingLoader { pattern: String },

    #[error("invalid route pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("route '{pattern}' is registered twice")]
    DuplicateRoute { pattern: String },
}

impl BindError {
    pub fn invalid_pattern(pattern: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPattern {
            pattern: pattern.into(),
            reason: reason.into(),
        }
    }

    /// Attach a template name to a template compilation failure.
    pub fn from_template(template: &str, err: TemplateError) -> Self {
        match err {
            TemplateError::DuplicateOutlet { first, second } => Self::DuplicateOutlet {
                template: template.to_string(),
                first,
                second,
            },
            other => Self::Template {
                template: template.to_string(),
                message: other.to_string(),
            },
        }
    }
}

/// Template parse and render failures.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TemplateError {
    #[error("{message} at line {line}")]
    Syntax { message: String, line: usize },

    #[error("outlet defined more than once (byte {first} and byte {second})")]
    DuplicateOutlet { first: usize, second: usize },

    #[error("{0}")]
    Render(String),
}

impl TemplateError {
    pub fn syntax(message: impl Into<String>, line: usize) -> Self {
        Self::Syntax {
            message: message.into(),
            line,
        }
    }

    pub fn render(message: impl Into<String>) -> Self {
        Self::Render(message.into())
    }
}

/// A per-request lifecycle error.
///
/// Raised by loaders, actions, renderers and stream sources; recoverable by an
/// error boundary.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{message}")]
    Status { status: StatusCode, message: String },

    #[error("could not decode request: {0}")]
    Decode(String),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("render failed: {0}")]
    Render(String),

    #[error("panic: {message}")]
    Panic { message: String, backtrace: String },

    #[error(transparent)]
    Internal(Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            message: message.into(),
        }
    }

    pub fn not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND, "not found")
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn method_not_allowed() -> Self {
        Self::new(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
    }

    pub fn internal(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Internal(err.into())
    }

    pub fn decode(message: impl fmt::Display) -> Self {
        Self::Decode(message.to_string())
    }

    pub fn render(message: impl Into<String>) -> Self {
        Self::Render(message.into())
    }

    pub(crate) fn panic(message: impl Into<String>, backtrace: impl Into<String>) -> Self {
        Self::Panic {
            message: message.into(),
            backtrace: backtrace.into(),
        }
    }

    /// The HTTP status this error maps to when no boundary handles it.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Status { status, .. } => *status,
            Self::Decode(_) => StatusCode::BAD_REQUEST,
            Self::Template(_) | Self::Render(_) | Self::Panic { .. } | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn is_panic(&self) -> bool {
        matches!(self, Self::Panic { .. })
    }

    /// Captured stack trace, present only for recovered panics.
    pub fn backtrace(&self) -> Option<&str> {
        match self {
            Self::Panic { backtrace, .. } => Some(backtrace),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(Box::new(err))
    }
}

/// Host server failures.
#[derive(Debug, Error)]
pub enum ServeError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid listen address '{0}'")]
    Address(String),

    #[error("failed to install log subscriber: {0}")]
    Logging(String),
}
