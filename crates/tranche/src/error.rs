use std::error::Error as StdError;
use std::fmt;

use uuid::Uuid;

use crate::status::StatusCode;

type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Failures of the collaborators and of the engine itself.
///
/// These never describe the outcome of a transfer; an attempt downgrades any of them
/// to [`StatusCode::UnknownError`].
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("download {id} not found")]
    NotFound { id: Uuid },

    #[error("repository error: {reason}")]
    Repository { reason: String },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("proxy configuration error: {reason}")]
    ProxyConfiguration { reason: String },

    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl EngineError {
    pub fn repository(reason: impl Into<String>) -> Self {
        Self::Repository {
            reason: reason.into(),
        }
    }

    pub fn proxy_configuration(reason: impl Into<String>) -> Self {
        Self::ProxyConfiguration {
            reason: reason.into(),
        }
    }

    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }
}

/// Why an attempt, or one of its steps, ended.
///
/// Sub-steps hand this value upwards instead of failing; only the orchestrator turns
/// it into the persisted status of a download.
#[derive(Debug)]
pub struct StopRequest {
    status: StatusCode,
    message: Option<String>,
    cause: Option<BoxError>,
}

impl StopRequest {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            message: None,
            cause: None,
        }
    }

    pub fn with_message(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: Some(message.into()),
            cause: None,
        }
    }

    /// Uses the cause's display text as the message.
    pub fn with_cause<E>(status: StatusCode, cause: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            status,
            message: Some(cause.to_string()),
            cause: Some(Box::new(cause)),
        }
    }

    pub fn caused_by<E>(mut self, cause: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn paused() -> Self {
        Self::with_message(StatusCode::Paused, "Download paused")
    }

    pub fn cancelled() -> Self {
        Self::with_message(StatusCode::Stopped, "Download cancelled")
    }

    /// Maps an HTTP status the engine has no dedicated handling for.
    pub fn unhandled_http(code: u16, reason: Option<&str>) -> Self {
        let message = match reason {
            Some(reason) => format!("Unhandled HTTP response: {code} {reason}"),
            None => format!("Unhandled HTTP response: {code}"),
        };
        Self::with_message(StatusCode::UnhandledHttpCode, message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn into_parts(self) -> (StatusCode, Option<String>) {
        (self.status, self.message)
    }
}

impl From<EngineError> for StopRequest {
    fn from(error: EngineError) -> Self {
        Self::with_cause(StatusCode::UnknownError, error)
    }
}

impl fmt::Display for StopRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{}: {}", self.status, message),
            None => write!(f, "{}", self.status),
        }
    }
}

impl StdError for StopRequest {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn StdError + 'static))
    }
}
