//! Download status vocabulary.
//!
//! Every component reports through [`StatusCode`]. The integer codes double as the
//! severity scale used when piece outcomes are folded into one download status, so
//! their relative order is load-bearing.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Closed set of download and piece states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
pub enum StatusCode {
    /// Created, never started.
    #[default]
    Pending,
    /// Transferring data.
    Running,
    /// Stopped by a pause request; the partial file is kept.
    Paused,
    /// A transient failure occurred on an intact network; retry after a backoff.
    WaitingToRetry,
    /// No usable network, or the network changed during the attempt.
    WaitingForNetwork,
    /// Stopped by a stop request.
    Stopped,
    /// Negotiating size, range support and validator.
    FetchMetadata,
    /// All bytes are on disk.
    Success,
    /// Malformed or unsupported URL.
    BadRequest,
    /// The partial data can no longer be continued.
    CannotResume,
    /// Internal fault.
    UnknownError,
    /// The destination file could not be created or written.
    FileError,
    /// The server answered with a status the engine does not handle.
    UnhandledHttpCode,
    /// The connection failed while exchanging data.
    HttpDataError,
    /// The redirect chain exceeded the configured bound.
    TooManyRedirects,
    /// Not enough free space for the known content length.
    InsufficientSpace,
    /// HTTP 500.
    InternalServerError,
    /// HTTP 503.
    ServiceUnavailable,
}

impl StatusCode {
    /// Numeric code. Also the severity used by piece aggregation.
    pub const fn code(self) -> u16 {
        match self {
            Self::Pending => 190,
            Self::Running => 192,
            Self::Paused => 193,
            Self::WaitingToRetry => 194,
            Self::WaitingForNetwork => 195,
            Self::Stopped => 198,
            Self::FetchMetadata => 199,
            Self::Success => 200,
            Self::BadRequest => 400,
            Self::CannotResume => 489,
            Self::UnknownError => 491,
            Self::FileError => 492,
            Self::UnhandledHttpCode => 494,
            Self::HttpDataError => 495,
            Self::TooManyRedirects => 497,
            Self::InsufficientSpace => 498,
            Self::InternalServerError => 500,
            Self::ServiceUnavailable => 503,
        }
    }

    pub const fn from_code(code: u16) -> Option<Self> {
        let status = match code {
            190 => Self::Pending,
            192 => Self::Running,
            193 => Self::Paused,
            194 => Self::WaitingToRetry,
            195 => Self::WaitingForNetwork,
            198 => Self::Stopped,
            199 => Self::FetchMetadata,
            200 => Self::Success,
            400 => Self::BadRequest,
            489 => Self::CannotResume,
            491 => Self::UnknownError,
            492 => Self::FileError,
            494 => Self::UnhandledHttpCode,
            495 => Self::HttpDataError,
            497 => Self::TooManyRedirects,
            498 => Self::InsufficientSpace,
            500 => Self::InternalServerError,
            503 => Self::ServiceUnavailable,
            _ => return None,
        };
        Some(status)
    }

    pub const fn is_error(self) -> bool {
        let code = self.code();
        code >= 400 && code < 600
    }

    pub const fn is_success(self) -> bool {
        let code = self.code();
        code >= 200 && code < 300
    }

    /// Transient failures that justify another attempt.
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::HttpDataError | Self::InternalServerError | Self::ServiceUnavailable
        )
    }

    /// No further attempt will change this status on its own.
    pub const fn is_terminal(self) -> bool {
        self.is_success() || self.is_error() || matches!(self, Self::Stopped)
    }

    /// Waiting for an external trigger (backoff timer or network change).
    pub const fn is_waiting(self) -> bool {
        matches!(self, Self::WaitingToRetry | Self::WaitingForNetwork)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::WaitingToRetry => "waiting to retry",
            Self::WaitingForNetwork => "waiting for network",
            Self::Stopped => "stopped",
            Self::FetchMetadata => "fetching metadata",
            Self::Success => "success",
            Self::BadRequest => "bad request",
            Self::CannotResume => "cannot resume",
            Self::UnknownError => "unknown error",
            Self::FileError => "file error",
            Self::UnhandledHttpCode => "unhandled HTTP code",
            Self::HttpDataError => "HTTP data error",
            Self::TooManyRedirects => "too many redirects",
            Self::InsufficientSpace => "insufficient space",
            Self::InternalServerError => "internal server error",
            Self::ServiceUnavailable => "service unavailable",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.as_str(), self.code())
    }
}

impl From<StatusCode> for u16 {
    fn from(status: StatusCode) -> Self {
        status.code()
    }
}

impl TryFrom<u16> for StatusCode {
    type Error = String;

    fn try_from(code: u16) -> Result<Self, Self::Error> {
        Self::from_code(code).ok_or_else(|| format!("unknown status code {code}"))
    }
}

/// What the caller of an attempt should make of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// The attempt ran to a decision (success, error, or a waiting state).
    Finished,
    Paused,
    Stopped,
}

impl From<StatusCode> for DownloadOutcome {
    fn from(status: StatusCode) -> Self {
        match status {
            StatusCode::Paused => Self::Paused,
            StatusCode::Stopped => Self::Stopped,
            _ => Self::Finished,
        }
    }
}
