use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LookupError {
    #[error("Address cannot be empty")]
    EmptyAddress,

    #[error("Invalid address format: {0}")]
    InvalidFormat(String),

    #[error("Browser session pool exhausted (capacity {capacity}, waited {waited:?})")]
    PoolExhausted { capacity: usize, waited: Duration },

    #[error("Browser session pool is closed")]
    PoolClosed,

    #[error("Browser session launch failed: {0}")]
    SessionLaunch(String),

    #[error("Navigation timed out after {0:?}")]
    NavigationTimeout(Duration),

    #[error("Bot challenge unresolved at {0}")]
    ChallengeUnresolved(String),

    #[error("Upstream blocked the request: {0}")]
    UpstreamBlocked(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Extraction produced no data")]
    ExtractionEmpty,

    #[error("Cache unavailable: {0}")]
    CacheUnavailable(String),

    #[error("Fetch exhausted after {attempts} attempts: {last}")]
    FetchExhausted {
        attempts: usize,
        last: Box<LookupError>,
    },

    #[error("Lookup cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Stable error taxonomy reported to callers and progress sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Empty,
    InvalidFormat,
    PoolExhausted,
    PoolClosed,
    SessionLaunch,
    NavigationTimeout,
    ChallengeUnresolved,
    UpstreamBlocked,
    TransportError,
    ExtractionEmpty,
    CacheUnavailable,
    FetchExhausted,
    Cancelled,
    Configuration,
    Io,
    Serialization,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Empty => "Empty",
            ErrorKind::InvalidFormat => "InvalidFormat",
            ErrorKind::PoolExhausted => "PoolExhausted",
            ErrorKind::PoolClosed => "PoolClosed",
            ErrorKind::SessionLaunch => "SessionLaunch",
            ErrorKind::NavigationTimeout => "NavigationTimeout",
            ErrorKind::ChallengeUnresolved => "ChallengeUnresolved",
            ErrorKind::UpstreamBlocked => "UpstreamBlocked",
            ErrorKind::TransportError => "TransportError",
            ErrorKind::ExtractionEmpty => "ExtractionEmpty",
            ErrorKind::CacheUnavailable => "CacheUnavailable",
            ErrorKind::FetchExhausted => "FetchExhausted",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::Configuration => "Configuration",
            ErrorKind::Io => "Io",
            ErrorKind::Serialization => "Serialization",
        };
        f.write_str(name)
    }
}

/// Structured `{kind, message}` error returned per address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

impl LookupError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LookupError::EmptyAddress => ErrorKind::Empty,
            LookupError::InvalidFormat(_) => ErrorKind::InvalidFormat,
            LookupError::PoolExhausted { .. } => ErrorKind::PoolExhausted,
            LookupError::PoolClosed => ErrorKind::PoolClosed,
            LookupError::SessionLaunch(_) => ErrorKind::SessionLaunch,
            LookupError::NavigationTimeout(_) => ErrorKind::NavigationTimeout,
            LookupError::ChallengeUnresolved(_) => ErrorKind::ChallengeUnresolved,
            LookupError::UpstreamBlocked(_) => ErrorKind::UpstreamBlocked,
            LookupError::TransportError(_) => ErrorKind::TransportError,
            LookupError::ExtractionEmpty => ErrorKind::ExtractionEmpty,
            LookupError::CacheUnavailable(_) => ErrorKind::CacheUnavailable,
            LookupError::FetchExhausted { .. } => ErrorKind::FetchExhausted,
            LookupError::Cancelled => ErrorKind::Cancelled,
            LookupError::Configuration(_) => ErrorKind::Configuration,
            LookupError::Io(_) => ErrorKind::Io,
            LookupError::Serialization(_) => ErrorKind::Serialization,
        }
    }

    /// Whether another fetch attempt can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LookupError::PoolExhausted { .. }
                | LookupError::SessionLaunch(_)
                | LookupError::NavigationTimeout(_)
                | LookupError::ChallengeUnresolved(_)
                | LookupError::UpstreamBlocked(_)
                | LookupError::TransportError(_)
        )
    }

    /// Client-input errors that are surfaced without consuming any resource.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            LookupError::EmptyAddress | LookupError::InvalidFormat(_)
        )
    }

    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

impl From<&LookupError> for ErrorBody {
    fn from(err: &LookupError) -> Self {
        err.to_body()
    }
}

impl From<std::io::Error> for LookupError {
    fn from(err: std::io::Error) -> Self {
        LookupError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for LookupError {
    fn from(err: serde_json::Error) -> Self {
        LookupError::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for LookupError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LookupError::NavigationTimeout(Duration::ZERO)
        } else {
            LookupError::TransportError(err.to_string())
        }
    }
}

impl From<chromiumoxide::error::CdpError> for LookupError {
    fn from(err: chromiumoxide::error::CdpError) -> Self {
        LookupError::TransportError(err.to_string())
    }
}
