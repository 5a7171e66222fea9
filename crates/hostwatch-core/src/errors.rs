//! Typed application errors shared by the agent and the dashboard.
//!
//! - [`ErrorKind`]: which subsystem an error came from
//! - [`Severity`]: how loudly it should be reported
//! - [`AppError`]: the error value itself, with retryability derived once
//!   from `(kind, severity)` at construction

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// Classification
// ─────────────────────────────────────────────────────────────────────────────

/// Error domain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Dial, read, or write failure on a socket.
    Network,
    /// Host or runtime failure (sampling, task panic).
    System,
    /// Bad or missing configuration.
    Config,
    /// Data could not be produced or stored.
    Data,
    /// Peer violated the wire protocol.
    Protocol,
    /// Inbound payload failed to parse or validate.
    Validation,
    /// Credentials rejected.
    Authentication,
    /// Unclassified.
    Unknown,
}

impl ErrorKind {
    /// All kinds, in declaration order.
    pub const ALL: [Self; 8] = [
        Self::Network,
        Self::System,
        Self::Config,
        Self::Data,
        Self::Protocol,
        Self::Validation,
        Self::Authentication,
        Self::Unknown,
    ];
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Network => "network",
            Self::System => "system",
            Self::Config => "config",
            Self::Data => "data",
            Self::Protocol => "protocol",
            Self::Validation => "validation",
            Self::Authentication => "authentication",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Error severity, ordered from least to most severe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Expected noise.
    Low,
    /// Recoverable failure.
    Medium,
    /// Recoverable but operator-visible.
    High,
    /// Unrecoverable for the affected task.
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Whether an error of this kind and severity is worth retrying.
///
/// Config and authentication failures never are, nor is anything critical.
/// Only network, system, and protocol failures are retried.
pub fn is_retryable(kind: ErrorKind, severity: Severity) -> bool {
    if severity == Severity::Critical {
        return false;
    }
    matches!(
        kind,
        ErrorKind::Network | ErrorKind::System | ErrorKind::Protocol
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// AppError
// ─────────────────────────────────────────────────────────────────────────────

type Cause = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// A classified error with an optional underlying cause.
#[derive(Clone)]
pub struct AppError {
    kind: ErrorKind,
    severity: Severity,
    message: String,
    cause: Option<Cause>,
    timestamp: DateTime<Utc>,
    retryable: bool,
}

impl AppError {
    /// Create an error without a cause.
    pub fn new(kind: ErrorKind, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity,
            message: message.into(),
            cause: None,
            timestamp: Utc::now(),
            retryable: is_retryable(kind, severity),
        }
    }

    /// Create an error wrapping `cause`.
    pub fn wrap<E>(kind: ErrorKind, severity: Severity, message: impl Into<String>, cause: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    {
        let mut err = Self::new(kind, severity, message);
        err.cause = Some(Arc::from(cause.into()));
        err
    }

    /// Shorthand for a medium-severity network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, Severity::Medium, message)
    }

    /// Shorthand for a medium-severity validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, Severity::Medium, message)
    }

    /// Shorthand for a high-severity authentication error.
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Authentication, Severity::High, message)
    }

    /// Error domain.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Error severity.
    pub fn severity(&self) -> Severity {
        self.severity
    }

    /// Human-readable message, without the cause.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// When the error was constructed.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Whether the operation that produced this error may be retried.
    pub fn retryable(&self) -> bool {
        self.retryable
    }

    /// Display form of the underlying cause, if any.
    pub fn cause_message(&self) -> Option<String> {
        self.cause.as_ref().map(ToString::to_string)
    }
}

impl fmt::Debug for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppError")
            .field("kind", &self.kind)
            .field("severity", &self.severity)
            .field("message", &self.message)
            .field("cause", &self.cause_message())
            .field("retryable", &self.retryable)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)?;
        if let Some(cause) = &self.cause {
            write!(f, ": {cause}")?;
        }
        Ok(())
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|c| c as &(dyn std::error::Error + 'static))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_and_auth_never_retryable() {
        for severity in [Severity::Low, Severity::Medium, Severity::High] {
            assert!(!is_retryable(ErrorKind::Config, severity));
            assert!(!is_retryable(ErrorKind::Authentication, severity));
        }
    }

    #[test]
    fn critical_never_retryable() {
        for kind in ErrorKind::ALL {
            assert!(!is_retryable(kind, Severity::Critical), "{kind}");
        }
    }

    #[test]
    fn transport_kinds_retryable_below_critical() {
        for kind in [ErrorKind::Network, ErrorKind::System, ErrorKind::Protocol] {
            assert!(is_retryable(kind, Severity::Medium));
            assert!(is_retryable(kind, Severity::High));
        }
    }

    #[test]
    fn data_validation_unknown_not_retryable() {
        for kind in [ErrorKind::Data, ErrorKind::Validation, ErrorKind::Unknown] {
            assert!(!is_retryable(kind, Severity::Low));
        }
    }

    #[test]
    fn retryable_fixed_at_construction() {
        let err = AppError::network("dial failed");
        assert!(err.retryable());
        let err = AppError::authentication("bad secret");
        assert!(!err.retryable());
    }

    #[test]
    fn display_includes_cause() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = AppError::wrap(ErrorKind::Network, Severity::Medium, "dial", io);
        assert_eq!(err.to_string(), "[network] dial: refused");
        assert_eq!(err.cause_message().as_deref(), Some("refused"));
    }

    #[test]
    fn source_exposes_cause() {
        use std::error::Error as _;
        let err = AppError::wrap(ErrorKind::Data, Severity::Low, "encode", "boom");
        assert_eq!(err.source().map(ToString::to_string).as_deref(), Some("boom"));
        assert!(AppError::validation("x").source().is_none());
    }

    #[test]
    fn severity_ordering() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::High < Severity::Critical);
    }

    #[test]
    fn kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::Authentication).unwrap();
        assert_eq!(json, "\"authentication\"");
    }
}
