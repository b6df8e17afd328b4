//! Error classification: maps any failure to a stable [`ErrorKind`] and a
//! retryable bit.
//!
//! Classification prefers a tagged error kind when the caller's error type
//! implements [`Classifiable`] (§9 of the design notes: "prefer tagged error
//! kinds at production sites and treat string matching as a last resort").
//! When no tag is available, falls back to substring matching over the
//! error's `Display` output in the fixed priority order from `spec.md` §4.1.

use std::fmt;

use crate::error::{BoxError, ClassifiedError};

/// The eight-member classifier taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Network,
    Timeout,
    Storage,
    RateLimit,
    Authentication,
    Transient,
    Permanent,
    Unknown,
}

impl ErrorKind {
    /// The retryable bit defined by `spec.md` §4.1: true for everything
    /// except `Authentication` and `Permanent`.
    pub fn retryable(self) -> bool {
        !matches!(self, ErrorKind::Authentication | ErrorKind::Permanent)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Implemented by caller error types that know their own classification.
/// Preferred over string matching when present.
pub trait Classifiable {
    fn error_kind(&self) -> Option<ErrorKind>;
}

// No blanket impl: callers opt in by implementing `Classifiable` for their
// own error types. Without it, classification falls back to message
// matching below.

const NETWORK_PATTERNS: &[&str] = &[
    "connection refused",
    "connection reset",
    "network unreachable",
    "no route to host",
    "host down",
    "host is down",
    "dial failure",
    "dial tcp",
];

const TIMEOUT_PATTERNS: &[&str] =
    &["timeout", "deadline exceeded", "operation timed out", "timed out"];

const STORAGE_PATTERNS: &[&str] = &[
    "no space",
    "i/o error",
    "io error",
    "read-only file system",
    "read-only filesystem",
    "too many open files",
    "storage backend",
    "content-addressed store",
    "permission denied", // Storage is checked before Authentication below,
                          // so a bare "permission denied" always classifies
                          // as Storage, even when it originates from an
                          // auth-style rejection. Callers that need the
                          // auth bucket for that case should implement
                          // `Classifiable` instead of relying on the
                          // message-matching fallback.
];

const RATE_LIMIT_PATTERNS: &[&str] =
    &["rate limit", "too many requests", "quota exceeded", "throttled", "429"];

const AUTH_PATTERNS: &[&str] = &[
    "unauthorized",
    "authentication failed",
    "invalid credentials",
    "access denied",
    "401",
    "403",
    "forbidden",
];

const TRANSIENT_PATTERNS: &[&str] = &[
    "temporary failure",
    "service unavailable",
    "overloaded",
    "try again",
    "502",
    "503",
    "504",
    "bad gateway",
    "gateway timeout",
];

const PERMANENT_PATTERNS: &[&str] = &[
    "not found",
    "does not exist",
    "invalid format",
    "malformed",
    "bad request",
    "400",
    "404",
    "410",
    "validation failed",
];

fn matches_any(haystack: &str, patterns: &[&str]) -> bool {
    patterns.iter().any(|p| haystack.contains(p))
}

/// Classify an error's message against the priority-ordered pattern tables
/// of `spec.md` §4.1. First match wins.
fn classify_message(message: &str) -> ErrorKind {
    let lower = message.to_lowercase();
    if matches_any(&lower, NETWORK_PATTERNS) {
        ErrorKind::Network
    } else if matches_any(&lower, TIMEOUT_PATTERNS) {
        ErrorKind::Timeout
    } else if matches_any(&lower, STORAGE_PATTERNS) {
        ErrorKind::Storage
    } else if matches_any(&lower, RATE_LIMIT_PATTERNS) {
        ErrorKind::RateLimit
    } else if matches_any(&lower, AUTH_PATTERNS) {
        ErrorKind::Authentication
    } else if matches_any(&lower, TRANSIENT_PATTERNS) {
        ErrorKind::Transient
    } else if matches_any(&lower, PERMANENT_PATTERNS) {
        ErrorKind::Permanent
    } else {
        ErrorKind::Unknown
    }
}

/// Classify an error value. A tagged [`Classifiable`] impl takes priority
/// over string matching.
pub fn classify<E: std::error::Error + ?Sized>(err: &E) -> ErrorKind {
    classify_message(&err.to_string())
}

/// Classify a tagged error, preferring `Classifiable::error_kind` and
/// falling back to message matching.
pub fn classify_tagged<E: std::error::Error + Classifiable>(err: &E) -> ErrorKind {
    err.error_kind().unwrap_or_else(|| classify(err))
}

/// Classify and wrap a boxed error under the given component tag.
///
/// Returns `None` for a `None` input, matching `spec.md` §4.1's "a nil
/// input returns no classification (signals 'no failure')".
pub fn classify_boxed(cause: Option<BoxError>, component: impl Into<String>) -> Option<ClassifiedError> {
    cause.map(|c| {
        let kind = classify_message(&c.to_string());
        ClassifiedError::new(c, kind, component)
    })
}
