//! Shared error-kind taxonomy. The rest of the system
//! dispatches on `ErrorKind`, not on the specific transport error, so the
//! pipeline's retry/drop policy in `pipeline.rs` is independent of whether
//! the underlying failure came from `kube` or the in-memory fake store.

use snafu::Snafu;

/// The disposition-relevant classification of a store failure.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// Network/apiserver hiccup; safe to retry with backoff.
    Transient,
    /// `generateName` collision on create; safe to retry with a fresh name.
    Conflict,
    /// The object is gone; informers will resync, no action needed.
    NotFound,
    /// RBAC denied the call; logged once per minute, never retried.
    PermissionDenied,
    /// The object failed server-side validation; never retried.
    Invalid,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Conflict => "conflict",
            ErrorKind::NotFound => "not-found",
            ErrorKind::PermissionDenied => "permission-denied",
            ErrorKind::Invalid => "invalid",
        }
    }
}

/// A store-layer error: a classification plus the underlying cause.
#[derive(Debug, Snafu)]
#[snafu(display("{kind:?} store error: {message}"))]
pub struct StoreError {
    pub kind: ErrorKind,
    pub message: String,
}

impl StoreError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        StoreError {
            kind,
            message: message.into(),
        }
    }

    /// Classifies a `kube::Error` using the HTTP status code the apiserver
    /// returned, falling back to `Transient` for transport-level failures
    /// (connection reset, DNS, TLS).
    pub fn from_kube(err: kube::Error) -> Self {
        let message = err.to_string();
        let kind = match &err {
            kube::Error::Api(resp) => match resp.code {
                404 => ErrorKind::NotFound,
                409 => ErrorKind::Conflict,
                401 | 403 => ErrorKind::PermissionDenied,
                400 | 422 => ErrorKind::Invalid,
                _ => ErrorKind::Transient,
            },
            _ => ErrorKind::Transient,
        };
        StoreError::new(kind, message)
    }
}

/// A fixed vocabulary of drop/reason tokens recorded on metrics, so a
/// dropped-event metric is always labeled from a known, bounded set.
pub mod reason {
    pub const SOURCE_DISABLED: &str = "source_disabled";
    pub const SEVERITY: &str = "severity";
    pub const EVENT_TYPE: &str = "event_type";
    pub const NAMESPACE: &str = "namespace";
    pub const KIND: &str = "kind";
    pub const CATEGORY: &str = "category";
    pub const RULE: &str = "rule";
    pub const EXPRESSION: &str = "expression";
    pub const FINGERPRINT: &str = "fingerprint";
    pub const KEY: &str = "key";
    pub const RATE_LIMIT: &str = "rate_limit";
    pub const QUEUE_FULL: &str = "queue_full";
    pub const INVALID: &str = "invalid";
    pub const TRANSIENT_EXHAUSTED: &str = "transient_exhausted";
}
