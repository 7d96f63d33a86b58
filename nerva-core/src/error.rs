use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Classification of every error the kernel can surface.
///
/// Infrastructure errors (`Validation`, `NotFound`, `Forbidden`, `QueueFull`,
/// `BuildError`) are returned in `Result`s and never thrown across the
/// kernel boundary. `HandlerError` wraps failures inside route handlers;
/// `Timeout` is emitted by the response correlator as a synthetic response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed message, path, pattern, or options. Never retried.
    Validation,
    /// No route, subsystem, principal, channel, or pending entry.
    NotFound,
    /// Authorisation denied by rights-with-scope or channel membership.
    Forbidden,
    /// Destination queue cannot accept right now.
    QueueFull,
    /// A pending response expired before a reply arrived.
    Timeout,
    /// A route handler failed; the original error is kept as the cause.
    HandlerError,
    /// Facet dependency unresolved, cycle, contract violation, or init
    /// failure. Triggers transactional rollback of the build.
    BuildError,
    /// Invariant violation inside the kernel itself.
    Internal,
}

impl ErrorKind {
    /// The wire name of this kind (`snake_case`, matching serde).
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::QueueFull => "queue_full",
            ErrorKind::Timeout => "timeout",
            ErrorKind::HandlerError => "handler_error",
            ErrorKind::BuildError => "build_error",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error type carried through every kernel operation.
///
/// Serializes as `{ "kind": "...", "message": "...", "cause": {...}? }` so a
/// failure can travel inside a [`SendResult`] without losing its chain.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KernelError {
    kind: ErrorKind,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    cause: Option<Box<KernelError>>,
}

impl KernelError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
        }
    }

    /// Wrap `cause` under a new error, preserving the chain.
    pub fn with_cause(kind: ErrorKind, message: impl Into<String>, cause: KernelError) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: Some(Box::new(cause)),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Forbidden, message)
    }

    pub fn queue_full(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::QueueFull, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn handler(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::HandlerError, message)
    }

    pub fn build(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BuildError, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn cause(&self) -> Option<&KernelError> {
        self.cause.as_deref()
    }

    /// The innermost error in the cause chain (`self` when there is none).
    pub fn root_cause(&self) -> &KernelError {
        let mut current = self;
        while let Some(cause) = current.cause() {
            current = cause;
        }
        current
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(cause) = &self.cause {
            write!(f, " (caused by: {})", cause)?;
        }
        Ok(())
    }
}

impl std::error::Error for KernelError {}

/// Uniform boundary envelope for kernel operations.
///
/// Every `send_protected` call answers with one of these; errors are data,
/// never panics, so callers on the far side of the kernel observe
/// `{ "success": false, "error": { "kind", "message" } }` rather than an
/// unwound stack.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SendResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<KernelError>,
}

impl SendResult {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(error: KernelError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    /// The error kind, when this is a failure.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind())
    }
}

impl From<Result<Value, KernelError>> for SendResult {
    fn from(result: Result<Value, KernelError>) -> Self {
        match result {
            Ok(data) => SendResult::ok(data),
            Err(err) => SendResult::failure(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_and_message() {
        let err = KernelError::not_found("no such route");
        assert_eq!(err.to_string(), "not_found: no such route");
    }

    #[test]
    fn display_includes_cause_chain() {
        let inner = KernelError::validation("bad segment");
        let outer = KernelError::with_cause(ErrorKind::HandlerError, "handler failed", inner);
        let text = outer.to_string();
        assert!(text.contains("handler_error: handler failed"));
        assert!(text.contains("caused by: validation: bad segment"));
    }

    #[test]
    fn root_cause_walks_chain() {
        let inner = KernelError::validation("bad");
        let mid = KernelError::with_cause(ErrorKind::HandlerError, "mid", inner);
        let outer = KernelError::with_cause(ErrorKind::Internal, "outer", mid);
        assert_eq!(outer.root_cause().kind(), ErrorKind::Validation);
    }

    #[test]
    fn send_result_serializes_error_envelope() {
        let result = SendResult::failure(KernelError::forbidden("denied"));
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"]["kind"], "forbidden");
        assert_eq!(json["error"]["message"], "denied");
        assert!(json.get("data").is_none());
    }

    #[test]
    fn send_result_from_ok() {
        let result: SendResult = Ok(serde_json::json!({"n": 1})).into();
        assert!(result.is_success());
        assert_eq!(result.data.unwrap()["n"], 1);
    }

    #[test]
    fn kind_round_trips_through_serde() {
        for kind in [
            ErrorKind::Validation,
            ErrorKind::QueueFull,
            ErrorKind::HandlerError,
        ] {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
            let back: ErrorKind = serde_json::from_str(&json).unwrap();
            assert_eq!(back, kind);
        }
    }
}
