use crate::signature::InvokeMode;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum BindError {
    #[error("'{name}' has no resolvable member for {mode:?} access")]
    MemberNotFound { name: String, mode: InvokeMode },

    #[error("'{name}' is ambiguous: {candidates} equally valid candidates")]
    AmbiguousMember { name: String, candidates: usize },

    #[error("access to '{name}' is denied: {reason}")]
    AccessDenied { name: String, reason: String },

    #[error("{mode:?} is not a valid invocation mode for '{name}'")]
    InvalidInvocationMode { name: String, mode: InvokeMode },

    #[error("'{name}' expects {expected} argument(s), got {actual}")]
    InvalidArgumentCount {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("unsupported target type: {0}")]
    UnsupportedTargetType(String),

    #[error("target does not support this capability: {0}")]
    CapabilityNotSupported(String),

    /// An exception raised by host code behind a successfully resolved member.
    /// Never reinterpreted as a binding failure; propagates verbatim.
    #[error("host invocation fault: {0}")]
    HostFault(String),
}

/// Compact representation of a failed resolution, suitable for caching.
///
/// Cached failures must not pay exception-construction cost until actually
/// surfaced, so the cache stores this and [`FailureReason::surface`] builds
/// the real [`BindError`] on demand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    NotFound,
    Ambiguous { candidates: usize },
    Blocked { detail: String },
    BadArgumentCount { expected: usize, actual: usize },
}

impl FailureReason {
    pub fn surface(&self, name: &str, mode: InvokeMode) -> BindError {
        match self {
            FailureReason::NotFound => BindError::MemberNotFound {
                name: name.to_string(),
                mode,
            },
            FailureReason::Ambiguous { candidates } => BindError::AmbiguousMember {
                name: name.to_string(),
                candidates: *candidates,
            },
            FailureReason::Blocked { detail } => BindError::AccessDenied {
                name: name.to_string(),
                reason: detail.clone(),
            },
            FailureReason::BadArgumentCount { expected, actual } => {
                BindError::InvalidArgumentCount {
                    name: name.to_string(),
                    expected: *expected,
                    actual: *actual,
                }
            }
        }
    }
}
