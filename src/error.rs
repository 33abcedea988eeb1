//! Error kinds shared by every coordination primitive in this crate.

use std::fmt;

/// A type-erased panic payload captured from a user callable.
///
/// `std::panic::catch_unwind` hands back `Box<dyn Any + Send>`, which is not
/// `Display`/`Error` on its own; this wraps it with a best-effort message so
/// it can ride inside [`CoordinationError::TaskFailed`].
pub struct PanicPayload {
    message: String,
}

impl PanicPayload {
    pub fn from_any(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self { message }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Debug for PanicPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PanicPayload")
            .field("message", &self.message)
            .finish()
    }
}

impl fmt::Display for PanicPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// The single error enum surfaced by every primitive in this crate.
///
/// Mirrors the semantic error kinds of the design: a waited-for condition
/// never arrived in time, a mutation landed on a closed collection, a
/// release was attempted without a matching acquire, or a user callable
/// failed.
#[derive(Debug, thiserror::Error)]
pub enum CoordinationError {
    /// A `timeout` deadline elapsed before the waited-for condition held.
    #[error("operation timed out")]
    Timeout,

    /// A mutating call landed on a deque or task queue that is closed.
    #[error("queue is closed")]
    QueueClosed,

    /// A release was attempted without the matching acquire (shared or
    /// exclusive) held by the calling thread.
    #[error("invalid lock state: {0}")]
    InvalidState(&'static str),

    /// A user-supplied callable (task body, job function, alarm callback)
    /// panicked or returned an error; the original payload is preserved.
    #[error("task failed: {0}")]
    TaskFailed(#[from] TaskFailure),
}

/// The captured failure of a user callable: either a propagated panic or a
/// plain boxed error returned by the callable itself.
#[derive(Debug)]
pub enum TaskFailure {
    Panicked(PanicPayload),
    Failed(Box<dyn std::error::Error + Send + Sync>),
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskFailure::Panicked(p) => write!(f, "panicked: {p}"),
            TaskFailure::Failed(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for TaskFailure {}

pub type Result<T> = std::result::Result<T, CoordinationError>;
