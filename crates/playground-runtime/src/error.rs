//! Runtime error types.

use thiserror::Error;

/// Context-level failure. Session failures are [`playground_core::SessionError`].
#[derive(Debug, Error)]
pub enum ContextError {
    /// The sandbox environment could not be installed. Fatal for the context.
    #[error("InterceptorError: {0}")]
    Interceptor(String),
    #[error("Failed to spawn context thread: {0}")]
    Spawn(#[from] std::io::Error),
    /// The context thread is gone.
    #[error("Execution context closed")]
    Closed,
}

impl From<mlua::Error> for ContextError {
    fn from(err: mlua::Error) -> Self {
        Self::Interceptor(describe(&err))
    }
}

/// Failure converting an interpreter value into a host structure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MarshalError {
    #[error("cannot marshal a cyclic table")]
    Cycle,
    #[error("table nesting exceeds {0} levels")]
    TooDeep(usize),
    #[error("cannot marshal a value of type {0}")]
    Unsupported(&'static str),
    #[error("cannot marshal non-finite number")]
    NonFinite,
    #[error("{0}")]
    Json(String),
}

/// Human-readable message for an interpreter error, without traceback.
pub(crate) fn describe(err: &mlua::Error) -> String {
    match err {
        mlua::Error::CallbackError { cause, .. } => describe(cause),
        mlua::Error::RuntimeError(message)
        | mlua::Error::MemoryError(message)
        | mlua::Error::SyntaxError { message, .. } => strip_traceback(message).to_string(),
        mlua::Error::ExternalError(inner) => inner.to_string(),
        other => other.to_string(),
    }
}

fn strip_traceback(message: &str) -> &str {
    message
        .split_once("\nstack traceback:")
        .map_or(message, |(head, _)| head)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_describe_unwraps_callback_errors() {
        let err = mlua::Error::CallbackError {
            traceback: "stack traceback:\n\t[C]: in ?".to_string(),
            cause: Arc::new(mlua::Error::runtime("boom")),
        };
        assert_eq!(describe(&err), "boom");
    }

    #[test]
    fn test_describe_strips_traceback() {
        let err = mlua::Error::RuntimeError(
            "user:1: boom\nstack traceback:\n\t[C]: in function 'error'".to_string(),
        );
        assert_eq!(describe(&err), "user:1: boom");
    }

    #[test]
    fn test_describe_external() {
        let err = mlua::Error::external(MarshalError::Cycle);
        assert_eq!(describe(&err), "cannot marshal a cyclic table");
    }

    #[test]
    fn test_interceptor_display() {
        let err = ContextError::from(mlua::Error::runtime("no env"));
        assert_eq!(err.to_string(), "InterceptorError: no env");
    }
}
