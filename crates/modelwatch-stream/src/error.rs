use thiserror::Error;

use modelwatch_k8s::ApiError;

/// Reasons a streaming request is refused before anything is registered
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    #[error("Too many components requested (max {limit})")]
    TooManyComponents { requested: usize, limit: usize },

    #[error("Component names must not be empty")]
    EmptyComponent,
}

/// Text reported to clients in an ERROR event
pub(crate) fn error_message(err: &ApiError) -> String {
    if err.is_not_found() {
        format!("Resource not found: {}", err)
    } else {
        err.to_string()
    }
}
