use std::sync::Arc;

use crate::backend::BackendError;

pub type RetryPredicate = Arc<dyn Fn(&BackendError) -> bool + Send + Sync>;

pub type ErrorHook = Arc<dyn Fn(&BackendError, &str) + Send + Sync>;

const RETRYABLE_MESSAGE_MARKERS: &[&str] = &[
    "overloaded",
    "rate_limit",
    "rate limit",
    "capacity",
    "429",
    "503",
    "timeout",
    "unavailable",
];

pub fn always_retry() -> RetryPredicate {
    Arc::new(|_: &BackendError| true)
}

pub fn retryable_by_status() -> RetryPredicate {
    Arc::new(is_transient)
}

pub fn is_transient(error: &BackendError) -> bool {
    match error {
        BackendError::Aborted => false,
        BackendError::Unavailable(_) | BackendError::Timeout(_) => true,
        BackendError::Status { status, message } => {
            matches!(status, 408 | 409 | 429) || *status >= 500 || has_retryable_marker(message)
        }
        BackendError::InvalidResponse(message) => has_retryable_marker(message),
    }
}

fn has_retryable_marker(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    RETRYABLE_MESSAGE_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
}
