//! Helpers for joining terminating tasks

use tokio::task::JoinError;

/// Unwraps the output of a finished task.
///
/// Returns `None` if the task was cancelled, and resumes unwinding if the
/// task panicked.
pub(crate) fn propagate_panics<T>(result: Result<T, JoinError>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(err) if err.is_cancelled() => None,
        // Propagate panics
        Err(err) if err.is_panic() => {
            std::panic::panic_any(err.into_panic());
        }
        Err(err) => {
            panic!("Unexpected join error (other than panic or cancellation): {err}");
        }
    }
}
