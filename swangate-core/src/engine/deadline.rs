use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::ServerError;

/// Runs `on_abandon` on the runtime if dropped while still armed.
struct AbandonGuard<C, CF>
where
    C: FnOnce() -> CF,
    CF: Future<Output = ()> + Send + 'static,
{
    on_abandon: Option<C>,
}

impl<C, CF> AbandonGuard<C, CF>
where
    C: FnOnce() -> CF,
    CF: Future<Output = ()> + Send + 'static,
{
    fn disarm(&mut self) {
        self.on_abandon = None;
    }
}

impl<C, CF> Drop for AbandonGuard<C, CF>
where
    C: FnOnce() -> CF,
    CF: Future<Output = ()> + Send + 'static,
{
    fn drop(&mut self) {
        if let Some(on_abandon) = self.on_abandon.take() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(on_abandon());
            }
        }
    }
}

/// Drive `fut` to completion within `timeout`.
///
/// If the deadline elapses, or the returned future is dropped before `fut`
/// finishes, `on_abandon` is spawned (typically a PostgreSQL cancel request
/// for the connection running the statement).
pub async fn run_with_deadline<T, F, C, CF>(
    operation: &'static str,
    timeout: Duration,
    on_abandon: C,
    fut: F,
) -> Result<T, ServerError>
where
    F: Future<Output = Result<T, ServerError>>,
    C: FnOnce() -> CF,
    CF: Future<Output = ()> + Send + 'static,
{
    let mut guard = AbandonGuard {
        on_abandon: Some(on_abandon),
    };
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => {
            guard.disarm();
            result
        }
        Err(_) => {
            warn!(operation, ?timeout, "deadline exceeded, cancelling statement");
            Err(ServerError::DeadlineExceeded { operation, timeout })
        }
    }
}
