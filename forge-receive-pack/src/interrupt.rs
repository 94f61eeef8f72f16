//! Cancellation points for the request-scoped cancellation token.
//!
//! The request's [`CancellationToken`] is the single cancellation root of a push. Long-running
//! stages call [`CancellationPoint::check`] between steps so that a disconnected client stops
//! guard evaluation and repository writes as early as possible.

use tokio_util::sync::CancellationToken;

/// Trait for types that can check for cancellation and return an error if cancelled.
pub trait CancellationPoint {
    /// Check for cancellation and return [`crate::Error::Cancelled`] if it was requested.
    fn check(&self) -> Result<(), crate::Error>;
}

impl CancellationPoint for CancellationToken {
    fn check(&self) -> Result<(), crate::Error> {
        if self.is_cancelled() {
            Err(crate::Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Run `fut` to completion unless `token` fires first, in which case `Error::Cancelled` is returned.
pub async fn or_cancelled<T>(
    token: &CancellationToken,
    fut: impl std::future::Future<Output = Result<T, crate::Error>>,
) -> Result<T, crate::Error> {
    tokio::select! {
        biased;
        () = token.cancelled() => Err(crate::Error::Cancelled),
        res = fut => res,
    }
}
