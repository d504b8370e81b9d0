//! Cancellation contexts and progress reporting.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::messages::ProgressMessage;

/// Cancellation signal for one operation, optionally bounded by a deadline.
///
/// Cloning shares the signal. [`CancellationContext::child`] derives a context
/// that is cancelled along with its parent but can also be cancelled on its own.
#[derive(Debug, Clone, Default)]
pub struct CancellationContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl CancellationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: Some(Instant::now() + timeout),
        }
    }

    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Resolves once cancelled or past the deadline.
    pub async fn cancelled(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.token.cancelled().await,
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// Receives progress notifications for a request.
pub trait ProgressSink: Send + Sync {
    fn report(&self, progress: &ProgressMessage);
}

impl<F> ProgressSink for F
where
    F: Fn(&ProgressMessage) + Send + Sync,
{
    fn report(&self, progress: &ProgressMessage) {
        self(progress)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProgress;

impl ProgressSink for NoopProgress {
    fn report(&self, _progress: &ProgressMessage) {}
}

/// Forwards progress to `tracing` at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingProgress;

impl ProgressSink for TracingProgress {
    fn report(&self, progress: &ProgressMessage) {
        tracing::debug!(
            step = progress.step,
            max_step = progress.max_step,
            "{}",
            progress.message
        );
    }
}
