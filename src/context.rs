//! Request-scoped execution context.
//!
//! A `RequestContext` travels with one tool call through pool acquisition and
//! statement execution. It carries the absolute deadline and the cancellation
//! token; both suspension points observe them.

use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

#[derive(Debug, Clone)]
pub struct RequestContext {
    request_id: String,
    deadline: Instant,
    cancel: CancellationToken,
}

impl RequestContext {
    /// Create a context whose deadline is `timeout` from now.
    pub fn new(timeout: Duration) -> Self {
        Self::with_cancellation(timeout, CancellationToken::new())
    }

    /// Create a context tied to an externally owned cancellation token.
    pub fn with_cancellation(timeout: Duration, cancel: CancellationToken) -> Self {
        Self {
            request_id: generate_request_id(),
            deadline: Instant::now() + timeout,
            cancel,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time left before the deadline (zero once it has passed).
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Bound `limit` by the time left on the request.
    pub fn bound(&self, limit: Duration) -> Duration {
        limit.min(self.remaining())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the request is cancelled.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// Cancel the request; in-flight work observes it at the next suspension point.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

fn generate_request_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bound_never_exceeds_remaining() {
        let ctx = RequestContext::new(Duration::from_millis(50));
        assert!(ctx.bound(Duration::from_secs(30)) <= Duration::from_millis(50));
        assert_eq!(
            ctx.bound(Duration::from_millis(1)),
            Duration::from_millis(1)
        );
    }

    #[tokio::test]
    async fn test_expiry() {
        let ctx = RequestContext::new(Duration::from_millis(20));
        assert!(!ctx.is_expired());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(ctx.is_expired());
        assert_eq!(ctx.remaining(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_cancellation_is_shared_with_token() {
        let token = CancellationToken::new();
        let ctx = RequestContext::with_cancellation(Duration::from_secs(1), token.clone());
        assert!(!ctx.is_cancelled());
        token.cancel();
        assert!(ctx.is_cancelled());
        ctx.cancelled().await;
    }

    #[test]
    fn test_request_ids_are_unique() {
        let a = RequestContext::new(Duration::from_secs(1));
        let b = RequestContext::new(Duration::from_secs(1));
        assert!(a.request_id().starts_with("req_"));
        assert_ne!(a.request_id(), b.request_id());
    }
}
