//! Long-poll wrapper around [`Service::pull`].
//!
//! Turns an empty pull into a blocking wait: retry on a fixed cadence until
//! messages arrive or the deadline passes. Every retry is its own
//! transaction, so a non-empty batch has already moved the subscription
//! cursor by the time it is returned; there is nothing to deduplicate across
//! retries. Dropping the returned future (client disconnect) stops the loop
//! at its next await point.

use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

use crate::error::Result;
use crate::service::{PullRequest, PulledMessage, Service};
use crate::store::KvStore;

/// Pause between empty pulls.
const RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Pull, waiting up to `timeout` for the first non-empty batch.
///
/// Errors from the underlying pull abort the wait immediately; an exhausted
/// deadline yields the (empty) last result.
pub async fn pull_wait<S: KvStore>(
    service: &Service<S>,
    req: &PullRequest,
    timeout: Duration,
) -> Result<Vec<PulledMessage>> {
    let deadline = Instant::now() + timeout;

    loop {
        let messages = service.pull(req).await?;
        if !messages.is_empty() {
            return Ok(messages);
        }

        let now = Instant::now();
        if now >= deadline {
            return Ok(messages);
        }

        trace!(
            topic = req.topic.as_str(),
            subscription = req.subscription.as_str(),
            "empty pull, retrying",
        );
        tokio::time::sleep(RETRY_INTERVAL.min(deadline - now)).await;
    }
}
