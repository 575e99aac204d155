//! User-facing operations.
//!
//! Every public method follows the same template: begin a transaction,
//! compose entity operations, commit on success and roll back on any error
//! path. Rollback failures are logged and never mask the operation's own
//! error.

use bytes::Bytes;
use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::metrics;
use crate::offset::Offset;
use crate::pubsub::{Message, MessageId, Pubsub, Snapshot, Subscription, Topic, Transaction};
use crate::store::{self, KvStore};

/// Default batch limit when a pull request does not name one.
pub const DEFAULT_PULL_LIMIT: usize = 256;

/// Parameters of one pull.
#[derive(Debug, Clone)]
pub struct PullRequest {
    pub topic: String,

    pub subscription: String,

    /// Upper bound on returned messages.
    pub limit: usize,

    /// Move `acked` together with `sent`.
    pub auto_ack: bool,

    /// Explicit resume point in decimal `"ts-index"` form; when absent the
    /// pull resumes after the subscription's `acked` cursor.
    pub offset: Option<String>,
}

/// One delivered message.
#[derive(Debug, Clone)]
pub struct PulledMessage {
    pub id: MessageId,
    pub payload: Bytes,
}

/// The service facade over the engine. Cheap to share behind an `Arc`; all
/// per-operation state lives in the transaction.
#[derive(Debug)]
pub struct Service<S> {
    pubsub: Pubsub<S>,
}

impl<S: KvStore> Service<S> {
    pub fn new(store: S) -> Self {
        Self {
            pubsub: Pubsub::new(store),
        }
    }

    /// Get-or-create a topic and return its full record.
    pub async fn create_topic(&self, name: &str) -> Result<Topic> {
        let _timer = metrics::global()
            .topics
            .with_label_values(&["create"])
            .start_timer();

        let mut txn = self.pubsub.begin().await?;
        let res = txn.create_topic(name).await.map_err(Error::from);
        finish(txn, res).await
    }

    /// Strict lookup.
    pub async fn topic(&self, name: &str) -> Result<Topic> {
        let _timer = metrics::global()
            .topics
            .with_label_values(&["get"])
            .start_timer();

        let mut txn = self.pubsub.begin().await?;
        let res = txn.get_topic(name).await.map_err(Error::from);
        finish(txn, res).await
    }

    /// Delete a topic and schedule removal of its messages. Repeating the
    /// call on a missing topic surfaces the underlying not-found.
    pub async fn destroy(&self, name: &str) -> Result<()> {
        let _timer = metrics::global()
            .topics
            .with_label_values(&["destroy"])
            .start_timer();

        let mut txn = self.pubsub.begin().await?;
        let res = txn.delete_topic(name).await.map_err(Error::from);
        finish(txn, res).await
    }

    /// Publish a batch; returned ids are in input order and strictly
    /// ascending within the batch.
    pub async fn publish(&self, topic: &str, payloads: Vec<Bytes>) -> Result<Vec<String>> {
        let _timer = metrics::global()
            .messages
            .with_label_values(&["publish"])
            .start_timer();
        metrics::global()
            .message_size
            .with_label_values(&["publish"])
            .observe(payloads.iter().map(Bytes::len).sum::<usize>() as f64);

        let mut txn = self.pubsub.begin().await?;
        let res = async {
            let t = txn.get_topic(topic).await?;
            let messages: Vec<_> = payloads.into_iter().map(Message::new).collect();
            let ids = txn.append(&t, &messages).await?;
            Ok(ids.iter().map(|id| id.to_string()).collect())
        }
        .await;
        finish(txn, res).await
    }

    /// Set the subscription's `acked` cursor to `msgid`, monotonic or not;
    /// callers own cursor discipline.
    pub async fn ack(&self, topic: &str, subscription: &str, msgid: &str) -> Result<()> {
        let _timer = metrics::global()
            .messages
            .with_label_values(&["ack"])
            .start_timer();

        let offset: Offset = msgid.parse()?;

        let mut txn = self.pubsub.begin().await?;
        let res = async {
            let t = txn.get_topic(topic).await?;
            let mut sub = txn.get_subscription(&t, subscription).await?;
            sub.acked = offset;
            txn.update_subscription(&t, &sub).await?;
            Ok(())
        }
        .await;
        finish(txn, res).await
    }

    /// Get-or-create a subscription on an existing topic.
    pub async fn subscribe(&self, topic: &str, subscription: &str) -> Result<Subscription> {
        let _timer = metrics::global()
            .subscriptions
            .with_label_values(&["subscribe"])
            .start_timer();

        let mut txn = self.pubsub.begin().await?;
        let res = async {
            let t = txn.get_topic(topic).await?;
            Ok(txn.create_subscription(&t, subscription).await?)
        }
        .await;
        finish(txn, res).await
    }

    pub async fn unsubscribe(&self, topic: &str, subscription: &str) -> Result<()> {
        let _timer = metrics::global()
            .subscriptions
            .with_label_values(&["unsubscribe"])
            .start_timer();

        let mut txn = self.pubsub.begin().await?;
        let res = async {
            let t = txn.get_topic(topic).await?;
            txn.delete_subscription(&t, subscription).await?;
            Ok(())
        }
        .await;
        finish(txn, res).await
    }

    /// One non-blocking pull.
    ///
    /// Delivery starts strictly after the request offset when one is given,
    /// otherwise strictly after the subscription's `acked` cursor. A
    /// non-empty result advances `sent` (and `acked` under `auto_ack`) to
    /// the last delivered offset before committing.
    pub async fn pull(&self, req: &PullRequest) -> Result<Vec<PulledMessage>> {
        let _timer = metrics::global()
            .messages
            .with_label_values(&["pull"])
            .start_timer();

        let begin = match req.offset.as_deref() {
            Some(raw) if !raw.is_empty() => Some(raw.parse::<Offset>()?),
            _ => None,
        };

        let mut txn = self.pubsub.begin().await?;
        let res = pull_in_txn(&mut txn, req, begin).await;
        finish(txn, res).await
    }

    /// Get-or-create a named replay point from the subscription's current
    /// cursor.
    pub async fn create_snapshot(
        &self,
        topic: &str,
        subscription: &str,
        name: &str,
    ) -> Result<Snapshot> {
        let _timer = metrics::global()
            .snapshots
            .with_label_values(&["create"])
            .start_timer();

        let mut txn = self.pubsub.begin().await?;
        let res = async {
            let t = txn.get_topic(topic).await?;
            let sub = txn.get_subscription(&t, subscription).await?;
            Ok(txn.create_snapshot(&t, &sub, name).await?)
        }
        .await;
        finish(txn, res).await
    }

    pub async fn get_snapshot(
        &self,
        topic: &str,
        subscription: &str,
        name: &str,
    ) -> Result<Snapshot> {
        let _timer = metrics::global()
            .snapshots
            .with_label_values(&["get"])
            .start_timer();

        let mut txn = self.pubsub.begin().await?;
        let res = async {
            let t = txn.get_topic(topic).await?;
            let sub = txn.get_subscription(&t, subscription).await?;
            Ok(txn.get_snapshot(&t, &sub, name).await?)
        }
        .await;
        finish(txn, res).await
    }

    pub async fn delete_snapshot(
        &self,
        topic: &str,
        subscription: &str,
        name: &str,
    ) -> Result<()> {
        let _timer = metrics::global()
            .snapshots
            .with_label_values(&["delete"])
            .start_timer();

        let mut txn = self.pubsub.begin().await?;
        let res = async {
            let t = txn.get_topic(topic).await?;
            let sub = txn.get_subscription(&t, subscription).await?;
            txn.delete_snapshot(&t, &sub, name).await?;
            Ok(())
        }
        .await;
        finish(txn, res).await
    }

    /// Rewind (or fast-forward) the subscription to the cursor stored in the
    /// named snapshot; returns the updated subscription.
    pub async fn seek(
        &self,
        topic: &str,
        subscription: &str,
        snapshot: &str,
    ) -> Result<Subscription> {
        let _timer = metrics::global()
            .subscriptions
            .with_label_values(&["seek"])
            .start_timer();

        let mut txn = self.pubsub.begin().await?;
        let res = async {
            let t = txn.get_topic(topic).await?;
            let mut sub = txn.get_subscription(&t, subscription).await?;
            let snap = txn.get_snapshot(&t, &sub, snapshot).await?;

            sub.sent = snap.subscription.sent;
            sub.acked = snap.subscription.acked;
            txn.update_subscription(&t, &sub).await?;

            debug!(
                topic,
                subscription,
                snapshot,
                acked = %sub.acked,
                "seeked subscription",
            );

            Ok(sub)
        }
        .await;
        finish(txn, res).await
    }
}

async fn pull_in_txn<T: store::KvTransaction>(
    txn: &mut Transaction<T>,
    req: &PullRequest,
    begin: Option<Offset>,
) -> Result<Vec<PulledMessage>> {
    let t = txn.get_topic(&req.topic).await?;
    let mut sub = txn.get_subscription(&t, &req.subscription).await?;

    let begin = begin.unwrap_or(sub.acked);
    let start = begin
        .next()
        .ok_or_else(|| Error::Internal("offset index overflow".to_owned()))?;

    let mut messages = Vec::new();
    txn.scan(&t, start, |offset, message| {
        if messages.len() >= req.limit {
            return false;
        }
        messages.push(PulledMessage {
            id: MessageId(offset),
            payload: message.payload,
        });
        messages.len() < req.limit
    })
    .await?;

    if let Some(last) = messages.last() {
        sub.sent = last.id.0;
        if req.auto_ack {
            sub.acked = last.id.0;
        }
        txn.update_subscription(&t, &sub).await?;
    }

    Ok(messages)
}

/// Commit on success, roll back on error. The rollback path tolerates the
/// "already finished" report and logs anything else without replacing the
/// original error.
async fn finish<T, V>(mut txn: Transaction<T>, res: Result<V>) -> Result<V>
where
    T: store::KvTransaction,
{
    match res {
        Ok(value) => {
            txn.commit().await.map_err(Error::from)?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = txn.rollback().await {
                if !matches!(rollback_err, store::Error::Finished) {
                    error!(%rollback_err, "rollback failed");
                }
            }
            Err(err)
        }
    }
}
