use bytes::Bytes;
use chrono::Utc;
use tracing::debug;
use uuid::Uuid;

use crate::keys;
use crate::offset::Offset;
use crate::store::{KvTransaction, Result as StoreResult};

use super::{Error, Message, MessageId, Result, Snapshot, Subscription, Topic};

/// Pairs fetched per round trip while iterating a prefix.
const SCAN_BATCH: usize = 256;

/// One engine transaction. Wraps a KV transaction for its whole lifetime;
/// entity operations borrow it per call and buffer through the store's write
/// set, so nothing is visible before [`Transaction::commit`].
#[derive(Debug)]
pub struct Transaction<T> {
    txn: T,
}

impl<T: KvTransaction> Transaction<T> {
    pub(super) fn new(txn: T) -> Self {
        Self { txn }
    }

    /// Start timestamp of the wrapped KV transaction. Doubles as the `ts`
    /// component of offsets minted by [`Transaction::append`].
    pub fn start_ts(&self) -> i64 {
        self.txn.start_ts()
    }

    pub async fn commit(&mut self) -> StoreResult<()> {
        self.txn.commit().await
    }

    pub async fn rollback(&mut self) -> StoreResult<()> {
        self.txn.rollback().await
    }

    // === Topics ===

    /// Get-or-create: an existing record is returned unchanged, otherwise a
    /// fresh one with a new object-id is written.
    pub async fn create_topic(&mut self, name: &str) -> Result<Topic> {
        let key = keys::topic(name);
        if let Some(buf) = self.txn.get(&key).await? {
            return Ok(serde_json::from_slice(&buf)?);
        }

        let topic = Topic {
            name: name.to_owned(),
            object_id: Uuid::new_v4(),
            created_at: Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX),
        };
        self.txn.set(key, serde_json::to_vec(&topic)?).await?;

        debug!(topic = name, object_id = %topic.object_id, "created topic");

        Ok(topic)
    }

    pub async fn get_topic(&mut self, name: &str) -> Result<Topic> {
        let buf = self
            .txn
            .get(&keys::topic(name))
            .await?
            .ok_or(Error::TopicNotFound)?;
        Ok(serde_json::from_slice(&buf)?)
    }

    /// Removes the topic record and schedules removal of every message under
    /// its prefix. Subscriptions and snapshots are not cascaded; with the
    /// topic record gone they are unreachable.
    pub async fn delete_topic(&mut self, name: &str) -> Result<()> {
        let topic = self.get_topic(name).await?;
        self.txn
            .delete_range(&keys::message(&topic.object_id, None))
            .await?;
        self.txn.delete(&keys::topic(name)).await?;

        debug!(topic = name, object_id = %topic.object_id, "deleted topic");

        Ok(())
    }

    // === Subscriptions ===

    /// Get-or-create. A fresh subscription starts both cursors at
    /// `(start_ts, 0)`, i.e. at the head of what this transaction can see.
    pub async fn create_subscription(&mut self, topic: &Topic, name: &str) -> Result<Subscription> {
        let key = keys::subscription(&topic.object_id, Some(name));
        if let Some(buf) = self.txn.get(&key).await? {
            return Ok(serde_json::from_slice(&buf)?);
        }

        let initial = Offset::new(self.txn.start_ts(), 0);
        let sub = Subscription {
            name: name.to_owned(),
            sent: initial,
            acked: initial,
        };
        self.txn.set(key, serde_json::to_vec(&sub)?).await?;

        Ok(sub)
    }

    pub async fn get_subscription(&mut self, topic: &Topic, name: &str) -> Result<Subscription> {
        let buf = self
            .txn
            .get(&keys::subscription(&topic.object_id, Some(name)))
            .await?
            .ok_or(Error::SubscriptionNotFound)?;
        Ok(serde_json::from_slice(&buf)?)
    }

    /// Every subscription of the topic, in key (name) order.
    pub async fn subscriptions(&mut self, topic: &Topic) -> Result<Vec<Subscription>> {
        let prefix = keys::subscription(&topic.object_id, None);
        let mut subs = Vec::new();
        self.scan_range(prefix.clone(), prefix, |_key, value| {
            subs.push(serde_json::from_slice(value)?);
            Ok(true)
        })
        .await?;
        Ok(subs)
    }

    /// Unconditional overwrite of the full record; last writer within the
    /// snapshot-isolation discipline wins.
    pub async fn update_subscription(&mut self, topic: &Topic, sub: &Subscription) -> Result<()> {
        self.txn
            .set(
                keys::subscription(&topic.object_id, Some(&sub.name)),
                serde_json::to_vec(sub)?,
            )
            .await?;
        Ok(())
    }

    /// Snapshots under the subscription are not cascaded.
    pub async fn delete_subscription(&mut self, topic: &Topic, name: &str) -> Result<()> {
        self.txn
            .delete(&keys::subscription(&topic.object_id, Some(name)))
            .await?;
        Ok(())
    }

    // === Snapshots ===

    /// Get-or-create; snapshots are write-once, so re-creating an existing
    /// name returns the stored record untouched.
    pub async fn create_snapshot(
        &mut self,
        topic: &Topic,
        sub: &Subscription,
        name: &str,
    ) -> Result<Snapshot> {
        let key = keys::snapshot(&topic.object_id, &sub.name, Some(name));
        if let Some(buf) = self.txn.get(&key).await? {
            return Ok(serde_json::from_slice(&buf)?);
        }

        // A deep copy: the snapshot must not follow the live cursor.
        let snapshot = Snapshot {
            name: name.to_owned(),
            subscription: sub.clone(),
        };
        self.txn.set(key, serde_json::to_vec(&snapshot)?).await?;

        Ok(snapshot)
    }

    pub async fn get_snapshot(
        &mut self,
        topic: &Topic,
        sub: &Subscription,
        name: &str,
    ) -> Result<Snapshot> {
        let buf = self
            .txn
            .get(&keys::snapshot(&topic.object_id, &sub.name, Some(name)))
            .await?
            .ok_or(Error::SnapshotNotFound)?;
        Ok(serde_json::from_slice(&buf)?)
    }

    pub async fn snapshots(&mut self, topic: &Topic, sub: &Subscription) -> Result<Vec<Snapshot>> {
        let prefix = keys::snapshot(&topic.object_id, &sub.name, None);
        let mut snapshots = Vec::new();
        self.scan_range(prefix.clone(), prefix, |_key, value| {
            snapshots.push(serde_json::from_slice(value)?);
            Ok(true)
        })
        .await?;
        Ok(snapshots)
    }

    pub async fn delete_snapshot(
        &mut self,
        topic: &Topic,
        sub: &Subscription,
        name: &str,
    ) -> Result<()> {
        self.txn
            .delete(&keys::snapshot(&topic.object_id, &sub.name, Some(name)))
            .await?;
        Ok(())
    }

    // === Messages ===

    /// Append a batch. Message `i` lands at offset `(start_ts, i)`, so ids
    /// come back strictly ascending and in input order.
    pub async fn append(&mut self, topic: &Topic, messages: &[Message]) -> Result<Vec<MessageId>> {
        let ts = self.txn.start_ts();
        let mut ids = Vec::with_capacity(messages.len());

        for (i, message) in messages.iter().enumerate() {
            let offset = Offset::new(ts, i as i64);
            self.txn
                .set(
                    keys::message(&topic.object_id, Some(&offset)),
                    message.payload.to_vec(),
                )
                .await?;
            ids.push(MessageId(offset));
        }

        Ok(ids)
    }

    /// Walk messages from `start` (inclusive) in offset order, feeding each
    /// to `handler` until it returns `false` or the topic's range ends.
    ///
    /// Does not commit; the transaction stays open for the caller.
    pub async fn scan<F>(&mut self, topic: &Topic, start: Offset, mut handler: F) -> Result<()>
    where
        F: FnMut(Offset, Message) -> bool + Send,
    {
        let prefix = keys::message(&topic.object_id, None);
        let from = keys::message(&topic.object_id, Some(&start));
        let tag = prefix.len();

        self.scan_range(prefix, from, |key, value| {
            let offset = Offset::decode(&key[tag..]).map_err(|_| Error::MalformedKey)?;
            let message = Message {
                payload: Bytes::copy_from_slice(value),
            };
            Ok(handler(offset, message))
        })
        .await
    }

    /// Batched iteration from `start`, stopping at the end of `prefix` or
    /// when `f` returns `false`.
    async fn scan_range<F>(&mut self, prefix: Vec<u8>, start: Vec<u8>, mut f: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> Result<bool> + Send,
    {
        let mut from = start;
        loop {
            let batch = self.txn.scan(&from, SCAN_BATCH).await?;
            let exhausted = batch.len() < SCAN_BATCH;

            for pair in &batch {
                if !pair.key.starts_with(&prefix) {
                    return Ok(());
                }
                if !f(&pair.key, &pair.value)? {
                    return Ok(());
                }
            }

            if exhausted {
                return Ok(());
            }
            if let Some(last) = batch.last() {
                from = last.key.clone();
                // Smallest key strictly greater than the last one seen.
                from.push(0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_matches::assert_matches;

    use crate::pubsub::Pubsub;
    use crate::store::MemoryStore;

    fn engine() -> Pubsub<MemoryStore> {
        Pubsub::new(MemoryStore::new())
    }

    #[tokio::test]
    async fn test_create_topic_is_get_or_create() {
        let ps = engine();

        let mut txn = ps.begin().await.unwrap();
        let first = txn.create_topic("t").await.unwrap();
        txn.commit().await.unwrap();

        let mut txn = ps.begin().await.unwrap();
        let second = txn.create_topic("t").await.unwrap();
        txn.commit().await.unwrap();

        assert_eq!(first.object_id, second.object_id);
        assert_eq!(first.created_at, second.created_at);
    }

    #[tokio::test]
    async fn test_get_topic_not_found() {
        let ps = engine();
        let mut txn = ps.begin().await.unwrap();
        assert_matches!(txn.get_topic("missing").await, Err(Error::TopicNotFound));
    }

    #[tokio::test]
    async fn test_append_then_scan_in_order() {
        let ps = engine();

        let mut txn = ps.begin().await.unwrap();
        let topic = txn.create_topic("t").await.unwrap();
        let messages: Vec<_> = (0..5).map(|i| Message::new(format!("m{i}"))).collect();
        let ids = txn.append(&topic, &messages).await.unwrap();
        txn.commit().await.unwrap();

        assert_eq!(ids.len(), 5);
        for pair in ids.windows(2) {
            assert!(pair[0] < pair[1]);
        }

        let mut txn = ps.begin().await.unwrap();
        let mut seen = Vec::new();
        txn.scan(&topic, ids[0].0, |offset, message| {
            seen.push((offset, message.payload));
            true
        })
        .await
        .unwrap();

        assert_eq!(seen.len(), 5);
        for (i, (offset, payload)) in seen.iter().enumerate() {
            assert_eq!(*offset, ids[i].0);
            assert_eq!(payload, format!("m{i}").as_bytes());
        }
    }

    #[tokio::test]
    async fn test_scan_handler_stops_iteration() {
        let ps = engine();

        let mut txn = ps.begin().await.unwrap();
        let topic = txn.create_topic("t").await.unwrap();
        let messages: Vec<_> = (0..10).map(|i| Message::new(format!("m{i}"))).collect();
        let ids = txn.append(&topic, &messages).await.unwrap();
        txn.commit().await.unwrap();

        let mut txn = ps.begin().await.unwrap();
        let mut count = 0;
        txn.scan(&topic, ids[0].0, |_, _| {
            count += 1;
            count < 3
        })
        .await
        .unwrap();

        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn test_subscription_initial_cursor() {
        let ps = engine();

        let mut txn = ps.begin().await.unwrap();
        let topic = txn.create_topic("t").await.unwrap();
        let sub = txn.create_subscription(&topic, "s").await.unwrap();

        assert_eq!(sub.sent, Offset::new(txn.start_ts(), 0));
        assert_eq!(sub.acked, sub.sent);
    }

    #[tokio::test]
    async fn test_subscriptions_listed_in_order() {
        let ps = engine();

        let mut txn = ps.begin().await.unwrap();
        let topic = txn.create_topic("t").await.unwrap();
        for name in ["charlie", "alpha", "bravo"] {
            txn.create_subscription(&topic, name).await.unwrap();
        }
        txn.commit().await.unwrap();

        let mut txn = ps.begin().await.unwrap();
        let subs = txn.subscriptions(&topic).await.unwrap();
        let names: Vec<_> = subs.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "bravo", "charlie"]);
    }

    #[tokio::test]
    async fn test_snapshot_write_once() {
        let ps = engine();

        let mut txn = ps.begin().await.unwrap();
        let topic = txn.create_topic("t").await.unwrap();
        let mut sub = txn.create_subscription(&topic, "s").await.unwrap();
        let first = txn.create_snapshot(&topic, &sub, "snap").await.unwrap();
        txn.commit().await.unwrap();

        // Move the live cursor, then try to re-create the snapshot.
        let mut txn = ps.begin().await.unwrap();
        sub.acked = Offset::new(sub.acked.ts + 100, 42);
        sub.sent = sub.acked;
        txn.update_subscription(&topic, &sub).await.unwrap();
        let second = txn.create_snapshot(&topic, &sub, "snap").await.unwrap();
        txn.commit().await.unwrap();

        assert_eq!(second, first);
        assert_ne!(second.subscription.acked, sub.acked);
    }

    #[tokio::test]
    async fn test_snapshots_listed_per_subscription() {
        let ps = engine();

        let mut txn = ps.begin().await.unwrap();
        let topic = txn.create_topic("t").await.unwrap();
        let sub = txn.create_subscription(&topic, "s").await.unwrap();
        let other = txn.create_subscription(&topic, "other").await.unwrap();
        txn.create_snapshot(&topic, &sub, "b").await.unwrap();
        txn.create_snapshot(&topic, &sub, "a").await.unwrap();
        txn.create_snapshot(&topic, &other, "c").await.unwrap();
        txn.commit().await.unwrap();

        let mut txn = ps.begin().await.unwrap();
        let snapshots = txn.snapshots(&topic, &sub).await.unwrap();
        let names: Vec<_> = snapshots.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);

        txn.delete_snapshot(&topic, &sub, "a").await.unwrap();
        txn.commit().await.unwrap();

        let mut txn = ps.begin().await.unwrap();
        let snapshots = txn.snapshots(&topic, &sub).await.unwrap();
        assert_eq!(snapshots.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_topic_drops_messages() {
        let ps = engine();

        let mut txn = ps.begin().await.unwrap();
        let topic = txn.create_topic("t").await.unwrap();
        let ids = txn
            .append(&topic, &[Message::new("payload")])
            .await
            .unwrap();
        txn.commit().await.unwrap();

        let mut txn = ps.begin().await.unwrap();
        txn.delete_topic("t").await.unwrap();
        txn.commit().await.unwrap();

        let mut txn = ps.begin().await.unwrap();
        assert_matches!(txn.get_topic("t").await, Err(Error::TopicNotFound));

        // The old object's message range is empty even if someone still
        // holds the record.
        let mut seen = 0;
        txn.scan(&topic, ids[0].0, |_, _| {
            seen += 1;
            true
        })
        .await
        .unwrap();
        assert_eq!(seen, 0);
    }

    #[tokio::test]
    async fn test_scan_from_next_excludes_start() {
        let ps = engine();

        let mut txn = ps.begin().await.unwrap();
        let topic = txn.create_topic("t").await.unwrap();
        let ids = txn
            .append(&topic, &[Message::new("a"), Message::new("b")])
            .await
            .unwrap();
        txn.commit().await.unwrap();

        let mut txn = ps.begin().await.unwrap();
        let mut seen = Vec::new();
        txn.scan(&topic, ids[0].0.next().unwrap(), |offset, _| {
            seen.push(offset);
            true
        })
        .await
        .unwrap();

        assert_eq!(seen, vec![ids[1].0]);
    }
}
