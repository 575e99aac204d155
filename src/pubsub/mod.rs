//! The pub/sub engine: entity records and their transactional operations.
//!
//! [`Pubsub`] owns the store handle and hands out [`Transaction`]s; all
//! entity operations live on the transaction wrapper so that one service
//! call maps to one KV transaction.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::offset::Offset;
use crate::store::{self, KvStore};

mod txn;

pub use txn::Transaction;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("topic can not found")]
    TopicNotFound,

    #[error("subscription can not found")]
    SubscriptionNotFound,

    #[error("snapshot can not found")]
    SnapshotNotFound,

    #[error("corrupted record: {0}")]
    Record(#[from] serde_json::Error),

    #[error("malformed message key in topic range")]
    MalformedKey,

    #[error(transparent)]
    Store(#[from] store::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A named message stream.
///
/// The object-id, not the name, is embedded in the keys of everything the
/// topic owns; deleting and recreating a topic therefore yields a disjoint
/// keyspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topic {
    pub name: String,

    /// Opaque identity minted at creation.
    pub object_id: Uuid,

    /// Creation time, nanoseconds since epoch.
    pub created_at: i64,
}

/// A consumer cursor into a topic's message stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub name: String,

    /// Greatest offset ever returned to a consumer.
    pub sent: Offset,

    /// Greatest offset durably acknowledged; messages at or below it count
    /// as consumed.
    pub acked: Offset,
}

/// A named, immutable copy of a subscription's cursor, used as a seek
/// target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub name: String,

    pub subscription: Subscription,
}

/// An opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub payload: bytes::Bytes,
}

impl Message {
    pub fn new(payload: impl Into<bytes::Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }
}

/// Identity of a published message; the decimal string form is what clients
/// see and echo back for acks and pull offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MessageId(pub Offset);

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Entry point to the engine. Owns the single long-lived store handle.
#[derive(Debug)]
pub struct Pubsub<S> {
    store: S,
}

impl<S: KvStore> Pubsub<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Open a transaction scoped to one service operation.
    pub async fn begin(&self) -> Result<Transaction<S::Txn>> {
        let txn = self.store.begin().await?;
        Ok(Transaction::new(txn))
    }
}
