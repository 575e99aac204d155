//! The transactional KV store the engine runs on.
//!
//! The engine only ever talks to the traits in this module: a [`KvStore`]
//! hands out snapshot-isolated [`KvTransaction`]s whose start timestamps come
//! from a monotonically increasing oracle, keys iterate in lexicographic
//! order, and commits fail with [`Error::Conflict`] when another writer got
//! there first. A TiKV-class driver implements these traits against the real
//! cluster; [`memory`] implements them in process for tests and the
//! standalone server mode.

use async_trait::async_trait;
use thiserror::Error;

pub mod memory;

pub use memory::MemoryStore;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Another transaction committed a conflicting write first. Retryable.
    #[error("transaction conflict: {0}")]
    Conflict(String),

    /// The transaction was already committed or rolled back.
    #[error("transaction already finished")]
    Finished,

    #[error("storage failure: {0}")]
    Storage(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A key-value pair returned from [`KvTransaction::scan`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvPair {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Handle to the store, shared by all request handlers.
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    type Txn: KvTransaction;

    /// Open a transaction with a fresh start timestamp.
    async fn begin(&self) -> Result<Self::Txn>;
}

/// One snapshot-isolated transaction.
///
/// Reads observe the state as of the start timestamp plus the transaction's
/// own buffered writes. Writes become visible to others only at commit.
#[async_trait]
pub trait KvTransaction: Send {
    /// Start timestamp allocated by the store's oracle.
    fn start_ts(&self) -> i64;

    async fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    async fn set(&mut self, key: Vec<u8>, value: Vec<u8>) -> Result<()>;

    async fn delete(&mut self, key: &[u8]) -> Result<()>;

    /// Up to `limit` pairs in key order, starting at `from` (inclusive).
    ///
    /// The range is not bounded above; callers stop when keys leave their
    /// prefix of interest.
    async fn scan(&mut self, from: &[u8], limit: usize) -> Result<Vec<KvPair>>;

    /// Schedule removal of every key under `prefix`.
    ///
    /// Range removal happens outside the transactional write set (TiKV
    /// delegates it to background GC); it must not fail the conflict check.
    async fn delete_range(&mut self, prefix: &[u8]) -> Result<()>;

    /// Atomically persist all buffered writes.
    async fn commit(&mut self) -> Result<()>;

    /// Discard buffered writes. Idempotent; after a successful commit it
    /// reports [`Error::Finished`], which callers ignore.
    async fn rollback(&mut self) -> Result<()>;
}
