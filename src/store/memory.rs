//! In-process MVCC implementation of the store traits.
//!
//! Keys map to version lists ordered by commit timestamp; a transaction reads
//! the newest version at or below its start timestamp and buffers its own
//! writes until commit. Commit re-checks every written key and rejects the
//! transaction if a newer version appeared since it began
//! (first-committer-wins). One lock guards the whole map, which is plenty for
//! tests and the standalone server mode this backend exists for.
//!
//! The one deliberate divergence from a distributed backend: range deletes
//! are applied at commit time rather than handed to a background GC worker,
//! because there is no background worker to hand them to.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use super::{Error, KvPair, KvStore, KvTransaction, Result};

#[derive(Debug)]
struct Version {
    /// Commit timestamp of the writing transaction.
    ts: i64,
    /// `None` is a tombstone.
    value: Option<Vec<u8>>,
}

#[derive(Debug, Default)]
struct State {
    /// The oracle. Serves both start and commit timestamps.
    next_ts: i64,
    data: BTreeMap<Vec<u8>, Vec<Version>>,
}

/// Snapshot-isolated in-memory store.
///
/// Cloning shares the underlying map, so a clone is a second handle to the
/// same store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    type Txn = MemoryTransaction;

    async fn begin(&self) -> Result<Self::Txn> {
        let start_ts = {
            let mut state = self.state.lock();
            let ts = state.next_ts;
            state.next_ts += 1;
            ts
        };

        Ok(MemoryTransaction {
            state: Arc::clone(&self.state),
            start_ts,
            writes: BTreeMap::new(),
            range_deletes: Vec::new(),
            status: Status::Open,
        })
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Status {
    Open,
    Committed,
    RolledBack,
}

#[derive(Debug)]
pub struct MemoryTransaction {
    state: Arc<Mutex<State>>,
    start_ts: i64,
    /// Buffered writes; `None` is a pending delete.
    writes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    range_deletes: Vec<Vec<u8>>,
    status: Status,
}

impl MemoryTransaction {
    fn check_open(&self) -> Result<()> {
        match self.status {
            Status::Open => Ok(()),
            _ => Err(Error::Finished),
        }
    }
}

/// Newest value at or below `ts`, if it is not a tombstone.
fn visible(versions: &[Version], ts: i64) -> Option<&Vec<u8>> {
    versions
        .iter()
        .rev()
        .find(|v| v.ts <= ts)
        .and_then(|v| v.value.as_ref())
}

#[async_trait]
impl KvTransaction for MemoryTransaction {
    fn start_ts(&self) -> i64 {
        self.start_ts
    }

    async fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.check_open()?;

        if let Some(buffered) = self.writes.get(key) {
            return Ok(buffered.clone());
        }

        let state = self.state.lock();
        Ok(state
            .data
            .get(key)
            .and_then(|versions| visible(versions, self.start_ts))
            .cloned())
    }

    async fn set(&mut self, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        self.check_open()?;
        self.writes.insert(key, Some(value));
        Ok(())
    }

    async fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.check_open()?;
        self.writes.insert(key.to_vec(), None);
        Ok(())
    }

    async fn scan(&mut self, from: &[u8], limit: usize) -> Result<Vec<KvPair>> {
        self.check_open()?;

        let start_ts = self.start_ts;
        let state = self.state.lock();
        let mut committed = state
            .data
            .range(from.to_vec()..)
            .filter_map(|(key, versions)| visible(versions, start_ts).map(|value| (key, value)))
            .peekable();
        let mut buffered = self.writes.range(from.to_vec()..).peekable();

        let mut pairs = Vec::new();
        while pairs.len() < limit {
            // The buffered write wins whenever both sides hold the same key.
            let take_buffered = match (committed.peek(), buffered.peek()) {
                (None, None) => break,
                (None, Some(_)) => true,
                (Some(_), None) => false,
                (Some((ck, _)), Some((bk, _))) => bk <= ck,
            };

            if take_buffered {
                if let Some((key, value)) = buffered.next() {
                    if let Some((ck, _)) = committed.peek() {
                        if *ck == key {
                            committed.next();
                        }
                    }
                    if let Some(value) = value {
                        pairs.push(KvPair {
                            key: key.clone(),
                            value: value.clone(),
                        });
                    }
                }
            } else if let Some((key, value)) = committed.next() {
                pairs.push(KvPair {
                    key: key.clone(),
                    value: value.clone(),
                });
            }
        }

        Ok(pairs)
    }

    async fn delete_range(&mut self, prefix: &[u8]) -> Result<()> {
        self.check_open()?;
        self.range_deletes.push(prefix.to_vec());
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.check_open()?;

        let mut state = self.state.lock();

        for key in self.writes.keys() {
            let newer = state
                .data
                .get(key)
                .and_then(|versions| versions.last())
                .is_some_and(|v| v.ts > self.start_ts);
            if newer {
                self.status = Status::RolledBack;
                debug!(start_ts = self.start_ts, "commit lost to a newer writer");
                return Err(Error::Conflict(format!(
                    "write conflict on key {:?}",
                    String::from_utf8_lossy(key)
                )));
            }
        }

        let commit_ts = state.next_ts;
        state.next_ts += 1;

        for prefix in self.range_deletes.drain(..) {
            state.data.retain(|key, _| !key.starts_with(&prefix));
        }

        for (key, value) in std::mem::take(&mut self.writes) {
            state
                .data
                .entry(key)
                .or_default()
                .push(Version { ts: commit_ts, value });
        }

        self.status = Status::Committed;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        match self.status {
            Status::Open => {
                self.writes.clear();
                self.range_deletes.clear();
                self.status = Status::RolledBack;
                Ok(())
            }
            Status::RolledBack => Ok(()),
            Status::Committed => Err(Error::Finished),
        }
    }
}
