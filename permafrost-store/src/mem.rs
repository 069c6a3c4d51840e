// Copyright 2025 permafrost Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    ops::Bound,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};
use permafrost_common::error::{Error, Result};

use crate::kv::{Database, StoreTransaction};

/// In-memory engine config.
#[derive(Debug, Clone)]
pub struct MemDbConfig {
    /// How long a transaction waits for a record lock before the wait is reported as a deadlock.
    ///
    /// The engine detects deadlocks conservatively: a lock wait that cannot be satisfied within
    /// the timeout surfaces as [`ErrorKind::Deadlock`], which the layers above treat as a
    /// retryable conflict.
    ///
    /// [`ErrorKind::Deadlock`]: permafrost_common::error::ErrorKind::Deadlock
    pub lock_timeout: Duration,
}

impl Default for MemDbConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_millis(500),
        }
    }
}

type Table = BTreeMap<Vec<u8>, Vec<u8>>;
type LockKey = (String, Vec<u8>);

struct MemDbInner {
    config: MemDbConfig,
    tables: Mutex<HashMap<String, Table>>,
    locks: Mutex<HashMap<LockKey, u64>>,
    unlocked: Condvar,
    tx_seq: AtomicU64,
}

/// The built-in in-memory transactional engine.
///
/// Strict two-phase locking with per-record exclusive locks taken on first touch; writes are
/// buffered in the transaction and applied on commit. Scans read the committed state merged with
/// the transaction's own buffered writes and take no locks.
#[derive(Clone)]
pub struct MemDb {
    inner: Arc<MemDbInner>,
}

impl std::fmt::Debug for MemDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemDb").finish()
    }
}

impl Default for MemDb {
    fn default() -> Self {
        Self::new(MemDbConfig::default())
    }
}

impl MemDb {
    /// Create an engine with the given config.
    pub fn new(config: MemDbConfig) -> Self {
        Self {
            inner: Arc::new(MemDbInner {
                config,
                tables: Mutex::new(HashMap::new()),
                locks: Mutex::new(HashMap::new()),
                unlocked: Condvar::new(),
                tx_seq: AtomicU64::new(1),
            }),
        }
    }
}

impl Database for MemDb {
    type Tx = MemTransaction;

    fn begin(&self) -> Result<Self::Tx> {
        let id = self.inner.tx_seq.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(id, "[memdb]: begin transaction");
        Ok(MemTransaction {
            db: self.inner.clone(),
            id,
            state: Mutex::new(TxState::default()),
        })
    }

    fn open_table(&self, table: &str) -> Result<()> {
        self.inner.tables.lock().entry(table.to_owned()).or_default();
        Ok(())
    }
}

#[derive(Default)]
struct TxState {
    /// Buffered writes per table; `None` buffers a delete.
    writes: HashMap<String, BTreeMap<Vec<u8>, Option<Vec<u8>>>>,
    locks: HashSet<LockKey>,
    completed: bool,
}

/// A [`MemDb`] transaction.
pub struct MemTransaction {
    db: Arc<MemDbInner>,
    id: u64,
    state: Mutex<TxState>,
}

impl std::fmt::Debug for MemTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemTransaction").field("id", &self.id).finish()
    }
}

impl MemTransaction {
    /// The engine transaction id.
    pub fn id(&self) -> u64 {
        self.id
    }

    fn check_active(&self) -> Result<()> {
        if self.state.lock().completed {
            return Err(Error::illegal_state("operation on a completed transaction").with_context("txn", self.id));
        }
        Ok(())
    }

    fn lock_record(&self, table: &str, key: &[u8]) -> Result<()> {
        let lock_key: LockKey = (table.to_owned(), key.to_vec());

        if self.state.lock().locks.contains(&lock_key) {
            return Ok(());
        }

        let deadline = Instant::now() + self.db.config.lock_timeout;
        {
            let mut locks = self.db.locks.lock();
            loop {
                match locks.get(&lock_key) {
                    None => {
                        locks.insert(lock_key.clone(), self.id);
                        break;
                    }
                    Some(&owner) if owner == self.id => break,
                    Some(&owner) => {
                        tracing::trace!(id = self.id, owner, "[memdb]: lock wait");
                        if self.db.unlocked.wait_until(&mut locks, deadline).timed_out() {
                            tracing::debug!(id = self.id, owner, "[memdb]: lock wait timed out");
                            return Err(Error::deadlock("lock wait timed out")
                                .with_context("table", table)
                                .with_context("txn", self.id)
                                .with_context("holder", owner));
                        }
                    }
                }
            }
        }

        self.state.lock().locks.insert(lock_key);
        Ok(())
    }

    fn release_locks(&self, locks: &HashSet<LockKey>) {
        if locks.is_empty() {
            return;
        }
        let mut held = self.db.locks.lock();
        for lock_key in locks {
            if let Some(&owner) = held.get(lock_key) {
                if owner == self.id {
                    held.remove(lock_key);
                }
            }
        }
        self.db.unlocked.notify_all();
    }
}

impl StoreTransaction for MemTransaction {
    fn get(&self, table: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.check_active()?;
        self.lock_record(table, key)?;

        if let Some(writes) = self.state.lock().writes.get(table) {
            if let Some(buffered) = writes.get(key) {
                return Ok(buffered.clone());
            }
        }

        Ok(self.db.tables.lock().get(table).and_then(|t| t.get(key).cloned()))
    }

    fn put(&self, table: &str, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_active()?;
        self.lock_record(table, key)?;

        self.state
            .lock()
            .writes
            .entry(table.to_owned())
            .or_default()
            .insert(key.to_vec(), Some(value.to_vec()));
        Ok(())
    }

    fn delete(&self, table: &str, key: &[u8]) -> Result<()> {
        self.check_active()?;
        self.lock_record(table, key)?;

        self.state
            .lock()
            .writes
            .entry(table.to_owned())
            .or_default()
            .insert(key.to_vec(), None);
        Ok(())
    }

    fn scan(
        &self,
        table: &str,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.check_active()?;

        let lower = start.map(|s| Bound::Included(s.to_vec())).unwrap_or(Bound::Unbounded);
        let upper = end.map(|e| Bound::Excluded(e.to_vec())).unwrap_or(Bound::Unbounded);
        let bounds = (lower, upper);

        let state = self.state.lock();
        let empty = BTreeMap::new();
        let writes = state.writes.get(table).unwrap_or(&empty);

        let tables = self.db.tables.lock();
        let committed = match tables.get(table) {
            Some(t) => t,
            None => return Ok(vec![]),
        };

        // Merge the committed range with the transaction's own buffered writes, smallest key
        // first, without materializing the whole range.
        let mut out = Vec::new();
        let mut committed_iter = committed.range(bounds.clone()).peekable();
        let mut writes_iter = writes.range(bounds).peekable();
        while out.len() < limit {
            let take_write = match (committed_iter.peek(), writes_iter.peek()) {
                (None, None) => break,
                (None, Some(_)) => true,
                (Some(_), None) => false,
                (Some((ck, _)), Some((wk, _))) => wk <= ck,
            };
            if take_write {
                let (wk, w) = writes_iter.next().unwrap();
                if let Some((ck, _)) = committed_iter.peek() {
                    if *ck == wk {
                        committed_iter.next();
                    }
                }
                if let Some(v) = w {
                    out.push((wk.clone(), v.clone()));
                }
            } else {
                let (ck, cv) = committed_iter.next().unwrap();
                out.push((ck.clone(), cv.clone()));
            }
        }

        Ok(out)
    }

    fn commit(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.completed {
            return Err(Error::illegal_state("commit on a completed transaction").with_context("txn", self.id));
        }
        state.completed = true;

        {
            let mut tables = self.db.tables.lock();
            for (table, writes) in state.writes.drain() {
                let t = tables.entry(table).or_default();
                for (key, write) in writes {
                    match write {
                        Some(value) => {
                            t.insert(key, value);
                        }
                        None => {
                            t.remove(&key);
                        }
                    }
                }
            }
        }

        let locks = std::mem::take(&mut state.locks);
        drop(state);
        self.release_locks(&locks);

        tracing::trace!(id = self.id, "[memdb]: commit");
        Ok(())
    }

    fn rollback(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.completed {
            return Ok(());
        }
        state.completed = true;
        state.writes.clear();

        let locks = std::mem::take(&mut state.locks);
        drop(state);
        self.release_locks(&locks);

        tracing::trace!(id = self.id, "[memdb]: rollback");
        Ok(())
    }

    fn is_completed(&self) -> bool {
        self.state.lock().completed
    }
}

impl Drop for MemTransaction {
    fn drop(&mut self) {
        // An abandoned transaction must not keep its record locks.
        let _ = self.rollback();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: &str = "objects";

    fn db() -> MemDb {
        let db = MemDb::new(MemDbConfig {
            lock_timeout: Duration::from_millis(100),
        });
        db.open_table(T).unwrap();
        db
    }

    #[test]
    fn test_commit_visibility() {
        let db = db();

        let tx = db.begin().unwrap();
        tx.put(T, b"k", b"v").unwrap();
        assert_eq!(tx.get(T, b"k").unwrap(), Some(b"v".to_vec()));
        tx.commit().unwrap();

        let tx = db.begin().unwrap();
        assert_eq!(tx.get(T, b"k").unwrap(), Some(b"v".to_vec()));
        tx.rollback().unwrap();
    }

    #[test]
    fn test_rollback_discards() {
        let db = db();

        let tx = db.begin().unwrap();
        tx.put(T, b"k", b"v").unwrap();
        tx.rollback().unwrap();

        let tx = db.begin().unwrap();
        assert_eq!(tx.get(T, b"k").unwrap(), None);
        tx.rollback().unwrap();
    }

    #[test]
    fn test_uncommitted_invisible_and_blocking() {
        let db = db();

        let tx1 = db.begin().unwrap();
        tx1.put(T, b"k", b"v").unwrap();

        // An independent transaction cannot even lock the record while tx1 holds it.
        let tx2 = db.begin().unwrap();
        let err = tx2.get(T, b"k").unwrap_err();
        assert!(err.is_deadlock());

        tx1.commit().unwrap();
        drop(tx2);

        let tx3 = db.begin().unwrap();
        assert_eq!(tx3.get(T, b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test_log::test]
    fn test_cross_lock_deadlock() {
        let db = db();
        {
            let tx = db.begin().unwrap();
            tx.put(T, b"a", b"1").unwrap();
            tx.put(T, b"b", b"2").unwrap();
            tx.commit().unwrap();
        }

        let db1 = db.clone();
        let db2 = db.clone();

        let barrier = Arc::new(std::sync::Barrier::new(2));
        let (b1, b2) = (barrier.clone(), barrier);

        let h1 = std::thread::spawn(move || {
            let tx = db1.begin().unwrap();
            tx.get(T, b"a").unwrap();
            b1.wait();
            let res = tx.get(T, b"b");
            drop(tx);
            res
        });
        let h2 = std::thread::spawn(move || {
            let tx = db2.begin().unwrap();
            tx.get(T, b"b").unwrap();
            b2.wait();
            let res = tx.get(T, b"a");
            drop(tx);
            res
        });

        let r1 = h1.join().unwrap();
        let r2 = h2.join().unwrap();

        // At least one side must observe the conflict; with pure timeout detection both may.
        assert!(r1.is_err() || r2.is_err());
        for r in [r1, r2] {
            if let Err(e) = r {
                assert!(e.is_deadlock());
            }
        }
    }

    #[test]
    fn test_drop_releases_locks() {
        let db = db();

        let tx1 = db.begin().unwrap();
        tx1.put(T, b"k", b"v").unwrap();
        drop(tx1);

        let tx2 = db.begin().unwrap();
        assert_eq!(tx2.get(T, b"k").unwrap(), None);
    }

    #[test]
    fn test_scan_merges_own_writes() {
        let db = db();
        {
            let tx = db.begin().unwrap();
            tx.put(T, b"a", b"1").unwrap();
            tx.put(T, b"b", b"2").unwrap();
            tx.put(T, b"d", b"4").unwrap();
            tx.commit().unwrap();
        }

        let tx = db.begin().unwrap();
        tx.put(T, b"c", b"3").unwrap();
        tx.delete(T, b"b").unwrap();
        tx.put(T, b"d", b"40").unwrap();

        let entries = tx.scan(T, None, None, usize::MAX).unwrap();
        assert_eq!(
            entries,
            vec![
                (b"a".to_vec(), b"1".to_vec()),
                (b"c".to_vec(), b"3".to_vec()),
                (b"d".to_vec(), b"40".to_vec()),
            ]
        );

        let entries = tx.scan(T, Some(b"b"), Some(b"d"), usize::MAX).unwrap();
        assert_eq!(entries, vec![(b"c".to_vec(), b"3".to_vec())]);

        let entries = tx.scan(T, None, None, 2).unwrap();
        assert_eq!(entries.len(), 2);
    }
}
