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

use std::sync::Arc;

use permafrost_common::{
    code::{Servant, StorageKey},
    error::{Error, ErrorKind, Result},
};
use permafrost_memory::LruCache;

use crate::{
    index::{self, IndexSpec},
    kv::{Database, StoreTransaction},
    record::{ObjectRecord, StoredRecord},
};

const POPULATE_BATCH: usize = 256;

/// Object store config.
pub struct ObjectStoreConfig {
    /// The facet this store serves; the empty string is the default facet.
    pub facet: String,
    /// Target capacity of the per-facet servant cache.
    pub cache_capacity: usize,
    /// Whether access statistics are tracked and written back for this store.
    pub keep_stats: bool,
    /// Whether a newly added, still-empty index is back-filled from the primary table at open.
    pub populate_empty_indices: bool,
    /// Secondary indices over the record payload.
    pub indices: Vec<IndexSpec>,
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self {
            facet: String::new(),
            cache_capacity: 10,
            keep_stats: false,
            populate_empty_indices: false,
            indices: vec![],
        }
    }
}

/// Durable storage for one facet: a table of `identity -> record` plus secondary indices, and the
/// bounded cache of committed servants faulted in from it.
///
/// Index entries are maintained inside the same transaction as the primary write, so primary and
/// indices commit and roll back together.
pub struct ObjectStore<K, S, D>
where
    K: StorageKey,
    S: Servant,
    D: Database,
{
    db: Arc<D>,
    table: String,
    facet: String,
    keep_stats: bool,
    indices: Vec<IndexSpec>,
    cache: LruCache<K, Arc<ObjectRecord<S>>>,
}

impl<K, S, D> std::fmt::Debug for ObjectStore<K, S, D>
where
    K: StorageKey,
    S: Servant,
    D: Database,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStore")
            .field("table", &self.table)
            .field("facet", &self.facet)
            .finish()
    }
}

impl<K, S, D> ObjectStore<K, S, D>
where
    K: StorageKey,
    S: Servant,
    D: Database,
{
    /// Open the store for a facet, creating its tables if missing.
    pub fn open(db: Arc<D>, config: ObjectStoreConfig) -> Result<Arc<Self>> {
        let table = if config.facet.is_empty() {
            "objects".to_owned()
        } else {
            format!("objects.{}", config.facet)
        };

        db.open_table(&table)?;
        for spec in &config.indices {
            db.open_table(&index_table(&table, spec.name()))?;
        }

        let store = Arc::new(Self {
            db,
            table,
            facet: config.facet,
            keep_stats: config.keep_stats,
            indices: config.indices,
            cache: LruCache::new(config.cache_capacity),
        });

        if config.populate_empty_indices {
            store.populate_empty_indices()?;
        }

        Ok(store)
    }

    /// The engine this store writes through.
    pub fn db(&self) -> &Arc<D> {
        &self.db
    }

    /// The facet this store serves.
    pub fn facet(&self) -> &str {
        &self.facet
    }

    /// The primary table name.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Whether access statistics are tracked and written back for this store.
    pub fn keep_stats(&self) -> bool {
        self.keep_stats
    }

    /// The bounded cache of committed servants for this facet.
    pub fn cache(&self) -> &LruCache<K, Arc<ObjectRecord<S>>> {
        &self.cache
    }

    /// Serialize an identity into its engine key.
    pub fn encode_identity(&self, identity: &K) -> Result<Vec<u8>> {
        bincode::serialize(identity).map_err(Error::database)
    }

    /// Deserialize an identity from its engine key.
    pub fn decode_identity(&self, bytes: &[u8]) -> Result<K> {
        bincode::deserialize(bytes).map_err(Error::database)
    }

    /// Read the record for an identity within the transaction's view.
    ///
    /// Absence is a routine outcome and reported as `Ok(None)`.
    pub fn load(&self, identity: &K, tx: &D::Tx) -> Result<Option<ObjectRecord<S>>> {
        let key = self.encode_identity(identity)?;
        let Some(bytes) = tx.get(&self.table, &key)? else {
            return Ok(None);
        };
        let stored: StoredRecord = bincode::deserialize(&bytes).map_err(Error::database)?;
        let servant = S::decode(&stored.payload)?;
        Ok(Some(ObjectRecord::new(Arc::new(servant), stored.stats)))
    }

    /// Whether a record exists for an identity within the transaction's view.
    ///
    /// Probes via a bounded scan rather than a point read: the probe observes the transaction's
    /// own writes but does not take the record lock, so an existence check from an independent
    /// transaction reads the committed state instead of blocking on an uncommitted write.
    pub fn exists(&self, identity: &K, tx: &D::Tx) -> Result<bool> {
        let key = self.encode_identity(identity)?;
        let end = next_key(&key);
        Ok(!tx.scan(&self.table, Some(&key), Some(&end), 1)?.is_empty())
    }

    /// Create the record for a fresh identity.
    pub fn insert(&self, identity: &K, record: &ObjectRecord<S>, tx: &D::Tx) -> Result<()> {
        let key = self.encode_identity(identity)?;
        if tx.get(&self.table, &key)?.is_some() {
            return Err(Error::already_exists(format!("{identity:?}")));
        }

        let payload = record.servant().encode()?;
        let stored = StoredRecord {
            stats: record.stats_snapshot(),
            payload,
        };
        tx.put(&self.table, &key, &bincode::serialize(&stored).map_err(Error::database)?)?;

        self.fix_indices(&key, None, Some(&stored.payload), tx)
    }

    /// Write back a mutated record.
    ///
    /// Calling this without holding the corresponding active transaction is a programming error.
    pub fn update(&self, identity: &K, record: &ObjectRecord<S>, tx: &D::Tx) -> Result<()> {
        assert!(
            !tx.is_completed(),
            "ObjectStore::update requires the corresponding active transaction"
        );

        let key = self.encode_identity(identity)?;
        let old_payload = match tx.get(&self.table, &key)? {
            Some(bytes) => {
                let stored: StoredRecord = bincode::deserialize(&bytes).map_err(Error::database)?;
                Some(stored.payload)
            }
            None => None,
        };

        let payload = record.servant().encode()?;
        let stored = StoredRecord {
            stats: record.stats_snapshot(),
            payload,
        };
        tx.put(&self.table, &key, &bincode::serialize(&stored).map_err(Error::database)?)?;

        self.fix_indices(&key, old_payload.as_deref(), Some(&stored.payload), tx)
    }

    /// Delete the record for an identity.
    pub fn remove(&self, identity: &K, tx: &D::Tx) -> Result<()> {
        let key = self.encode_identity(identity)?;
        let Some(bytes) = tx.get(&self.table, &key)? else {
            return Err(Error::not_found(format!("{identity:?}")));
        };
        let stored: StoredRecord = bincode::deserialize(&bytes).map_err(Error::database)?;

        tx.delete(&self.table, &key)?;
        self.fix_indices(&key, Some(&stored.payload), None, tx)
    }

    /// Point lookup through a secondary index, returning the matching identities.
    pub fn find_by_index(&self, name: &str, derived: &[u8], tx: &D::Tx) -> Result<Vec<K>> {
        let spec = self.index(name)?;
        let (start, end) = index::point_bounds(derived);
        let entries = tx.scan(
            &index_table(&self.table, spec.name()),
            Some(&start),
            Some(&end),
            usize::MAX,
        )?;
        entries.iter().map(|(_, id)| self.decode_identity(id)).collect()
    }

    /// Range lookup through a secondary index over `[lo, hi)` of the derived key space.
    pub fn find_range_by_index(&self, name: &str, lo: &[u8], hi: &[u8], tx: &D::Tx) -> Result<Vec<K>> {
        let spec = self.index(name)?;
        let start = index::range_bound(lo);
        let end = index::range_bound(hi);
        let entries = tx.scan(
            &index_table(&self.table, spec.name()),
            Some(&start),
            Some(&end),
            usize::MAX,
        )?;
        entries.iter().map(|(_, id)| self.decode_identity(id)).collect()
    }

    /// One page of identities in engine-key order, strictly after the given engine key.
    ///
    /// Returns `(engine key, identity)` pairs so the caller can resume the scan.
    pub fn scan_identities(&self, after: Option<&[u8]>, limit: usize, tx: &D::Tx) -> Result<Vec<(Vec<u8>, K)>> {
        let start = after.map(next_key);
        let entries = tx.scan(&self.table, start.as_deref(), None, limit)?;
        entries
            .into_iter()
            .map(|(key, _)| {
                let identity = self.decode_identity(&key)?;
                Ok((key, identity))
            })
            .collect()
    }

    fn index(&self, name: &str) -> Result<&IndexSpec> {
        self.indices
            .iter()
            .find(|spec| spec.name() == name)
            .ok_or_else(|| Error::new(ErrorKind::Config, "no such index").with_context("index", name))
    }

    /// Keep every index consistent with a primary write, inside the same transaction.
    fn fix_indices(&self, id_bytes: &[u8], old: Option<&[u8]>, new: Option<&[u8]>, tx: &D::Tx) -> Result<()> {
        for spec in &self.indices {
            let table = index_table(&self.table, spec.name());
            let old_derived = old.and_then(|payload| spec.extract(payload));
            let new_derived = new.and_then(|payload| spec.extract(payload));
            if old_derived == new_derived {
                continue;
            }
            if let Some(derived) = old_derived {
                tx.delete(&table, &index::encode_entry_key(&derived, id_bytes))?;
            }
            if let Some(derived) = new_derived {
                tx.put(&table, &index::encode_entry_key(&derived, id_bytes), id_bytes)?;
            }
        }
        Ok(())
    }

    /// Back-fill still-empty indices from the primary table, each in its own transaction.
    fn populate_empty_indices(&self) -> Result<()> {
        for spec in &self.indices {
            let table = index_table(&self.table, spec.name());

            let tx = self.db.begin()?;
            if !tx.scan(&table, None, None, 1)?.is_empty() {
                tx.rollback()?;
                continue;
            }

            tracing::debug!(index = spec.name(), "[object store]: populating empty index");

            let mut after: Option<Vec<u8>> = None;
            loop {
                let start = after.as_deref().map(next_key);
                let entries = tx.scan(&self.table, start.as_deref(), None, POPULATE_BATCH)?;
                if entries.is_empty() {
                    break;
                }
                for (key, bytes) in &entries {
                    let stored: StoredRecord = bincode::deserialize(bytes).map_err(Error::database)?;
                    if let Some(derived) = spec.extract(&stored.payload) {
                        tx.put(&table, &index::encode_entry_key(&derived, key), key)?;
                    }
                }
                after = entries.last().map(|(key, _)| key.clone());
            }
            tx.commit()?;
        }
        Ok(())
    }
}

fn index_table(table: &str, index: &str) -> String {
    format!("{table}#{index}")
}

/// The smallest engine key strictly greater than `key`.
fn next_key(key: &[u8]) -> Vec<u8> {
    let mut next = key.to_vec();
    next.push(0x00);
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemDb;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Account {
        owner: String,
        balance: u64,
    }

    impl Servant for Account {
        fn encode(&self) -> Result<Vec<u8>> {
            let mut payload = self.balance.to_be_bytes().to_vec();
            payload.extend_from_slice(self.owner.as_bytes());
            Ok(payload)
        }

        fn decode(payload: &[u8]) -> Result<Self> {
            let balance = u64::from_be_bytes(payload[..8].try_into().unwrap());
            let owner = String::from_utf8(payload[8..].to_vec()).unwrap();
            Ok(Account { owner, balance })
        }
    }

    fn by_owner() -> IndexSpec {
        IndexSpec::new("owner", |payload: &[u8]| Some(payload[8..].to_vec()))
    }

    type TestStore = ObjectStore<String, Account, MemDb>;

    fn store(indices: Vec<IndexSpec>) -> (Arc<MemDb>, Arc<TestStore>) {
        let db = Arc::new(MemDb::default());
        let store = TestStore::open(
            db.clone(),
            ObjectStoreConfig {
                indices,
                ..Default::default()
            },
        )
        .unwrap();
        (db, store)
    }

    fn account(owner: &str, balance: u64) -> ObjectRecord<Account> {
        ObjectRecord::fresh(Arc::new(Account {
            owner: owner.to_owned(),
            balance,
        }))
    }

    #[test]
    fn test_insert_load_remove() {
        let (db, store) = store(vec![]);

        let tx = db.begin().unwrap();
        store.insert(&"i1".to_owned(), &account("alice", 10), &tx).unwrap();
        tx.commit().unwrap();

        let tx = db.begin().unwrap();
        let rec = store.load(&"i1".to_owned(), &tx).unwrap().expect("present");
        assert_eq!(rec.servant().owner, "alice");
        assert_eq!(rec.servant().balance, 10);
        assert!(store.load(&"i2".to_owned(), &tx).unwrap().is_none());

        store.remove(&"i1".to_owned(), &tx).unwrap();
        assert!(!store.exists(&"i1".to_owned(), &tx).unwrap());
        tx.commit().unwrap();

        let tx = db.begin().unwrap();
        assert!(store.load(&"i1".to_owned(), &tx).unwrap().is_none());
        let err = store.remove(&"i1".to_owned(), &tx).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_duplicate_insert() {
        let (db, store) = store(vec![]);

        let tx = db.begin().unwrap();
        store.insert(&"i1".to_owned(), &account("alice", 10), &tx).unwrap();
        let err = store.insert(&"i1".to_owned(), &account("bob", 20), &tx).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    }

    #[test]
    #[should_panic(expected = "active transaction")]
    fn test_update_requires_active_transaction() {
        let (db, store) = store(vec![]);

        let tx = db.begin().unwrap();
        tx.commit().unwrap();
        let _ = store.update(&"i1".to_owned(), &account("alice", 10), &tx);
    }

    #[test]
    fn test_index_follows_updates() {
        let (db, store) = store(vec![by_owner()]);

        let tx = db.begin().unwrap();
        store.insert(&"i1".to_owned(), &account("alice", 10), &tx).unwrap();
        store.insert(&"i2".to_owned(), &account("alice", 20), &tx).unwrap();
        store.insert(&"i3".to_owned(), &account("bob", 30), &tx).unwrap();
        tx.commit().unwrap();

        let tx = db.begin().unwrap();
        let mut ids = store.find_by_index("owner", b"alice", &tx).unwrap();
        ids.sort();
        assert_eq!(ids, vec!["i1".to_owned(), "i2".to_owned()]);

        // Reassign i1 to bob; the index entry moves within the same transaction.
        store.update(&"i1".to_owned(), &account("bob", 10), &tx).unwrap();
        let ids = store.find_by_index("owner", b"alice", &tx).unwrap();
        assert_eq!(ids, vec!["i2".to_owned()]);
        let mut ids = store.find_by_index("owner", b"bob", &tx).unwrap();
        ids.sort();
        assert_eq!(ids, vec!["i1".to_owned(), "i3".to_owned()]);

        store.remove(&"i3".to_owned(), &tx).unwrap();
        let ids = store.find_by_index("owner", b"bob", &tx).unwrap();
        assert_eq!(ids, vec!["i1".to_owned()]);
        tx.commit().unwrap();
    }

    #[test]
    fn test_index_rolls_back_with_primary() {
        let (db, store) = store(vec![by_owner()]);

        let tx = db.begin().unwrap();
        store.insert(&"i1".to_owned(), &account("alice", 10), &tx).unwrap();
        tx.rollback().unwrap();

        let tx = db.begin().unwrap();
        assert!(store.find_by_index("owner", b"alice", &tx).unwrap().is_empty());
        assert!(!store.exists(&"i1".to_owned(), &tx).unwrap());
    }

    #[test]
    fn test_index_range_lookup() {
        let (db, store) = store(vec![by_owner()]);

        let tx = db.begin().unwrap();
        for (id, owner) in [("i1", "alice"), ("i2", "bob"), ("i3", "carol"), ("i4", "dave")] {
            store.insert(&id.to_owned(), &account(owner, 1), &tx).unwrap();
        }
        tx.commit().unwrap();

        let tx = db.begin().unwrap();
        let ids = store.find_range_by_index("owner", b"bob", b"dave", &tx).unwrap();
        assert_eq!(ids, vec!["i2".to_owned(), "i3".to_owned()]);
    }

    #[test]
    fn test_populate_empty_indices() {
        let db = Arc::new(MemDb::default());

        // Records written before the index exists.
        {
            let store = TestStore::open(db.clone(), ObjectStoreConfig::default()).unwrap();
            let tx = db.begin().unwrap();
            store.insert(&"i1".to_owned(), &account("alice", 10), &tx).unwrap();
            store.insert(&"i2".to_owned(), &account("bob", 20), &tx).unwrap();
            tx.commit().unwrap();
        }

        // Reopening with the index and populate on back-fills it.
        let store = TestStore::open(
            db.clone(),
            ObjectStoreConfig {
                indices: vec![by_owner()],
                populate_empty_indices: true,
                ..Default::default()
            },
        )
        .unwrap();

        let tx = db.begin().unwrap();
        assert_eq!(store.find_by_index("owner", b"alice", &tx).unwrap(), vec!["i1".to_owned()]);
        assert_eq!(store.find_by_index("owner", b"bob", &tx).unwrap(), vec!["i2".to_owned()]);
    }

    #[test]
    fn test_scan_identities_pages() {
        let (db, store) = store(vec![]);

        let tx = db.begin().unwrap();
        for id in ["a", "b", "c", "d", "e"] {
            store.insert(&id.to_owned(), &account(id, 1), &tx).unwrap();
        }
        tx.commit().unwrap();

        let tx = db.begin().unwrap();
        let mut all = vec![];
        let mut after: Option<Vec<u8>> = None;
        loop {
            let page = store.scan_identities(after.as_deref(), 2, &tx).unwrap();
            if page.is_empty() {
                break;
            }
            after = page.last().map(|(key, _)| key.clone());
            all.extend(page.into_iter().map(|(_, id)| id));
        }
        all.sort();
        assert_eq!(all, vec!["a", "b", "c", "d", "e"]);
    }
}
