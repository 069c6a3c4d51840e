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

use equivalent::Equivalent;
use hashbrown::hash_table::{Entry as HashTableEntry, HashTable};
use permafrost_common::code::{Key, Value};

use crate::record::Record;

/// Hash-table index over the resident records, keyed by the precomputed record hash.
///
/// The indexer maintains the `IN_INDEXER` record flag; a record is in the table iff the flag is
/// set.
pub struct HashTableIndexer<K, V>
where
    K: Key,
    V: Value,
{
    table: HashTable<Arc<Record<K, V>>>,
}

impl<K, V> Default for HashTableIndexer<K, V>
where
    K: Key,
    V: Value,
{
    fn default() -> Self {
        Self {
            table: Default::default(),
        }
    }
}

impl<K, V> HashTableIndexer<K, V>
where
    K: Key,
    V: Value,
{
    /// Index a record, returning the replaced record of the same key, if any.
    pub fn insert(&mut self, mut record: Arc<Record<K, V>>) -> Option<Arc<Record<K, V>>> {
        record.set_in_indexer(true);
        match self
            .table
            .entry(record.hash(), |r| r.key() == record.key(), |r| r.hash())
        {
            HashTableEntry::Occupied(mut o) => {
                std::mem::swap(o.get_mut(), &mut record);
                record.set_in_indexer(false);
                Some(record)
            }
            HashTableEntry::Vacant(v) => {
                v.insert(record);
                None
            }
        }
    }

    /// Look up the record for a key.
    pub fn get<Q>(&self, hash: u64, key: &Q) -> Option<&Arc<Record<K, V>>>
    where
        Q: std::hash::Hash + Equivalent<K> + ?Sized,
    {
        self.table.find(hash, |r| key.equivalent(r.key()))
    }

    /// Unindex and return the record for a key.
    pub fn remove<Q>(&mut self, hash: u64, key: &Q) -> Option<Arc<Record<K, V>>>
    where
        Q: std::hash::Hash + Equivalent<K> + ?Sized,
    {
        match self.table.entry(hash, |r| key.equivalent(r.key()), |r| r.hash()) {
            HashTableEntry::Occupied(o) => {
                let (r, _) = o.remove();
                r.set_in_indexer(false);
                Some(r)
            }
            HashTableEntry::Vacant(_) => None,
        }
    }

    /// Unindex everything.
    pub fn drain(&mut self) -> impl Iterator<Item = Arc<Record<K, V>>> + '_ {
        self.table.drain().inspect(|r| r.set_in_indexer(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Data;

    fn record(key: u64, value: u64) -> Arc<Record<u64, u64>> {
        Arc::new(Record::new(Data { key, value, hash: key }))
    }

    #[test]
    fn test_indexer_flags() {
        let mut indexer = HashTableIndexer::default();

        let r1 = record(1, 10);
        assert!(indexer.insert(r1.clone()).is_none());
        assert!(r1.is_in_indexer());

        // replace keeps the newcomer, unflags the old
        let r1b = record(1, 11);
        let old = indexer.insert(r1b.clone()).unwrap();
        assert_eq!(Arc::as_ptr(&old), Arc::as_ptr(&r1));
        assert!(!r1.is_in_indexer());
        assert!(r1b.is_in_indexer());

        assert_eq!(indexer.get(1, &1u64).map(|r| *r.value()), Some(11));
        assert!(indexer.get(2, &2u64).is_none());

        let removed = indexer.remove(1, &1u64).unwrap();
        assert!(!removed.is_in_indexer());
        assert!(indexer.get(1, &1u64).is_none());
    }
}
