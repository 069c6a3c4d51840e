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

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use permafrost::prelude::*;

struct Counter {
    value: AtomicU64,
}

impl Counter {
    fn new(value: u64) -> Self {
        Self {
            value: AtomicU64::new(value),
        }
    }

    fn get(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    fn set(&self, value: u64) {
        self.value.store(value, Ordering::Release);
    }
}

impl Servant for Counter {
    fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(&self.get()).map_err(Error::database)
    }

    fn decode(payload: &[u8]) -> Result<Self> {
        let value = bincode::deserialize(payload).map_err(Error::database)?;
        Ok(Counter::new(value))
    }
}

type Simple = SimpleEvictor<Counter, MemDb>;

fn id(name: &str) -> Identity {
    Identity::new(name, "counters")
}

#[test]
fn test_write_back_on_teardown() {
    let db = Arc::new(MemDb::default());
    let ev: Simple = EvictorBuilder::new(db.clone()).build_simple();

    let i1 = id("i1");
    ev.add(i1.clone(), Counter::new(1)).unwrap();

    let holder = ev.locate(&Request::write(i1.clone(), "set")).unwrap();
    holder.servant().set(5);
    holder.finished(true).unwrap();

    // A second evictor over the same engine sees the written-back state.
    let other: Simple = EvictorBuilder::new(db.clone()).build_simple();
    let holder = other.locate(&Request::read(i1.clone(), "get")).unwrap();
    assert_eq!(holder.servant().get(), 5);
    holder.finished(true).unwrap();
}

#[test]
fn test_calls_share_the_cached_servant() {
    let db = Arc::new(MemDb::default());
    let ev: Simple = EvictorBuilder::new(db.clone()).build_simple();

    let i1 = id("i1");
    ev.add(i1.clone(), Counter::new(1)).unwrap();

    let a = ev.locate(&Request::read(i1.clone(), "get")).unwrap();
    let b = ev.locate(&Request::read(i1.clone(), "get")).unwrap();
    assert!(Arc::ptr_eq(a.servant(), b.servant()));
    a.finished(true).unwrap();
    b.finished(true).unwrap();
}

#[test]
fn test_remove_informs_in_flight_checkout() {
    let db = Arc::new(MemDb::default());
    let ev: Simple = EvictorBuilder::new(db.clone()).build_simple();

    let i1 = id("i1");
    ev.add(i1.clone(), Counter::new(1)).unwrap();

    let holder = ev.locate(&Request::write(i1.clone(), "mutate")).unwrap();
    holder.servant().set(100);

    let removed = ev.remove(&i1).unwrap();
    assert!(Arc::ptr_eq(&removed, holder.servant()));
    assert!(!ev.has_object(&i1).unwrap());

    // Teardown must not resurrect the destroyed record by writing back its stale state.
    holder.finished(true).unwrap();
    assert!(!ev.has_object(&i1).unwrap());
    let err = ev.locate(&Request::read(i1.clone(), "get")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn test_keep_stats_written_back() {
    let db = Arc::new(MemDb::default());
    let ev: Simple = EvictorBuilder::new(db.clone()).with_keep_stats(true).build_simple();

    let i1 = id("i1");
    ev.add(i1.clone(), Counter::new(1)).unwrap();

    for _ in 0..2 {
        let holder = ev.locate(&Request::read(i1.clone(), "get")).unwrap();
        holder.finished(true).unwrap();
    }

    // Even pure reads persisted their access statistics.
    let store = ev.facet_store("").unwrap();
    let tx = db.begin().unwrap();
    let rec = store.load(&i1, &tx).unwrap().expect("present");
    assert_eq!(rec.stats_snapshot().use_count, 2);
    tx.rollback().unwrap();
}

#[test]
fn test_eviction_keeps_cache_bounded() {
    let db = Arc::new(MemDb::default());
    let ev: Simple = EvictorBuilder::new(db.clone()).with_size(2).build_simple();

    for n in 0..6 {
        let identity = id(&format!("i{n}"));
        ev.add(identity.clone(), Counter::new(n)).unwrap();
        let holder = ev.locate(&Request::read(identity, "get")).unwrap();
        assert_eq!(holder.servant().get(), n);
        holder.finished(true).unwrap();
    }

    let cache = ev.facet_store("").unwrap().cache().clone();
    assert_eq!(cache.usage(), 2);
    assert!(cache.contains(&id("i4")));
    assert!(cache.contains(&id("i5")));
}
