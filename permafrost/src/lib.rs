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

//! permafrost - transactional object evictor for Rust.
//!
//! permafrost sits between a distributed-object server's dispatch layer and a transactional
//! key-value store. It keeps a bounded cache of in-memory servants in front of very large
//! populations of persistent objects, faults records in on demand, evicts in LRU order (never a
//! servant that is checked out by an in-flight call), and writes mutations back through the
//! store's transactions.
//!
//! # Example
//!
//! ```
//! use std::sync::{atomic::{AtomicU64, Ordering}, Arc};
//!
//! use permafrost::prelude::*;
//!
//! struct Counter {
//!     value: AtomicU64,
//! }
//!
//! impl Servant for Counter {
//!     fn encode(&self) -> Result<Vec<u8>> {
//!         Ok(self.value.load(Ordering::Acquire).to_be_bytes().to_vec())
//!     }
//!
//!     fn decode(payload: &[u8]) -> Result<Self> {
//!         let value = u64::from_be_bytes(payload.try_into().unwrap());
//!         Ok(Counter {
//!             value: AtomicU64::new(value),
//!         })
//!     }
//! }
//!
//! let db = Arc::new(MemDb::default());
//! let evictor: TransactionalEvictor<Counter, _> = EvictorBuilder::new(db).with_size(100).build_transactional();
//!
//! let id = Identity::new("counter-1", "counters");
//! evictor.add(id.clone(), Counter { value: AtomicU64::new(0) }).unwrap();
//!
//! let incremented = evictor
//!     .dispatch(&Request::write(id.clone(), "increment"), |holder| {
//!         Ok(holder.servant().value.fetch_add(1, Ordering::AcqRel) + 1)
//!     })
//!     .unwrap();
//! assert_eq!(incremented, 1);
//!
//! evictor.destroy().unwrap();
//! ```

mod base;
mod context;
mod deactivate;
mod evictor;
mod holder;
mod identity;
mod iterator;
mod simple;
mod transactional;

/// The crate prelude.
pub mod prelude;

pub use context::{current, AttachGuard, TransactionContext};
pub use deactivate::{DeactivateController, Guard};
pub use evictor::{Evictor, EvictorBuilder, EvictorConfig};
pub use holder::ServantHolder;
pub use identity::{Identity, Request};
pub use iterator::EvictorIterator;
pub use simple::SimpleEvictor;
pub use transactional::TransactionalEvictor;

pub use permafrost_common::{
    code::{HashBuilder, Key, Servant, StorageKey, Value},
    error::{Error, ErrorKind, Result},
};
pub use permafrost_store::{
    Database, IndexSpec, KeyExtractor, MemDb, MemDbConfig, ObjectRecord, ObjectStore, ObjectStoreConfig, Stats,
    StoreTransaction, StoredRecord,
};

use std::sync::Arc;

use permafrost_memory::LruCacheEntry;

/// The per-facet object store of an evictor.
pub type FacetStore<S, D> = ObjectStore<Identity, S, D>;

/// A pinned handle over a facet cache entry.
pub type ServantEntry<S> = LruCacheEntry<Identity, Arc<ObjectRecord<S>>>;
