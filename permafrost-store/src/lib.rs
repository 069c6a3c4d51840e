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

//! Storage layer for permafrost.
//!
//! The [`Database`]/[`StoreTransaction`] traits abstract the transactional key-value engine
//! underneath the evictor; [`MemDb`] is the built-in in-memory engine. [`ObjectStore`] owns one
//! facet's table of `identity -> record` together with its secondary indices and its bounded
//! servant cache.
//!
//! Engine failures are classified at this boundary: a detected conflict is
//! [`ErrorKind::Deadlock`], everything else is [`ErrorKind::Database`], so the layers above make
//! retry decisions on the kind alone.
//!
//! [`ErrorKind::Deadlock`]: permafrost_common::error::ErrorKind::Deadlock
//! [`ErrorKind::Database`]: permafrost_common::error::ErrorKind::Database

mod index;
mod kv;
mod mem;
mod object_store;
mod record;

/// The crate prelude.
pub mod prelude;

pub use index::{IndexSpec, KeyExtractor};
pub use kv::{Database, StoreTransaction};
pub use mem::{MemDb, MemDbConfig, MemTransaction};
pub use object_store::{ObjectStore, ObjectStoreConfig};
pub use record::{ObjectRecord, Stats, StoredRecord};
