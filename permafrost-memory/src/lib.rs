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

//! Bounded in-memory servant cache for permafrost.
//!
//! The cache maps an identity to its cached record, bounded by a soft capacity and evicting in
//! least-recently-used order. A record referenced by an outstanding [`CacheEntry`] handle is
//! pinned: it sits on a separate pin list and is never an eviction victim, no matter the capacity
//! pressure.

mod cache;
mod eviction;
mod indexer;
mod record;

/// The crate prelude.
pub mod prelude;

pub use cache::{Cache, CacheEntry};
pub use eviction::{lru::Lru, Eviction};
pub use record::{Data, Record};

use ahash::RandomState;

/// A [`Cache`] with the [`Lru`] eviction algorithm.
pub type LruCache<K, V, S = RandomState> = Cache<Lru<K, V>, S>;
/// A [`CacheEntry`] of a [`LruCache`].
pub type LruCacheEntry<K, V, S = RandomState> = CacheEntry<Lru<K, V>, S>;
