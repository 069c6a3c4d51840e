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
    fmt::Debug,
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
};

use bitflags::bitflags;
use intrusive_collections::LinkedListAtomicLink;
use permafrost_common::code::{Key, Value};

bitflags! {
    /// Atomic record flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct Flags: u64 {
        /// The record is currently held by the cache indexer.
        const IN_INDEXER = 0b00000001;
        /// The record is currently linked into the eviction container.
        const IN_EVICTION = 0b00000010;
        /// The record is currently on the pin list and ineligible for eviction.
        const PINNED = 0b00000100;
    }
}

/// Immutable payload of a [`Record`].
pub struct Data<K, V>
where
    K: Key,
    V: Value,
{
    /// Cache key.
    pub key: K,
    /// Cached value.
    pub value: V,
    /// Precomputed hash of the key.
    pub hash: u64,
}

/// [`Record`] holds the information of a cached entry.
///
/// Records are shared between the indexer, the eviction lists and any outstanding entry handles
/// through `Arc`; there are no back-pointers and nothing to cycle-collect.
pub struct Record<K, V>
where
    K: Key,
    V: Value,
{
    data: Data<K, V>,
    pub(crate) link: LinkedListAtomicLink,
    refs: AtomicUsize,
    flags: AtomicU64,
}

impl<K, V> Debug for Record<K, V>
where
    K: Key,
    V: Value,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Record").field("hash", &self.data.hash).finish()
    }
}

impl<K, V> Record<K, V>
where
    K: Key,
    V: Value,
{
    /// Create a record with data.
    pub fn new(data: Data<K, V>) -> Self {
        Record {
            data,
            link: LinkedListAtomicLink::new(),
            refs: AtomicUsize::new(0),
            flags: AtomicU64::new(0),
        }
    }

    /// Get the immutable reference of the record key.
    pub fn key(&self) -> &K {
        &self.data.key
    }

    /// Get the immutable reference of the record value.
    pub fn value(&self) -> &V {
        &self.data.value
    }

    /// Get the record hash.
    pub fn hash(&self) -> u64 {
        self.data.hash
    }

    /// Set in indexer flag.
    pub fn set_in_indexer(&self, val: bool) {
        self.set_flags(Flags::IN_INDEXER, val, Ordering::Release);
    }

    /// Get in indexer flag.
    pub fn is_in_indexer(&self) -> bool {
        self.get_flags(Flags::IN_INDEXER, Ordering::Acquire)
    }

    /// Set in eviction flag.
    pub fn set_in_eviction(&self, val: bool) {
        self.set_flags(Flags::IN_EVICTION, val, Ordering::Release);
    }

    /// Get in eviction flag.
    pub fn is_in_eviction(&self) -> bool {
        self.get_flags(Flags::IN_EVICTION, Ordering::Acquire)
    }

    /// Set pinned flag.
    pub fn set_pinned(&self, val: bool) {
        self.set_flags(Flags::PINNED, val, Ordering::Release);
    }

    /// Get pinned flag.
    pub fn is_pinned(&self) -> bool {
        self.get_flags(Flags::PINNED, Ordering::Acquire)
    }

    /// Set the record atomic flags.
    pub fn set_flags(&self, flags: Flags, val: bool, order: Ordering) {
        match val {
            true => self.flags.fetch_or(flags.bits(), order),
            false => self.flags.fetch_and(!flags.bits(), order),
        };
    }

    /// Get the record atomic flags.
    pub fn get_flags(&self, flags: Flags, order: Ordering) -> bool {
        self.flags.load(order) & flags.bits() == flags.bits()
    }

    /// Get the atomic reference count.
    pub fn refs(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    /// Increase the atomic reference count.
    ///
    /// This function returns the new reference count after the op.
    pub fn inc_refs(&self, val: usize) -> usize {
        let old = self.refs.fetch_add(val, Ordering::SeqCst);
        tracing::trace!(
            "[record]: inc record (hash: {}) refs: {} => {}",
            self.hash(),
            old,
            old + val
        );
        old + val
    }

    /// Decrease the atomic reference count.
    ///
    /// This function returns the new reference count after the op.
    pub fn dec_refs(&self, val: usize) -> usize {
        let old = self.refs.fetch_sub(val, Ordering::SeqCst);
        tracing::trace!(
            "[record]: dec record (hash: {}) refs: {} => {}",
            self.hash(),
            old,
            old - val
        );
        old - val
    }
}
