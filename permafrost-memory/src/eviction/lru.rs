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

use intrusive_collections::{intrusive_adapter, LinkedList, LinkedListAtomicLink};
use permafrost_common::{
    code::{Key, Value},
    strict_assert,
};

use super::Eviction;
use crate::record::Record;

intrusive_adapter! { pub Adapter<K, V> = Arc<Record<K, V>>: Record<K, V> { link: LinkedListAtomicLink } where K: Key, V: Value }

/// Lru eviction algorithm.
///
/// Two intrusive lists: `list` keeps the unpinned records in least-recently-used order (victims
/// pop from the front), `pin_list` keeps the records currently held by an entry handle. A pinned
/// record reenters `list` at the tail on release, which is what makes the order "recently used":
/// recency is established when the last handle goes away, not when the lookup happens.
pub struct Lru<K, V>
where
    K: Key,
    V: Value,
{
    list: LinkedList<Adapter<K, V>>,
    pin_list: LinkedList<Adapter<K, V>>,
}

impl<K, V> Default for Lru<K, V>
where
    K: Key,
    V: Value,
{
    fn default() -> Self {
        Self {
            list: LinkedList::new(Adapter::new()),
            pin_list: LinkedList::new(Adapter::new()),
        }
    }
}

impl<K, V> Eviction for Lru<K, V>
where
    K: Key,
    V: Value,
{
    type Key = K;
    type Value = V;

    fn push(&mut self, record: Arc<Record<K, V>>) {
        strict_assert!(!record.link.is_linked());
        strict_assert!(!record.is_pinned());

        record.set_in_eviction(true);
        self.list.push_back(record);
    }

    fn pop(&mut self) -> Option<Arc<Record<K, V>>> {
        let record = self.list.pop_front()?;

        strict_assert!(!record.link.is_linked());
        strict_assert!(!record.is_pinned());

        record.set_in_eviction(false);

        Some(record)
    }

    fn remove(&mut self, record: &Arc<Record<K, V>>) {
        strict_assert!(record.link.is_linked());

        if record.is_pinned() {
            unsafe { self.pin_list.cursor_mut_from_ptr(Arc::as_ptr(record)).remove() };
            record.set_pinned(false);
        } else {
            unsafe { self.list.cursor_mut_from_ptr(Arc::as_ptr(record)).remove() };
        }

        strict_assert!(!record.link.is_linked());

        record.set_in_eviction(false);
    }

    fn acquire(&mut self, record: &Arc<Record<K, V>>) {
        if !record.is_in_eviction() || record.is_pinned() {
            return;
        }

        strict_assert!(record.link.is_linked());

        let r = unsafe { self.list.cursor_mut_from_ptr(Arc::as_ptr(record)).remove() }.unwrap();
        self.pin_list.push_back(r);

        record.set_pinned(true);
    }

    fn release(&mut self, record: &Arc<Record<K, V>>) {
        if !record.is_in_eviction() || !record.is_pinned() {
            return;
        }

        strict_assert!(record.link.is_linked());

        let r = unsafe { self.pin_list.cursor_mut_from_ptr(Arc::as_ptr(record)).remove() }.unwrap();
        self.list.push_back(r);

        record.set_pinned(false);
    }

    fn clear(&mut self) {
        while self.pop().is_some() {}

        // Unlink pinned leftovers to prevent a leak through the intrusive links.
        while let Some(record) = self.pin_list.pop_front() {
            strict_assert!(!record.link.is_linked());
            record.set_pinned(false);
            record.set_in_eviction(false);
        }

        assert!(self.list.is_empty());
        assert!(self.pin_list.is_empty());
    }
}
