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

use permafrost_common::code::{Key, Value};

use crate::record::Record;

/// The eviction container of the cache.
///
/// The container tracks every resident record and decides the victim order. Records acquired by an
/// outstanding entry handle are moved to a pin list and are invisible to [`Eviction::pop`] until
/// released; releasing puts the record back at the most-recently-used position.
///
/// All calls happen under the cache monitor, so implementations are plain `&mut self` state
/// machines and never perform I/O.
pub trait Eviction: Send + Sync + 'static + Default {
    /// Cache key.
    type Key: Key;
    /// Cache value.
    type Value: Value;

    /// Link a new record into the container at the most-recently-used position.
    fn push(&mut self, record: Arc<Record<Self::Key, Self::Value>>);

    /// Unlink and return the next victim, if there is an unpinned record left.
    fn pop(&mut self) -> Option<Arc<Record<Self::Key, Self::Value>>>;

    /// Unlink an arbitrary record, pinned or not.
    fn remove(&mut self, record: &Arc<Record<Self::Key, Self::Value>>);

    /// Pin a linked record, making it ineligible for eviction. Idempotent.
    fn acquire(&mut self, record: &Arc<Record<Self::Key, Self::Value>>);

    /// Unpin a linked record, putting it back at the most-recently-used position. Idempotent.
    fn release(&mut self, record: &Arc<Record<Self::Key, Self::Value>>);

    /// Unlink all records.
    fn clear(&mut self);
}

pub mod lru;
