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
    atomic::{AtomicBool, Ordering},
    Arc,
};

use parking_lot::Mutex;
use permafrost_common::clock;
use serde::{Deserialize, Serialize};

/// Access statistics of a persistent object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    /// Creation time, unix millis.
    pub created_ms: u64,
    /// Last access time, unix millis.
    pub last_access_ms: u64,
    /// How often the object has been checked out.
    pub use_count: u64,
}

impl Default for Stats {
    fn default() -> Self {
        let now = clock::unix_millis();
        Self {
            created_ms: now,
            last_access_ms: now,
            use_count: 0,
        }
    }
}

impl Stats {
    fn touch(&mut self) {
        self.last_access_ms = clock::unix_millis();
        self.use_count += 1;
    }
}

/// The persisted envelope of one object: access statistics plus the opaque servant payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredRecord {
    /// Access statistics at save time.
    pub stats: Stats,
    /// Opaque servant payload.
    pub payload: Vec<u8>,
}

/// The in-memory representation of one persistent object.
///
/// The servant itself is shared; checkout bookkeeping (mutation and removal marks) lives here so
/// that nested checkouts of the same identity within one transaction observe one shared state.
pub struct ObjectRecord<S> {
    servant: Arc<S>,
    stats: Mutex<Stats>,
    mutated: AtomicBool,
    removed: AtomicBool,
}

impl<S> std::fmt::Debug for ObjectRecord<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectRecord")
            .field("stats", &self.stats_snapshot())
            .field("mutated", &self.is_mutated())
            .field("removed", &self.is_removed())
            .finish()
    }
}

impl<S> ObjectRecord<S> {
    /// Wrap a servant with the given statistics.
    pub fn new(servant: Arc<S>, stats: Stats) -> Self {
        Self {
            servant,
            stats: Mutex::new(stats),
            mutated: AtomicBool::new(false),
            removed: AtomicBool::new(false),
        }
    }

    /// Wrap a freshly created servant.
    pub fn fresh(servant: Arc<S>) -> Self {
        Self::new(servant, Stats::default())
    }

    /// The shared servant.
    pub fn servant(&self) -> &Arc<S> {
        &self.servant
    }

    /// A copy of the current statistics.
    pub fn stats_snapshot(&self) -> Stats {
        *self.stats.lock()
    }

    /// Record a checkout in the statistics.
    pub fn touch(&self) {
        self.stats.lock().touch();
    }

    /// Mark the record as carrying unpersisted servant mutations.
    pub fn set_mutated(&self) {
        self.mutated.store(true, Ordering::Release);
    }

    /// Drop the mutation mark, returning whether it was set.
    pub fn take_mutated(&self) -> bool {
        self.mutated.swap(false, Ordering::AcqRel)
    }

    /// Whether the record carries unpersisted servant mutations.
    pub fn is_mutated(&self) -> bool {
        self.mutated.load(Ordering::Acquire)
    }

    /// Mark the object as destroyed; persistence of stale state is suppressed from here on.
    pub fn set_removed(&self) {
        self.removed.store(true, Ordering::Release);
    }

    /// Whether the object was destroyed while checked out.
    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }
}
