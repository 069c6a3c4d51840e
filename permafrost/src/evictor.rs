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

use std::{collections::HashMap, sync::Arc};

use permafrost_common::{code::Servant, error::Result};
use permafrost_store::{Database, IndexSpec};

use crate::{
    holder::ServantHolder,
    identity::{Identity, Request},
    iterator::EvictorIterator,
    simple::SimpleEvictor,
    transactional::TransactionalEvictor,
};

/// Evictor config.
#[derive(Clone)]
pub struct EvictorConfig {
    /// Target resident count per facet cache. A soft cap: pinned records are never evicted, so
    /// the cache may temporarily overshoot while everything resident is checked out.
    pub evictor_size: usize,
    /// Whether access statistics are tracked and written back.
    pub keep_stats: bool,
    /// Whether still-empty secondary indices are back-filled when a facet store opens.
    pub populate_empty_indices: bool,
    /// Whether a user-level operation failure rolls the surrounding transaction back instead of
    /// committing whatever the operation already changed.
    pub rollback_on_user_exception: bool,
    /// How often the dispatch driver re-runs a top-level call after a deadlock.
    pub deadlock_retry_attempts: usize,
    /// Secondary indices per facet.
    pub indices: HashMap<String, Vec<IndexSpec>>,
}

impl Default for EvictorConfig {
    fn default() -> Self {
        Self {
            evictor_size: 10,
            keep_stats: false,
            populate_empty_indices: false,
            rollback_on_user_exception: false,
            deadlock_retry_attempts: 10,
            indices: HashMap::new(),
        }
    }
}

/// The cache + persistence layer between a dispatch layer and a transactional store.
///
/// One interface, two strategies: [`SimpleEvictor`] serves every call from the shared servant
/// cache and writes mutations back in a short transaction per call; [`TransactionalEvictor`]
/// adds per-transaction servant state, the deadlock signaling protocol and
/// commit-then-invalidate cache consistency.
pub trait Evictor<S, D>: Send + Sync
where
    S: Servant,
    D: Database,
{
    /// The dispatch hook: check the target servant out for one call.
    ///
    /// A missing record reports [`ErrorKind::NotFound`], which the dispatch layer surfaces as
    /// its standard no-such-object failure.
    ///
    /// [`ErrorKind::NotFound`]: permafrost_common::error::ErrorKind::NotFound
    fn locate(&self, request: &Request) -> Result<ServantHolder<S, D>>;

    /// Create a brand-new object on a facet.
    ///
    /// Inside an ambient transaction the insert joins it (visible inside, undone by rollback);
    /// otherwise it runs in an immediate transaction of its own.
    fn add_facet(&self, identity: Identity, facet: &str, servant: S) -> Result<()>;

    /// Create a brand-new object on the default facet.
    fn add(&self, identity: Identity, servant: S) -> Result<()> {
        self.add_facet(identity, "", servant)
    }

    /// Destroy an object on a facet, returning its in-memory servant for final cleanup.
    ///
    /// In-flight checkouts of the identity are informed: their shared record is marked removed,
    /// which suppresses persistence of the stale state at teardown.
    fn remove_facet(&self, identity: &Identity, facet: &str) -> Result<Arc<S>>;

    /// Destroy an object on the default facet.
    fn remove(&self, identity: &Identity) -> Result<Arc<S>> {
        self.remove_facet(identity, "")
    }

    /// Whether an object exists on a facet, consistent with the calling context's transactional
    /// snapshot.
    fn has_facet_object(&self, identity: &Identity, facet: &str) -> Result<bool>;

    /// Whether an object exists on the default facet.
    fn has_object(&self, identity: &Identity) -> Result<bool> {
        self.has_facet_object(identity, "")
    }

    /// Adjust the target cache size.
    ///
    /// Open facet caches shrink to the new target where possible; pinned records keep the cache
    /// above target until they are released.
    fn set_size(&self, size: usize) -> Result<()>;

    /// The target cache size.
    fn size(&self) -> usize;

    /// A lazy, batched iterator over a facet's identities.
    ///
    /// Forward-only and not restartable; each batch is fetched in a fresh read transaction, so
    /// the whole table is never resident at once.
    fn iterate(&self, facet: &str, batch_size: usize) -> Result<EvictorIterator<S, D>>;

    /// Tear the evictor down: fence out new calls, drain the in-flight ones, release the caches.
    ///
    /// Exactly one caller performs the teardown; concurrent callers block until it finishes.
    fn destroy(&self) -> Result<()>;
}

/// Builder for the evictor variants.
pub struct EvictorBuilder<D>
where
    D: Database,
{
    db: Arc<D>,
    config: EvictorConfig,
}

impl<D> EvictorBuilder<D>
where
    D: Database,
{
    /// Start building an evictor over the given engine.
    pub fn new(db: Arc<D>) -> Self {
        Self {
            db,
            config: EvictorConfig::default(),
        }
    }

    /// Set the target cache size.
    pub fn with_size(mut self, size: usize) -> Self {
        self.config.evictor_size = size;
        self
    }

    /// Track and persist access statistics.
    pub fn with_keep_stats(mut self, keep_stats: bool) -> Self {
        self.config.keep_stats = keep_stats;
        self
    }

    /// Back-fill still-empty secondary indices when a facet store opens.
    pub fn with_populate_empty_indices(mut self, populate: bool) -> Self {
        self.config.populate_empty_indices = populate;
        self
    }

    /// Roll the transaction back when the operation reports a user-level failure.
    pub fn with_rollback_on_user_exception(mut self, rollback: bool) -> Self {
        self.config.rollback_on_user_exception = rollback;
        self
    }

    /// Bound the dispatch driver's deadlock retries.
    pub fn with_deadlock_retry_attempts(mut self, attempts: usize) -> Self {
        self.config.deadlock_retry_attempts = attempts;
        self
    }

    /// Add a secondary index to a facet.
    pub fn with_index(mut self, facet: impl Into<String>, index: IndexSpec) -> Self {
        self.config.indices.entry(facet.into()).or_default().push(index);
        self
    }

    /// Build the transactional variant.
    pub fn build_transactional<S>(self) -> TransactionalEvictor<S, D>
    where
        S: Servant,
    {
        TransactionalEvictor::new(self.db, self.config)
    }

    /// Build the simple (non-transactional) variant.
    pub fn build_simple<S>(self) -> SimpleEvictor<S, D>
    where
        S: Servant,
    {
        SimpleEvictor::new(self.db, self.config)
    }
}
