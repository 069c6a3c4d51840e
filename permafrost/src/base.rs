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

use parking_lot::{Mutex, RwLock};
use permafrost_common::{
    code::Servant,
    error::{Error, Result},
};
use permafrost_store::{Database, ObjectRecord, ObjectStoreConfig, StoreTransaction};

use crate::{
    deactivate::DeactivateController,
    evictor::EvictorConfig,
    identity::Identity,
    iterator::EvictorIterator,
    FacetStore,
};

/// State shared by both evictor variants: the engine, the lazily-opened per-facet stores, the
/// target cache size and the deactivation barrier.
pub(crate) struct EvictorBase<S, D>
where
    S: Servant,
    D: Database,
{
    db: Arc<D>,
    config: EvictorConfig,
    size: Mutex<usize>,
    stores: RwLock<HashMap<String, Arc<FacetStore<S, D>>>>,
    controller: Arc<DeactivateController>,
}

impl<S, D> EvictorBase<S, D>
where
    S: Servant,
    D: Database,
{
    pub(crate) fn new(db: Arc<D>, config: EvictorConfig) -> Self {
        Self {
            db,
            size: Mutex::new(config.evictor_size),
            config,
            stores: RwLock::new(HashMap::new()),
            controller: Arc::new(DeactivateController::new()),
        }
    }

    pub(crate) fn db(&self) -> &Arc<D> {
        &self.db
    }

    pub(crate) fn config(&self) -> &EvictorConfig {
        &self.config
    }

    pub(crate) fn controller(&self) -> &Arc<DeactivateController> {
        &self.controller
    }

    /// The store serving a facet, opened lazily.
    pub(crate) fn store(&self, facet: &str) -> Result<Arc<FacetStore<S, D>>> {
        if let Some(store) = self.stores.read().get(facet) {
            return Ok(store.clone());
        }

        let mut stores = self.stores.write();
        if let Some(store) = stores.get(facet) {
            return Ok(store.clone());
        }

        let store = FacetStore::open(
            self.db.clone(),
            ObjectStoreConfig {
                facet: facet.to_owned(),
                cache_capacity: *self.size.lock(),
                keep_stats: self.config.keep_stats,
                populate_empty_indices: self.config.populate_empty_indices,
                indices: self.config.indices.get(facet).cloned().unwrap_or_default(),
            },
        )?;
        stores.insert(facet.to_owned(), store.clone());
        tracing::debug!(facet, "[evictor]: opened facet store");
        Ok(store)
    }

    pub(crate) fn set_size(&self, size: usize) {
        let mut target = self.size.lock();
        *target = size;
        for store in self.stores.read().values() {
            store.cache().resize(size);
        }
    }

    pub(crate) fn size(&self) -> usize {
        *self.size.lock()
    }

    pub(crate) fn iterate(&self, facet: &str, batch_size: usize) -> Result<EvictorIterator<S, D>> {
        let store = self.store(facet)?;
        Ok(EvictorIterator::new(store, self.controller.clone(), batch_size))
    }

    /// The teardown sequence: fence, drain, release the caches, complete.
    pub(crate) fn destroy(&self) -> Result<()> {
        if self.controller.deactivate() {
            self.controller.wait_drained();
            for store in self.stores.read().values() {
                store.cache().clear();
            }
            self.controller.deactivation_complete();
        } else {
            self.controller.wait_deactivated();
        }
        Ok(())
    }

    /// One-shot insert in an immediate transaction.
    pub(crate) fn insert_oneshot(
        &self,
        store: &Arc<FacetStore<S, D>>,
        identity: &Identity,
        rec: &ObjectRecord<S>,
    ) -> Result<()> {
        let tx = self.db.begin()?;
        store.insert(identity, rec, &tx)?;
        tx.commit()
    }

    /// One-shot remove in an immediate transaction; informs in-flight cache checkouts and drops
    /// the cached entry after the commit.
    ///
    /// The returned servant is the resident in-memory one when the identity is cached, so
    /// callers clean up the instance that live checkouts actually share.
    pub(crate) fn remove_oneshot(&self, store: &Arc<FacetStore<S, D>>, identity: &Identity) -> Result<Arc<S>> {
        let tx = self.db.begin()?;
        let loaded = match store.load(identity, &tx)? {
            Some(rec) => rec,
            None => return Err(Error::not_found(identity)),
        };
        store.remove(identity, &tx)?;
        tx.commit()?;

        match store.cache().remove(identity) {
            Some(entry) => {
                let rec = entry.value();
                rec.set_removed();
                Ok(rec.servant().clone())
            }
            None => Ok(loaded.servant().clone()),
        }
    }

    /// One-shot existence probe.
    pub(crate) fn exists_oneshot(&self, store: &Arc<FacetStore<S, D>>, identity: &Identity) -> Result<bool> {
        if store.cache().contains(identity) {
            return Ok(true);
        }
        let tx = self.db.begin()?;
        let exists = store.exists(identity, &tx)?;
        tx.rollback()?;
        Ok(exists)
    }
}
