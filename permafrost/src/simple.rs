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

use permafrost_common::{code::Servant, error::Result};
use permafrost_store::{Database, ObjectRecord};

use crate::{
    base::EvictorBase,
    deactivate::Guard,
    evictor::{Evictor, EvictorConfig},
    holder::ServantHolder,
    identity::{Identity, Request},
    iterator::EvictorIterator,
    FacetStore,
};

/// The simple (non-transactional) evictor.
///
/// Every call is served from the shared servant cache; mutations are written back in a short
/// transaction per call at holder teardown. There is no cross-call transaction sharing and no
/// deadlock protocol; concurrent mutations of one servant are the application's business.
pub struct SimpleEvictor<S, D>
where
    S: Servant,
    D: Database,
{
    base: Arc<EvictorBase<S, D>>,
}

impl<S, D> Clone for SimpleEvictor<S, D>
where
    S: Servant,
    D: Database,
{
    fn clone(&self) -> Self {
        Self {
            base: self.base.clone(),
        }
    }
}

impl<S, D> SimpleEvictor<S, D>
where
    S: Servant,
    D: Database,
{
    pub(crate) fn new(db: Arc<D>, config: EvictorConfig) -> Self {
        Self {
            base: Arc::new(EvictorBase::new(db, config)),
        }
    }

    /// Administrative accessor for a facet's store (and through it, its cache).
    pub fn facet_store(&self, facet: &str) -> Result<Arc<FacetStore<S, D>>> {
        self.base.store(facet)
    }
}

impl<S, D> Evictor<S, D> for SimpleEvictor<S, D>
where
    S: Servant,
    D: Database,
{
    fn locate(&self, request: &Request) -> Result<ServantHolder<S, D>> {
        let guard = Guard::new(self.base.controller())?;
        let store = self.base.store(&request.facet)?;
        ServantHolder::checkout_cached(store, request, guard)
    }

    fn add_facet(&self, identity: Identity, facet: &str, servant: S) -> Result<()> {
        let _guard = Guard::new(self.base.controller())?;
        let store = self.base.store(facet)?;
        let rec = ObjectRecord::fresh(Arc::new(servant));
        self.base.insert_oneshot(&store, &identity, &rec)
    }

    fn remove_facet(&self, identity: &Identity, facet: &str) -> Result<Arc<S>> {
        let _guard = Guard::new(self.base.controller())?;
        let store = self.base.store(facet)?;
        self.base.remove_oneshot(&store, identity)
    }

    fn has_facet_object(&self, identity: &Identity, facet: &str) -> Result<bool> {
        let _guard = Guard::new(self.base.controller())?;
        let store = self.base.store(facet)?;
        self.base.exists_oneshot(&store, identity)
    }

    fn set_size(&self, size: usize) -> Result<()> {
        let _guard = Guard::new(self.base.controller())?;
        self.base.set_size(size);
        Ok(())
    }

    fn size(&self) -> usize {
        self.base.size()
    }

    fn iterate(&self, facet: &str, batch_size: usize) -> Result<EvictorIterator<S, D>> {
        let _guard = Guard::new(self.base.controller())?;
        self.base.iterate(facet, batch_size)
    }

    fn destroy(&self) -> Result<()> {
        self.base.destroy()
    }
}
