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

use permafrost_common::{
    code::Servant,
    error::{Error, Result},
};
use permafrost_store::{Database, ObjectRecord};

use crate::{
    base::EvictorBase,
    context::{current, set_current, TransactionContext},
    deactivate::Guard,
    evictor::{Evictor, EvictorConfig},
    holder::ServantHolder,
    identity::{Identity, Request},
    iterator::EvictorIterator,
    FacetStore,
};

/// The transactional evictor.
///
/// Mutating calls run inside a [`TransactionContext`]: the servant state they see is private to
/// the transaction (a fresh read through the engine transaction), nested checkouts of the same
/// identity share that state, and the committed cache entry is only invalidated after the
/// transaction commits. Read-only calls outside any transaction are served straight from the
/// committed cache.
///
/// Deadlocks surface with a retryable kind; [`dispatch`] is the bundled retry driver that
/// re-runs the whole top-level call, and the [`TransactionContext`] protocol lets callers wire
/// their own.
///
/// [`dispatch`]: TransactionalEvictor::dispatch
pub struct TransactionalEvictor<S, D>
where
    S: Servant,
    D: Database,
{
    base: Arc<EvictorBase<S, D>>,
}

impl<S, D> Clone for TransactionalEvictor<S, D>
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

impl<S, D> TransactionalEvictor<S, D>
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

    /// Run one top-level call under the bundled retry driver.
    ///
    /// The operation body `f` runs against the located holder; a retryable failure (a detected
    /// deadlock) re-runs the whole call from scratch, up to the configured attempt bound.
    /// Dispatches nested inside an ambient transaction are never retried here; the deadlock
    /// propagates so the transaction's own top level can redo everything.
    pub fn dispatch<R>(
        &self,
        request: &Request,
        f: impl Fn(&ServantHolder<S, D>) -> Result<R>,
    ) -> Result<R> {
        let top_level = current::<S, D>().is_none();
        let mut attempt = 0;

        loop {
            match self.dispatch_once(request, &f) {
                Err(err)
                    if top_level && err.is_retryable() && attempt < self.base.config().deadlock_retry_attempts =>
                {
                    attempt += 1;
                    tracing::debug!(%err, attempt, operation = %request.operation, "[evictor]: retrying dispatch after deadlock");
                }
                result => return result,
            }
        }
    }

    fn dispatch_once<R>(&self, request: &Request, f: &impl Fn(&ServantHolder<S, D>) -> Result<R>) -> Result<R> {
        let holder = self.locate(request)?;

        match f(&holder) {
            Ok(value) => {
                holder.finished(true)?;
                Ok(value)
            }
            Err(err) => {
                if holder.exception(&err) {
                    // Ordinary failure: complete with a user-exception outcome. A retryable
                    // completion failure outranks the user error, the driver can act on it.
                    match holder.finished(false) {
                        Err(completion) if completion.is_retryable() => Err(completion),
                        _ => Err(err),
                    }
                } else {
                    // Captured deadlock: completion settles the protocol and re-throws.
                    match holder.finished(true) {
                        Err(completion) => Err(completion),
                        Ok(()) => Err(err),
                    }
                }
            }
        }
    }

    fn begin_context(&self) -> Result<Arc<TransactionContext<S, D>>> {
        let tx = self.base.db().begin()?;
        let ctx = TransactionContext::new(tx, self.base.config().rollback_on_user_exception);
        set_current(&ctx)?;
        Ok(ctx)
    }
}

impl<S, D> Evictor<S, D> for TransactionalEvictor<S, D>
where
    S: Servant,
    D: Database,
{
    fn locate(&self, request: &Request) -> Result<ServantHolder<S, D>> {
        let guard = Guard::new(self.base.controller())?;
        let store = self.base.store(&request.facet)?;

        // Nested call: join the calling thread's transaction.
        if let Some(ctx) = current::<S, D>() {
            return ServantHolder::checkout_transactional(ctx, store, request, guard, false);
        }

        // Read-only top-level call: serve from the committed cache, no transaction.
        if request.read_only {
            return ServantHolder::checkout_cached(store, request, guard);
        }

        // Mutating top-level call: open the transaction this dispatch will own.
        let ctx = self.begin_context()?;
        match ServantHolder::checkout_transactional(ctx.clone(), store, request, guard, true) {
            Ok(holder) => Ok(holder),
            Err(err) => {
                // The call body never ran; unwind the transaction created above.
                let deadlock = err.is_deadlock();
                if deadlock {
                    ctx.deadlock_exception();
                } else if let Err(rollback_err) = ctx.rollback() {
                    tracing::warn!(%rollback_err, "[evictor]: rollback after failed checkout failed");
                }
                ctx.post_completion(false, deadlock);
                Err(err)
            }
        }
    }

    fn add_facet(&self, identity: Identity, facet: &str, servant: S) -> Result<()> {
        let _guard = Guard::new(self.base.controller())?;
        let store = self.base.store(facet)?;
        let rec = ObjectRecord::fresh(Arc::new(servant));

        match current::<S, D>() {
            Some(ctx) => {
                let tx = ctx.tx()?;
                store.insert(&identity, &rec, &tx)
            }
            None => self.base.insert_oneshot(&store, &identity, &rec),
        }
    }

    fn remove_facet(&self, identity: &Identity, facet: &str) -> Result<Arc<S>> {
        let _guard = Guard::new(self.base.controller())?;
        let store = self.base.store(facet)?;

        let Some(ctx) = current::<S, D>() else {
            return self.base.remove_oneshot(&store, identity);
        };

        let tx = ctx.tx()?;
        let loaded = match store.load(identity, &tx)? {
            Some(rec) => rec,
            None => return Err(Error::not_found(identity)),
        };
        store.remove(identity, &tx)?;

        let marker_guard = Guard::new(self.base.controller())?;
        match ctx.servant_removed(identity, &store, marker_guard) {
            // Checked out on the stack: the shared record was marked removed and the unwinding
            // holder queues the invalidation.
            Some(servant) => Ok(servant),
            None => Ok(loaded.servant().clone()),
        }
    }

    fn has_facet_object(&self, identity: &Identity, facet: &str) -> Result<bool> {
        let _guard = Guard::new(self.base.controller())?;
        let store = self.base.store(facet)?;

        if let Some(ctx) = current::<S, D>() {
            if let Some(found) = ctx.find_body(identity, &store) {
                return Ok(!found.rec.is_removed());
            }
            let tx = ctx.tx()?;
            return store.exists(identity, &tx);
        }

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
