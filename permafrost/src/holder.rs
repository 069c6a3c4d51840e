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
    strict_assert,
};
use permafrost_store::{Database, ObjectRecord, StoreTransaction};

use crate::{
    context::{Body, ToInvalidate, TransactionContext},
    deactivate::Guard,
    identity::{Identity, Request},
    FacetStore, ServantEntry,
};

/// A scoped checkout of one servant for the duration of one call.
///
/// The dispatch layer obtains a holder from `locate`, invokes the operation against
/// [`servant`], and reports the outcome with [`finished`]. Dropping the holder without calling
/// [`finished`] completes it as successful.
///
/// While the holder (or any nested holder sharing its checkout) is alive, the identity's cached
/// entry stays pinned and is never an eviction victim. Teardown persists the mutated record
/// through the owning transaction and queues the cache invalidation that is applied after
/// commit.
///
/// [`servant`]: ServantHolder::servant
/// [`finished`]: ServantHolder::finished
pub struct ServantHolder<S, D>
where
    S: Servant,
    D: Database,
{
    ctx: Option<Arc<TransactionContext<S, D>>>,
    store: Arc<FacetStore<S, D>>,
    identity: Identity,
    rec: Arc<ObjectRecord<S>>,
    cache_pin: Option<ServantEntry<S>>,
    read_only: bool,
    /// Whether this holder performed the first checkout of the identity within the transaction
    /// and is responsible for eventual persistence.
    own_servant: bool,
    /// Whether this holder created the transaction and drives its completion.
    root: bool,
    guard: Option<Guard>,
    done: bool,
}

impl<S, D> std::fmt::Debug for ServantHolder<S, D>
where
    S: Servant,
    D: Database,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServantHolder")
            .field("identity", &self.identity)
            .field("read_only", &self.read_only)
            .field("own_servant", &self.own_servant)
            .field("root", &self.root)
            .finish()
    }
}

impl<S, D> ServantHolder<S, D>
where
    S: Servant,
    D: Database,
{
    /// Check a servant out of the given transaction.
    ///
    /// A nested checkout of an identity already on the transaction's holder stack shares the
    /// first checkout's record (read-your-own-writes); a write checkout through a read-only
    /// first checkout is refused. A first checkout reads the record through the transaction and
    /// pins the identity's committed cache entry, if resident.
    pub(crate) fn checkout_transactional(
        ctx: Arc<TransactionContext<S, D>>,
        store: Arc<FacetStore<S, D>>,
        request: &Request,
        guard: Guard,
        root: bool,
    ) -> Result<Self> {
        if let Some(found) = ctx.find_body(&request.identity, &store) {
            if found.read_only && !request.read_only {
                return Err(Error::illegal_state("write operation through a read-only checkout")
                    .with_context("identity", &request.identity)
                    .with_context("operation", &request.operation));
            }
            found.rec.touch();
            return Ok(Self {
                ctx: Some(ctx),
                store,
                identity: request.identity.clone(),
                rec: found.rec,
                cache_pin: None,
                read_only: request.read_only,
                own_servant: false,
                root,
                guard: Some(guard),
                done: false,
            });
        }

        let tx = ctx.tx()?;
        let rec = match store.load(&request.identity, &tx)? {
            Some(rec) => Arc::new(rec),
            None => return Err(Error::not_found(&request.identity)),
        };
        rec.touch();

        let cache_pin = store.cache().get(&request.identity);

        ctx.push_body(Body {
            identity: request.identity.clone(),
            store: store.clone(),
            rec: rec.clone(),
            read_only: request.read_only,
        });

        Ok(Self {
            ctx: Some(ctx),
            store,
            identity: request.identity.clone(),
            rec,
            cache_pin,
            read_only: request.read_only,
            own_servant: true,
            root,
            guard: Some(guard),
            done: false,
        })
    }

    /// Check a servant out of the committed cache, outside any shared transaction.
    ///
    /// On a miss the record is faulted in from the store in a short transaction of its own and
    /// inserted into the cache, evicting colder unpinned records on capacity pressure.
    pub(crate) fn checkout_cached(
        store: Arc<FacetStore<S, D>>,
        request: &Request,
        guard: Guard,
    ) -> Result<Self> {
        let (rec, cache_pin) = match store.cache().get(&request.identity) {
            Some(entry) => (entry.value().clone(), entry),
            None => {
                let tx = store.db().begin()?;
                let rec = store.load(&request.identity, &tx)?;
                tx.commit()?;
                let Some(rec) = rec else {
                    return Err(Error::not_found(&request.identity));
                };
                let rec = Arc::new(rec);
                let entry = store.cache().insert(request.identity.clone(), rec.clone());
                (rec, entry)
            }
        };
        rec.touch();

        Ok(Self {
            ctx: None,
            store,
            identity: request.identity.clone(),
            rec,
            cache_pin: Some(cache_pin),
            read_only: request.read_only,
            own_servant: true,
            root: false,
            guard: Some(guard),
            done: false,
        })
    }

    /// The checked-out servant.
    pub fn servant(&self) -> &Arc<S> {
        self.rec.servant()
    }

    /// The checked-out identity.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// The transaction this checkout participates in, if any.
    pub fn context(&self) -> Option<&Arc<TransactionContext<S, D>>> {
        self.ctx.as_ref()
    }

    /// Mark the servant state as mutated, forcing persistence at teardown.
    ///
    /// Checkouts through a non-read-only request are marked automatically.
    pub fn mark_mutated(&self) {
        self.rec.set_mutated();
    }

    /// Classify an exception thrown by the operation body, per the transaction's protocol.
    ///
    /// Returns true when the error propagates ordinarily; false when it was captured by the
    /// transaction (a deadlock on the owning thread) and the caller's generic failure path
    /// should stand down.
    pub fn exception(&self, err: &Error) -> bool {
        match &self.ctx {
            Some(ctx) => ctx.exception(err),
            None => true,
        }
    }

    /// Complete the call; `ok = false` reports a user-level failure of the operation body.
    pub fn finished(mut self, ok: bool) -> Result<()> {
        self.complete(ok)
    }

    fn complete(&mut self, ok: bool) -> Result<()> {
        if self.done {
            return Ok(());
        }
        self.done = true;

        let result = match self.ctx.clone() {
            None => self.complete_cached(ok),
            Some(ctx) => self.complete_transactional(&ctx, ok),
        };

        // The pin is released only after persistence, and the dispatch guard last of all.
        self.cache_pin = None;
        self.guard = None;

        result
    }

    /// Teardown of a cache checkout: write back mutations (and statistics, for a store that
    /// keeps them) in a short transaction of this call's own.
    fn complete_cached(&mut self, ok: bool) -> Result<()> {
        if !self.read_only && ok {
            self.rec.set_mutated();
        }
        if self.rec.is_removed() {
            return Ok(());
        }

        let mutated = self.rec.take_mutated();
        if !mutated && !self.store.keep_stats() {
            return Ok(());
        }

        let result = (|| {
            let tx = self.store.db().begin()?;
            self.store.update(&self.identity, &self.rec, &tx)?;
            tx.commit()
        })();
        if result.is_err() && mutated {
            self.rec.set_mutated();
        }
        result
    }

    fn complete_transactional(&mut self, ctx: &Arc<TransactionContext<S, D>>, ok: bool) -> Result<()> {
        if self.own_servant {
            let body = ctx.pop_body(&self.identity, &self.rec);
            strict_assert!(Arc::ptr_eq(&body.rec, &self.rec));
            drop(body);

            if !self.read_only {
                self.rec.set_mutated();
            }

            if self.rec.is_removed() {
                self.queue_invalidate(ctx);
            } else if self.rec.take_mutated() || self.store.keep_stats() {
                let persisted: Result<()> = (|| {
                    let tx = ctx.tx()?;
                    self.store.update(&self.identity, &self.rec, &tx)
                })();
                match persisted {
                    Ok(()) => self.queue_invalidate(ctx),
                    Err(err) => {
                        tracing::debug!(%err, identity = %self.identity, "[servant holder]: persistence failed");
                        if ctx.exception(&err) {
                            ctx.record_failure(&err);
                        }
                    }
                }
            }
        }

        if self.root {
            return self.complete_root(ctx, ok);
        }

        let proceed = ctx.response(ok);
        if !proceed {
            // A non-owning participant learned the shared transaction deadlocked; its work must
            // be redone from scratch.
            return Err(Error::nested_deadlock());
        }
        Ok(())
    }

    /// Completion of the top-level call: settle the captured-deadlock protocol, then commit or
    /// roll back and run post-completion.
    fn complete_root(&mut self, ctx: &Arc<TransactionContext<S, D>>, ok: bool) -> Result<()> {
        let _ = ctx.response(ok);

        if let Err(err) = ctx.check_deadlock_exception() {
            ctx.deadlock_exception();
            ctx.post_completion(false, true);
            return Err(err);
        }

        if let Some(failure) = ctx.take_failure() {
            if let Err(err) = ctx.rollback() {
                tracing::warn!(%err, "[servant holder]: rollback after failure failed");
            }
            ctx.post_completion(false, false);
            return Err(failure);
        }

        if ctx.user_rollback_requested() {
            if let Err(err) = ctx.rollback() {
                tracing::warn!(%err, "[servant holder]: rollback after user exception failed");
            }
            ctx.post_completion(false, false);
            return Ok(());
        }

        match ctx.commit() {
            Ok(()) => {
                ctx.post_completion(true, false);
                Ok(())
            }
            Err(err) if err.is_deadlock() => {
                ctx.deadlock_exception();
                ctx.post_completion(false, true);
                Err(err)
            }
            Err(err) => {
                ctx.post_completion(false, false);
                Err(err)
            }
        }
    }

    fn queue_invalidate(&self, ctx: &Arc<TransactionContext<S, D>>) {
        let controller = self
            .guard
            .as_ref()
            .expect("dispatch guard released before teardown")
            .controller();
        match Guard::new(controller) {
            Ok(guard) => {
                ctx.queue_invalidate(ToInvalidate::new(self.identity.clone(), self.store.clone(), guard));
            }
            Err(err) => {
                if ctx.exception(&err) {
                    ctx.record_failure(&err);
                }
            }
        }
    }
}

impl<S, D> Drop for ServantHolder<S, D>
where
    S: Servant,
    D: Database,
{
    fn drop(&mut self) {
        if !self.done {
            if let Err(err) = self.complete(true) {
                tracing::warn!(%err, identity = %self.identity, "[servant holder]: completion failed");
            }
        }
    }
}
