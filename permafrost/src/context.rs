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
    any::Any,
    cell::RefCell,
    sync::Arc,
    thread::{self, ThreadId},
};

use parking_lot::{Condvar, Mutex};
use permafrost_common::{
    code::Servant,
    error::{Error, Result},
    strict_assert,
};
use permafrost_store::{Database, ObjectRecord, StoreTransaction};

use crate::{deactivate::Guard, identity::Identity, FacetStore};

/// A checkout record on the transaction's holder stack.
pub(crate) struct Body<S, D>
where
    S: Servant,
    D: Database,
{
    pub(crate) identity: Identity,
    pub(crate) store: Arc<FacetStore<S, D>>,
    pub(crate) rec: Arc<ObjectRecord<S>>,
    pub(crate) read_only: bool,
}

/// The shared state of an already-checked-out identity, handed to nested checkouts.
pub(crate) struct FoundBody<S> {
    pub(crate) rec: Arc<ObjectRecord<S>>,
    pub(crate) read_only: bool,
}

/// A pending cache invalidation, applied after the owning transaction commits.
///
/// Each marker holds its own deactivation guard so the evictor cannot finish tearing down while
/// an invalidation is pending; the guard is released when the marker is consumed.
pub(crate) struct ToInvalidate<S, D>
where
    S: Servant,
    D: Database,
{
    identity: Identity,
    store: Arc<FacetStore<S, D>>,
    _guard: Guard,
}

impl<S, D> ToInvalidate<S, D>
where
    S: Servant,
    D: Database,
{
    pub(crate) fn new(identity: Identity, store: Arc<FacetStore<S, D>>, guard: Guard) -> Self {
        Self {
            identity,
            store,
            _guard: guard,
        }
    }

    fn apply(self) {
        tracing::trace!(identity = %self.identity, "[transaction]: invalidate cached entry");
        self.store.cache().remove(&self.identity);
    }
}

struct Inner<S, D>
where
    S: Servant,
    D: Database,
{
    /// The underlying engine transaction; cleared exactly once at finalize.
    tx: Option<Arc<D::Tx>>,
    /// The holder stack, most recent checkout last.
    holders: Vec<Body<S, D>>,
    invalidate: Vec<ToInvalidate<S, D>>,
    deadlock_detected: bool,
    finalized: bool,
    user_exception: bool,
    /// A deadlock-kind error captured on the owning thread, re-thrown at completion.
    captured: Option<Error>,
    /// The first hard (non-deadlock) failure seen inside the transaction.
    failure: Option<Error>,
}

/// One active transaction of the transactional evictor.
///
/// The context is shared by every dispatch participating in the same logical transaction: nested
/// calls on the owning thread pick it up from the thread-current slot, helper threads adopt it
/// with [`attach`]. It tracks the stack of checked-out servants, accumulates the set of cache
/// invalidations to apply after commit, and implements the deadlock signaling protocol between
/// the owning thread and the other participants.
///
/// The whole thing is a monitor: one mutex and one condition variable; [`response`] from a
/// non-owning thread is the only blocking point.
///
/// [`attach`]: TransactionContext::attach
/// [`response`]: TransactionContext::response
pub struct TransactionContext<S, D>
where
    S: Servant,
    D: Database,
{
    owner: ThreadId,
    rollback_on_user_exception: bool,
    inner: Mutex<Inner<S, D>>,
    cond: Condvar,
}

impl<S, D> std::fmt::Debug for TransactionContext<S, D>
where
    S: Servant,
    D: Database,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionContext").field("owner", &self.owner).finish()
    }
}

impl<S, D> TransactionContext<S, D>
where
    S: Servant,
    D: Database,
{
    pub(crate) fn new(tx: D::Tx, rollback_on_user_exception: bool) -> Arc<Self> {
        Arc::new(Self {
            owner: thread::current().id(),
            rollback_on_user_exception,
            inner: Mutex::new(Inner {
                tx: Some(Arc::new(tx)),
                holders: Vec::new(),
                invalidate: Vec::new(),
                deadlock_detected: false,
                finalized: false,
                user_exception: false,
                captured: None,
                failure: None,
            }),
            cond: Condvar::new(),
        })
    }

    /// Whether the calling thread owns this transaction.
    pub fn is_owner(&self) -> bool {
        thread::current().id() == self.owner
    }

    /// The engine transaction, while still active.
    pub(crate) fn tx(&self) -> Result<Arc<D::Tx>> {
        self.inner
            .lock()
            .tx
            .clone()
            .ok_or_else(|| Error::illegal_state("transaction already completed"))
    }

    /// Scan the holder stack, most recent checkout first, for `(identity, store)`.
    ///
    /// The scan is linear over the call nesting depth, not the cache size.
    pub(crate) fn find_body(&self, identity: &Identity, store: &Arc<FacetStore<S, D>>) -> Option<FoundBody<S>> {
        let inner = self.inner.lock();
        inner
            .holders
            .iter()
            .rev()
            .find(|body| body.identity == *identity && Arc::ptr_eq(&body.store, store))
            .map(|body| FoundBody {
                rec: body.rec.clone(),
                read_only: body.read_only,
            })
    }

    pub(crate) fn push_body(&self, body: Body<S, D>) {
        self.inner.lock().holders.push(body);
    }

    /// Unwind the checkout owning `rec`.
    ///
    /// Calls unwind LIFO within a thread, so this is almost always the top of the stack; the
    /// search from the top also covers sub-calls on attached threads unwinding out of order.
    pub(crate) fn pop_body(&self, identity: &Identity, rec: &Arc<ObjectRecord<S>>) -> Body<S, D> {
        let mut inner = self.inner.lock();
        let index = inner
            .holders
            .iter()
            .rposition(|body| body.identity == *identity && Arc::ptr_eq(&body.rec, rec))
            .expect("holder stack corrupted");
        inner.holders.remove(index)
    }

    /// Handle the destruction of an object while this transaction is active.
    ///
    /// If the identity is checked out on the holder stack, its shared record is marked removed
    /// (suppressing persistence of the stale state; the unwinding holder queues the invalidation)
    /// and the in-memory servant is returned for further cleanup. Otherwise an invalidation
    /// marker is queued right away.
    pub(crate) fn servant_removed(
        &self,
        identity: &Identity,
        store: &Arc<FacetStore<S, D>>,
        guard: Guard,
    ) -> Option<Arc<S>> {
        let mut inner = self.inner.lock();
        if let Some(body) = inner
            .holders
            .iter()
            .rev()
            .find(|body| body.identity == *identity && Arc::ptr_eq(&body.store, store))
        {
            body.rec.set_removed();
            return Some(body.rec.servant().clone());
        }
        inner.invalidate.push(ToInvalidate::new(identity.clone(), store.clone(), guard));
        None
    }

    pub(crate) fn queue_invalidate(&self, marker: ToInvalidate<S, D>) {
        self.inner.lock().invalidate.push(marker);
    }

    /// An operation inside the transaction completed; `ok = false` reports a user-level failure.
    ///
    /// Called by the owning thread this only records the outcome and returns true immediately.
    /// Called by any other thread sharing the transaction it blocks until the owner's
    /// transaction reaches a terminal state, then reports whether the work may stand
    /// (`false` means a deadlock was detected and the caller should redo its work).
    pub fn response(&self, ok: bool) -> bool {
        if self.is_owner() {
            let mut inner = self.inner.lock();
            if !ok {
                inner.user_exception = true;
            }
            return true;
        }

        let mut inner = self.inner.lock();
        while !inner.finalized && !inner.deadlock_detected {
            self.cond.wait(&mut inner);
        }
        !inner.deadlock_detected
    }

    /// Classify an exception thrown by work inside the transaction.
    ///
    /// A deadlock-kind error on the owning thread is captured for delayed re-throw and `false`
    /// is returned so the caller's generic failure path stands down. Everything else returns
    /// `true` and propagates ordinarily.
    pub fn exception(&self, err: &Error) -> bool {
        if self.is_owner() && err.is_deadlock() {
            let mut inner = self.inner.lock();
            if inner.captured.is_none() {
                tracing::debug!(%err, "[transaction]: captured deadlock");
                inner.captured = Some(err.clone());
            }
            return false;
        }
        true
    }

    /// Re-throw a previously captured deadlock, if any.
    pub fn check_deadlock_exception(&self) -> Result<()> {
        match self.inner.lock().captured.clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Mark the transaction as deadlocked: wake the threads blocked in [`response`] and roll the
    /// underlying transaction back.
    ///
    /// [`response`]: TransactionContext::response
    pub fn deadlock_exception(&self) {
        let tx = {
            let mut inner = self.inner.lock();
            inner.deadlock_detected = true;
            self.cond.notify_all();
            inner.tx.clone()
        };
        if let Some(tx) = tx {
            if let Err(err) = tx.rollback() {
                tracing::warn!(%err, "[transaction]: rollback after deadlock failed");
            }
        }
    }

    /// Commit the underlying transaction, if still active.
    pub fn commit(&self) -> Result<()> {
        match self.inner.lock().tx.clone() {
            Some(tx) => tx.commit(),
            None => Ok(()),
        }
    }

    /// Roll the underlying transaction back, if still active.
    pub fn rollback(&self) -> Result<()> {
        match self.inner.lock().tx.clone() {
            Some(tx) => tx.rollback(),
            None => Ok(()),
        }
    }

    /// Remember the first hard failure seen inside the transaction.
    pub(crate) fn record_failure(&self, err: &Error) {
        let mut inner = self.inner.lock();
        if inner.failure.is_none() {
            inner.failure = Some(err.clone());
        }
    }

    pub(crate) fn take_failure(&self) -> Option<Error> {
        self.inner.lock().failure.take()
    }

    pub(crate) fn user_rollback_requested(&self) -> bool {
        self.rollback_on_user_exception && self.inner.lock().user_exception
    }

    /// Runs after the underlying transaction actually committed or aborted.
    ///
    /// Clears the calling thread's current-transaction slot, applies the accumulated cache
    /// invalidations when committed, and finalizes. Finalize runs exactly once per transaction,
    /// whatever happens to the invalidation set.
    pub(crate) fn post_completion(&self, committed: bool, deadlock: bool) {
        clear_current_if(self);

        let invalidate = std::mem::take(&mut self.inner.lock().invalidate);
        if committed {
            for marker in invalidate {
                marker.apply();
            }
        } else {
            // Abandoned markers release their deactivation guards without touching the cache.
            drop(invalidate);
        }

        self.finalize(deadlock);
    }

    fn finalize(&self, deadlock: bool) {
        let mut inner = self.inner.lock();
        strict_assert!(!inner.finalized);
        inner.tx = None;
        inner.deadlock_detected |= deadlock;
        inner.finalized = true;
        self.cond.notify_all();
    }

    /// Adopt this transaction on the calling thread, so its dispatches join it.
    ///
    /// Fails if the thread already has a current transaction. The adoption ends when the
    /// returned guard drops.
    pub fn attach(self: &Arc<Self>) -> Result<AttachGuard<S, D>> {
        set_current(self)?;
        Ok(AttachGuard { ctx: self.clone() })
    }
}

/// Scoped adoption of a [`TransactionContext`] on a helper thread.
pub struct AttachGuard<S, D>
where
    S: Servant,
    D: Database,
{
    ctx: Arc<TransactionContext<S, D>>,
}

impl<S, D> Drop for AttachGuard<S, D>
where
    S: Servant,
    D: Database,
{
    fn drop(&mut self) {
        clear_current_if(&self.ctx);
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<dyn Any + Send + Sync>>> = const { RefCell::new(None) };
}

/// The calling thread's current transaction, if it is inside one.
pub fn current<S, D>() -> Option<Arc<TransactionContext<S, D>>>
where
    S: Servant,
    D: Database,
{
    CURRENT
        .with(|slot| slot.borrow().clone())
        .and_then(|any| any.downcast::<TransactionContext<S, D>>().ok())
}

pub(crate) fn set_current<S, D>(ctx: &Arc<TransactionContext<S, D>>) -> Result<()>
where
    S: Servant,
    D: Database,
{
    CURRENT.with(|slot| {
        let mut slot = slot.borrow_mut();
        if slot.is_some() {
            return Err(Error::illegal_state("a transaction is already current on this thread"));
        }
        *slot = Some(ctx.clone());
        Ok(())
    })
}

pub(crate) fn clear_current_if<S, D>(ctx: &TransactionContext<S, D>)
where
    S: Servant,
    D: Database,
{
    CURRENT.with(|slot| {
        let mut slot = slot.borrow_mut();
        let matches = slot
            .as_ref()
            .cloned()
            .and_then(|any| any.downcast::<TransactionContext<S, D>>().ok())
            .is_some_and(|cur| std::ptr::eq(Arc::as_ptr(&cur), ctx as *const _));
        if matches {
            *slot = None;
        }
    });
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use permafrost_common::error::ErrorKind;
    use permafrost_store::{MemDb, ObjectStoreConfig};

    use super::*;
    use crate::deactivate::DeactivateController;

    struct Noop;

    impl Servant for Noop {
        fn encode(&self) -> Result<Vec<u8>> {
            Ok(vec![])
        }

        fn decode(_: &[u8]) -> Result<Self> {
            Ok(Noop)
        }
    }

    type Ctx = TransactionContext<Noop, MemDb>;

    fn ctx() -> (Arc<MemDb>, Arc<Ctx>) {
        let db = Arc::new(MemDb::default());
        let tx = db.begin().unwrap();
        (db, Ctx::new(tx, false))
    }

    #[test]
    fn test_owner_response_is_immediate() {
        let (_db, ctx) = ctx();
        assert!(ctx.response(true));
        assert!(ctx.response(false));
        ctx.post_completion(false, false);
    }

    #[test]
    fn test_non_owner_response_waits_for_finalize() {
        let (_db, ctx) = ctx();

        let (tx_started, rx_started) = std::sync::mpsc::channel();
        let waiter = {
            let ctx = ctx.clone();
            std::thread::spawn(move || {
                tx_started.send(()).unwrap();
                ctx.response(true)
            })
        };

        rx_started.recv().unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());

        ctx.post_completion(true, false);
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_non_owner_woken_by_deadlock() {
        let (_db, ctx) = ctx();

        let waiter = {
            let ctx = ctx.clone();
            std::thread::spawn(move || ctx.response(true))
        };

        std::thread::sleep(Duration::from_millis(20));
        ctx.deadlock_exception();

        // The waiter reports do-not-proceed.
        assert!(!waiter.join().unwrap());

        ctx.post_completion(false, true);
    }

    #[test]
    fn test_exception_classification() {
        let (_db, ctx) = ctx();

        // Owner + deadlock kind: captured, specially handled.
        assert!(!ctx.exception(&Error::deadlock("conflict")));
        let err = ctx.check_deadlock_exception().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Deadlock);

        // Owner + other kinds: ordinary propagation.
        assert!(ctx.exception(&Error::not_found("x")));

        // Non-owner threads never capture.
        let ctx2 = ctx.clone();
        let handled = std::thread::spawn(move || ctx2.exception(&Error::deadlock("conflict")))
            .join()
            .unwrap();
        assert!(handled);

        ctx.post_completion(false, true);
    }

    #[test]
    fn test_deadlock_exception_rolls_back() {
        let db = Arc::new(MemDb::default());
        db.open_table("objects").unwrap();

        let tx = db.begin().unwrap();
        tx.put("objects", b"k", b"v").unwrap();
        let ctx = Ctx::new(tx, false);

        ctx.deadlock_exception();
        ctx.post_completion(false, true);

        let probe = db.begin().unwrap();
        assert_eq!(probe.get("objects", b"k").unwrap(), None);
    }

    #[test]
    fn test_invalidation_applied_only_on_commit() {
        let db = Arc::new(MemDb::default());
        let store = FacetStore::<Noop, MemDb>::open(db.clone(), ObjectStoreConfig::default()).unwrap();
        let controller = Arc::new(DeactivateController::new());
        let identity = Identity::new("o", "c");

        store
            .cache()
            .insert(identity.clone(), Arc::new(ObjectRecord::fresh(Arc::new(Noop))));
        assert!(store.cache().contains(&identity));

        // Rolled back: the cached committed state stays valid.
        let (_, ctx_rollback) = ctx();
        ctx_rollback.queue_invalidate(ToInvalidate::new(
            identity.clone(),
            store.clone(),
            Guard::new(&controller).unwrap(),
        ));
        ctx_rollback.post_completion(false, false);
        assert!(store.cache().contains(&identity));

        // Committed: the entry is gone, and the marker's guard was released.
        let (_, ctx_commit) = ctx();
        ctx_commit.queue_invalidate(ToInvalidate::new(
            identity.clone(),
            store.clone(),
            Guard::new(&controller).unwrap(),
        ));
        ctx_commit.post_completion(true, false);
        assert!(!store.cache().contains(&identity));

        assert!(controller.deactivate());
        controller.wait_drained();
    }

    #[test]
    fn test_current_slot() {
        let (_db, ctx) = ctx();

        assert!(current::<Noop, MemDb>().is_none());
        set_current(&ctx).unwrap();
        let cur = current::<Noop, MemDb>().expect("current set");
        assert!(std::ptr::eq(Arc::as_ptr(&cur), Arc::as_ptr(&ctx)));

        // A second transaction cannot become current underneath the first.
        let db2 = Arc::new(MemDb::default());
        let other = Ctx::new(db2.begin().unwrap(), false);
        assert!(set_current(&other).is_err());
        other.post_completion(false, false);

        // post_completion clears the slot of the completing thread.
        ctx.post_completion(false, false);
        assert!(current::<Noop, MemDb>().is_none());
    }
}
