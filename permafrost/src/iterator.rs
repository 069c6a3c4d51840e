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

use std::{collections::VecDeque, sync::Arc};

use permafrost_common::{code::Servant, error::Result};
use permafrost_store::{Database, StoreTransaction};

use crate::{
    deactivate::{DeactivateController, Guard},
    identity::Identity,
    FacetStore,
};

/// A lazy, batched scan over one facet's identities.
///
/// Forward-only, finite, not restartable once exhausted. Each batch is fetched in a fresh read
/// transaction under its own deactivation guard, so the iterator holds neither the whole table
/// nor any engine state between batches.
pub struct EvictorIterator<S, D>
where
    S: Servant,
    D: Database,
{
    store: Arc<FacetStore<S, D>>,
    controller: Arc<DeactivateController>,
    batch_size: usize,
    buffer: VecDeque<Identity>,
    after: Option<Vec<u8>>,
    exhausted: bool,
}

impl<S, D> EvictorIterator<S, D>
where
    S: Servant,
    D: Database,
{
    pub(crate) fn new(store: Arc<FacetStore<S, D>>, controller: Arc<DeactivateController>, batch_size: usize) -> Self {
        Self {
            store,
            controller,
            batch_size: batch_size.max(1),
            buffer: VecDeque::new(),
            after: None,
            exhausted: false,
        }
    }

    fn fetch(&mut self) -> Result<()> {
        let _guard = Guard::new(&self.controller)?;

        let tx = self.store.db().begin()?;
        let page = self.store.scan_identities(self.after.as_deref(), self.batch_size, &tx)?;
        tx.commit()?;

        if page.len() < self.batch_size {
            self.exhausted = true;
        }
        if let Some((key, _)) = page.last() {
            self.after = Some(key.clone());
        }
        self.buffer.extend(page.into_iter().map(|(_, identity)| identity));
        Ok(())
    }
}

impl<S, D> Iterator for EvictorIterator<S, D>
where
    S: Servant,
    D: Database,
{
    type Item = Result<Identity>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(identity) = self.buffer.pop_front() {
                return Some(Ok(identity));
            }
            if self.exhausted {
                return None;
            }
            if let Err(err) = self.fetch() {
                self.exhausted = true;
                return Some(Err(err));
            }
        }
    }
}
