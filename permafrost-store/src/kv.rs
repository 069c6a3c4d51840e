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

use permafrost_common::error::Result;

/// The transactional key-value engine underneath the object stores.
///
/// Cross-transaction coordination (locking, isolation, conflict detection) is entirely the
/// engine's responsibility; the layers above only require that a detected conflict surfaces as
/// [`ErrorKind::Deadlock`] so it can be told apart from a fatal [`ErrorKind::Database`] failure
/// without string matching.
///
/// [`ErrorKind::Deadlock`]: permafrost_common::error::ErrorKind::Deadlock
/// [`ErrorKind::Database`]: permafrost_common::error::ErrorKind::Database
pub trait Database: Send + Sync + 'static {
    /// The engine transaction handle.
    type Tx: StoreTransaction;

    /// Begin a transaction.
    fn begin(&self) -> Result<Self::Tx>;

    /// Open a table, creating it if missing. Idempotent.
    fn open_table(&self, table: &str) -> Result<()>;
}

/// One engine transaction.
///
/// Handles are shared across the threads participating in one logical transaction, so every
/// method takes `&self`. All reads observe the transaction's own earlier writes.
pub trait StoreTransaction: Send + Sync + 'static {
    /// Point read.
    fn get(&self, table: &str, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Point write.
    fn put(&self, table: &str, key: &[u8], value: &[u8]) -> Result<()>;

    /// Point delete. Deleting an absent key is not an error.
    fn delete(&self, table: &str, key: &[u8]) -> Result<()>;

    /// Ascending scan over `[start, end)`, unbounded where `None`, yielding at most `limit`
    /// entries.
    fn scan(
        &self,
        table: &str,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Commit the transaction.
    fn commit(&self) -> Result<()>;

    /// Roll the transaction back. A no-op on an already-completed transaction.
    fn rollback(&self) -> Result<()>;

    /// Whether commit or rollback has already happened.
    fn is_completed(&self) -> bool;
}
