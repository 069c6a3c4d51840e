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

use std::hash::{BuildHasher, Hash};

use serde::{de::DeserializeOwned, Serialize};

use crate::error::Result;

/// Key trait for the in-memory cache.
pub trait Key: Send + Sync + 'static + Hash + Eq {}
impl<T> Key for T where T: Send + Sync + 'static + Hash + Eq {}

/// Value trait for the in-memory cache.
pub trait Value: Send + Sync + 'static {}
impl<T> Value for T where T: Send + Sync + 'static {}

/// Key trait for keys that also travel through the storage layer.
///
/// Storage keys are serialized with bincode at the store boundary, and their serialized form must
/// be usable as an engine key.
pub trait StorageKey: Key + Ord + Clone + std::fmt::Debug + Serialize + DeserializeOwned {}
impl<T> StorageKey for T where T: Key + Ord + Clone + std::fmt::Debug + Serialize + DeserializeOwned {}

/// Codec seam between the in-memory servant and its persisted payload.
///
/// The evictor treats the payload as an opaque blob; only the implementor knows the schema.
pub trait Servant: Send + Sync + 'static + Sized {
    /// Marshal the servant state into its persisted payload.
    fn encode(&self) -> Result<Vec<u8>>;

    /// Unmarshal a servant from a persisted payload.
    fn decode(payload: &[u8]) -> Result<Self>;
}

/// Hash builder trait.
pub trait HashBuilder: BuildHasher + Send + Sync + 'static {}
impl<T> HashBuilder for T where T: BuildHasher + Send + Sync + 'static {}
