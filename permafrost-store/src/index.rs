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

/// Derives the secondary key of a record from its opaque payload.
pub trait KeyExtractor: Send + Sync + 'static {
    /// The derived key bytes, or `None` to leave this record out of the index.
    fn extract(&self, payload: &[u8]) -> Option<Vec<u8>>;
}

impl<F> KeyExtractor for F
where
    F: Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync + 'static,
{
    fn extract(&self, payload: &[u8]) -> Option<Vec<u8>> {
        self(payload)
    }
}

/// One secondary index over an object store.
#[derive(Clone)]
pub struct IndexSpec {
    name: String,
    extractor: Arc<dyn KeyExtractor>,
}

impl std::fmt::Debug for IndexSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexSpec").field("name", &self.name).finish()
    }
}

impl IndexSpec {
    /// Define an index with a name and a key extraction function.
    pub fn new(name: impl Into<String>, extractor: impl KeyExtractor) -> Self {
        Self {
            name: name.into(),
            extractor: Arc::new(extractor),
        }
    }

    /// The index name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Derive the secondary key for a payload.
    pub fn extract(&self, payload: &[u8]) -> Option<Vec<u8>> {
        self.extractor.extract(payload)
    }
}

// Index entries are stored one per (derived key, identity) pair under a composite engine key:
// escape(derived) ++ 0x00 0x00 ++ identity. The escaping (0x00 => 0x00 0xFF) keeps the encoding
// prefix-free while preserving the lexicographic order of the derived keys, so point lookups are
// exact prefix ranges and range lookups stay plain key ranges.

pub(crate) fn encode_entry_key(derived: &[u8], identity: &[u8]) -> Vec<u8> {
    let mut out = escape(derived);
    out.extend_from_slice(&[0x00, 0x00]);
    out.extend_from_slice(identity);
    out
}

/// `[start, end)` bounds covering exactly the entries of one derived key.
pub(crate) fn point_bounds(derived: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let mut start = escape(derived);
    start.extend_from_slice(&[0x00, 0x00]);
    let mut end = escape(derived);
    end.extend_from_slice(&[0x00, 0x01]);
    (start, end)
}

/// The inclusive-start bound for a derived key, usable as either end of a range lookup.
pub(crate) fn range_bound(derived: &[u8]) -> Vec<u8> {
    let mut bound = escape(derived);
    bound.extend_from_slice(&[0x00, 0x00]);
    bound
}

fn escape(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len() + 2);
    for &b in raw {
        if b == 0x00 {
            out.extend_from_slice(&[0x00, 0xFF]);
        } else {
            out.push(b);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_key_order_and_prefix_freedom() {
        // Entries of a shorter derived key never interleave with entries of a longer one that
        // extends it, and derived-key order is preserved.
        let e = |d: &[u8], id: &[u8]| encode_entry_key(d, id);

        let a = e(b"a", b"zzzz");
        let a0 = e(b"a\x00", b"a");
        let ab = e(b"ab", b"a");
        let b = e(b"b", b"a");
        assert!(a < a0);
        assert!(a0 < ab);
        assert!(ab < b);

        let (start, end) = point_bounds(b"a");
        assert!(start <= a && a < end);
        for other in [&a0, &ab, &b] {
            assert!(*other >= end);
        }
    }

    #[test]
    fn test_range_bounds_cover_point() {
        let lo = range_bound(b"k1");
        let hi = range_bound(b"k3");
        let inside = encode_entry_key(b"k2", b"id");
        let below = encode_entry_key(b"k0", b"id");
        let at_hi = encode_entry_key(b"k3", b"id");
        assert!(lo <= inside && inside < hi);
        assert!(below < lo);
        assert!(at_hi >= hi);
    }
}
