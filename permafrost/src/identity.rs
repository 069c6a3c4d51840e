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

use serde::{Deserialize, Serialize};

/// The process-wide-unique key of one persistent object.
///
/// Immutable once assigned and never reused across deletions.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Identity {
    /// Object name, unique within its category.
    pub name: String,
    /// Object category.
    pub category: String,
}

impl Identity {
    /// Create an identity.
    pub fn new(name: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            category: category.into(),
        }
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.category.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.category, self.name)
        }
    }
}

/// One inbound call as the dispatch layer presents it to the evictor.
#[derive(Debug, Clone)]
pub struct Request {
    /// The target object.
    pub identity: Identity,
    /// The target facet; the empty string is the default facet.
    pub facet: String,
    /// Operation name, for diagnostics only.
    pub operation: String,
    /// Whether the operation declares itself read-only.
    pub read_only: bool,
}

impl Request {
    /// A read-only call on the default facet.
    pub fn read(identity: Identity, operation: impl Into<String>) -> Self {
        Self {
            identity,
            facet: String::new(),
            operation: operation.into(),
            read_only: true,
        }
    }

    /// A mutating call on the default facet.
    pub fn write(identity: Identity, operation: impl Into<String>) -> Self {
        Self {
            identity,
            facet: String::new(),
            operation: operation.into(),
            read_only: false,
        }
    }

    /// Retarget the call at a facet.
    pub fn with_facet(mut self, facet: impl Into<String>) -> Self {
        self.facet = facet.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(Identity::new("obj", "acct").to_string(), "acct/obj");
        assert_eq!(Identity::new("obj", "").to_string(), "obj");
    }
}
