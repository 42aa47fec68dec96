// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Document-wide pool of issued object identifiers.

use rustc_hash::FxHashSet;
use uuid::Uuid;

/// Tracks every identifier seen in (or generated for) a document, and hands
/// out fresh ones that collide with none of them.
#[derive(Debug, Clone)]
pub struct IdPool {
    issued: FxHashSet<String>,
    prefix: String,
}

impl IdPool {
    pub fn new() -> Self {
        Self::with_prefix("ID_")
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            issued: FxHashSet::default(),
            prefix: prefix.into(),
        }
    }

    /// Records an identifier as issued. Returns `false` if it was known already.
    pub fn register(&mut self, id: &str) -> bool {
        if self.issued.contains(id) {
            return false;
        }
        self.issued.insert(id.to_string())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.issued.contains(id)
    }

    /// Generates an identifier that has never been issued before.
    pub fn fresh(&mut self) -> String {
        loop {
            let id = format!("{}{}", self.prefix, Uuid::new_v4());
            if self.issued.insert(id.clone()) {
                return id;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.issued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.issued.is_empty()
    }
}

impl Default for IdPool {
    fn default() -> Self {
        Self::new()
    }
}
