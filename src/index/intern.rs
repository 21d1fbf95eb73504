//! Global string interning for symbol and reference names.
//!
//! Owned exclusively by the integrator; processors hand over plain `String`s
//! and interning happens once, at merge time, so names repeated across
//! thousands of files share one allocation.

use rustc_hash::FxHashSet;
use std::sync::Arc;

#[derive(Default)]
pub struct StringInterner {
    strings: FxHashSet<Arc<str>>,
}

impl StringInterner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&mut self, name: &str) -> Arc<str> {
        if let Some(existing) = self.strings.get(name) {
            return existing.clone();
        }
        let interned: Arc<str> = Arc::from(name);
        self.strings.insert(interned.clone());
        interned
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }
}
