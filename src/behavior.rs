//! Behavior modules
//!
//! A behavior is the optional per-mold unit whose `init` receives an
//! element once the mold's template is compiled. Behaviors are looked up
//! by entry-point key (`<moldId>/index`) in an injected registry.

use std::sync::Arc;

use dashmap::DashMap;

use crate::config::ENTRY_POINT_SUFFIX;
use crate::dom::Element;
use crate::engine::Engine;

/// Per-mold behavior hook
///
/// `init` runs at most once per element. It may build per-element state,
/// attach it with [`Element::set_model`], mutate the DOM, and call back
/// into the engine's `render` / `populate` / `execute`. A behavior that
/// replaces its own markup must re-attach whatever it hung on the
/// replaced nodes.
pub trait Behavior: Send + Sync {
    fn init(&self, element: &Element, engine: &Engine);
}

impl<F> Behavior for F
where
    F: Fn(&Element, &Engine) + Send + Sync,
{
    fn init(&self, element: &Element, engine: &Engine) {
        self(element, engine)
    }
}

/// Entry-point key of a mold's behavior
pub fn entry_point(mold_id: &str) -> String {
    format!("{mold_id}/{ENTRY_POINT_SUFFIX}")
}

/// Entry-point key → behavior
#[derive(Clone, Default)]
pub struct BehaviorRegistry {
    entries: Arc<DashMap<String, Arc<dyn Behavior>>>,
}

impl BehaviorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the behavior of `mold_id` under its entry-point key
    pub fn register(&self, mold_id: &str, behavior: impl Behavior + 'static) {
        self.define(entry_point(mold_id), Arc::new(behavior));
    }

    /// Register under an explicit key
    pub fn define(&self, key: impl Into<String>, behavior: Arc<dyn Behavior>) {
        self.entries.insert(key.into(), behavior);
    }

    pub fn is_defined(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn Behavior>> {
        self.entries.get(key).map(|b| Arc::clone(b.value()))
    }

    /// Behavior for a mold id, resolved through its entry point
    pub fn for_mold(&self, mold_id: &str) -> Option<Arc<dyn Behavior>> {
        self.get(&entry_point(mold_id))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for BehaviorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        f.debug_struct("BehaviorRegistry").field("keys", &keys).finish()
    }
}
