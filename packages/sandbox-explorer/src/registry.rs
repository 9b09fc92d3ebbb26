use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use crate::paths;
use crate::runtime::SandboxHandle;

/// Live sandbox handles keyed by sandbox id. Presence means "connected".
#[derive(Default)]
pub struct SessionRegistry {
    handles: HashMap<String, Arc<dyn SandboxHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handle` unless the id is already connected.
    ///
    /// Returns the handle that ends up registered, which is the existing one when
    /// two connects for the same id race each other.
    pub fn insert(
        &mut self,
        sandbox_id: &str,
        handle: Arc<dyn SandboxHandle>,
    ) -> Arc<dyn SandboxHandle> {
        match self.handles.entry(sandbox_id.to_string()) {
            Entry::Occupied(existing) => existing.get().clone(),
            Entry::Vacant(slot) => slot.insert(handle).clone(),
        }
    }

    pub fn remove(&mut self, sandbox_id: &str) -> Option<Arc<dyn SandboxHandle>> {
        self.handles.remove(sandbox_id)
    }

    pub fn clear(&mut self) -> Vec<String> {
        let ids = self.connected_ids();
        self.handles.clear();
        ids
    }

    pub fn get(&self, sandbox_id: &str) -> Option<Arc<dyn SandboxHandle>> {
        self.handles.get(sandbox_id).cloned()
    }

    pub fn is_connected(&self) -> bool {
        !self.handles.is_empty()
    }

    pub fn is_connected_to(&self, sandbox_id: &str) -> bool {
        self.handles.contains_key(sandbox_id)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Connected ids in stable (sorted) order.
    pub fn connected_ids(&self) -> Vec<String> {
        let mut ids = self.handles.keys().cloned().collect::<Vec<_>>();
        ids.sort();
        ids
    }

    /// With an id, that sandbox's handle. Without one, the sole handle when
    /// exactly one sandbox is connected; ambiguity is left to the caller.
    pub fn resolve(&self, sandbox_id: Option<&str>) -> Option<Arc<dyn SandboxHandle>> {
        match sandbox_id {
            Some(id) => self.get(id),
            None if self.handles.len() == 1 => self.handles.values().next().cloned(),
            None => None,
        }
    }
}

/// User-chosen working root per sandbox.
#[derive(Debug, Default, Clone)]
pub struct RootPathStore {
    roots: HashMap<String, String>,
}

impl RootPathStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores an already-normalized absolute path.
    pub fn set(&mut self, sandbox_id: &str, root: String) {
        self.roots.insert(sandbox_id.to_string(), root);
    }

    pub fn get(&self, sandbox_id: &str) -> String {
        self.roots
            .get(sandbox_id)
            .cloned()
            .unwrap_or_else(|| paths::ROOT.to_string())
    }

    pub fn contains(&self, sandbox_id: &str) -> bool {
        self.roots.contains_key(sandbox_id)
    }

    pub fn remove(&mut self, sandbox_id: &str) -> Option<String> {
        self.roots.remove(sandbox_id)
    }

    pub fn clear(&mut self) {
        self.roots.clear();
    }
}
