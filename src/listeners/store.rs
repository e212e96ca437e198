use super::Listener;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

#[derive(Default)]
struct StoreInner {
    listeners: HashMap<Uuid, Arc<Listener>>,
    by_studio: HashMap<String, HashMap<Uuid, Arc<Listener>>>,
}

/// Concurrent listener registry with a secondary index by studio.
///
/// All operations are O(1) amortized; the analytics sampler reads through
/// `for_studio` while handlers add/remove on connect/disconnect.
#[derive(Default)]
pub struct ListenerStore {
    inner: RwLock<StoreInner>,
}

impl ListenerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<Listener>) {
        let mut inner = self.inner.write().unwrap();
        inner.listeners.insert(listener.id, listener.clone());
        inner
            .by_studio
            .entry(listener.studio_id.clone())
            .or_default()
            .insert(listener.id, listener);
    }

    pub fn remove(&self, id: Uuid) -> Option<Arc<Listener>> {
        let mut inner = self.inner.write().unwrap();
        let listener = inner.listeners.remove(&id)?;
        if let Some(studio) = inner.by_studio.get_mut(&listener.studio_id) {
            studio.remove(&id);
            if studio.is_empty() {
                inner.by_studio.remove(&listener.studio_id);
            }
        }
        Some(listener)
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<Listener>> {
        self.inner.read().unwrap().listeners.get(&id).cloned()
    }

    /// All registered listeners for a studio, connected or not.
    pub fn for_studio(&self, studio_id: &str) -> Vec<Arc<Listener>> {
        self.inner
            .read()
            .unwrap()
            .by_studio
            .get(studio_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Listeners for a studio that have not disconnected.
    pub fn active_for_studio(&self, studio_id: &str) -> Vec<Arc<Listener>> {
        self.inner
            .read()
            .unwrap()
            .by_studio
            .get(studio_id)
            .map(|m| {
                m.values()
                    .filter(|l| l.is_connected())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().unwrap().listeners.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listener(studio: &str) -> Arc<Listener> {
        Arc::new(Listener::new(studio.into(), None, String::new(), "other"))
    }

    #[test]
    fn add_get_remove_roundtrip() {
        let store = ListenerStore::new();
        let l = listener("a");
        let id = l.id;
        store.add(l);

        assert!(store.get(id).is_some());
        assert_eq!(store.len(), 1);

        let removed = store.remove(id).unwrap();
        assert_eq!(removed.id, id);
        assert!(store.get(id).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn remove_unknown_returns_none() {
        let store = ListenerStore::new();
        assert!(store.remove(Uuid::new_v4()).is_none());
    }

    #[test]
    fn studio_index_tracks_membership() {
        let store = ListenerStore::new();
        let a1 = listener("a");
        let a2 = listener("a");
        let b1 = listener("b");
        store.add(a1.clone());
        store.add(a2);
        store.add(b1);

        assert_eq!(store.for_studio("a").len(), 2);
        assert_eq!(store.for_studio("b").len(), 1);
        assert!(store.for_studio("c").is_empty());

        store.remove(a1.id);
        assert_eq!(store.for_studio("a").len(), 1);
    }

    #[test]
    fn active_excludes_disconnected() {
        let store = ListenerStore::new();
        let l1 = listener("a");
        let l2 = listener("a");
        store.add(l1.clone());
        store.add(l2);

        assert_eq!(store.active_for_studio("a").len(), 2);
        l1.mark_disconnected();
        assert_eq!(store.active_for_studio("a").len(), 1);
        assert_eq!(store.for_studio("a").len(), 2);
    }
}
