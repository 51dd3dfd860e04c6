//! Dual-view mutable process state.
//!
//! [`StateManager`] keeps two full copies of the same key/value state:
//!
//! - **Working** — reflects the latest in-pipeline writes.
//! - **Last-Stable** — reflects only writes considered externally consistent.
//!
//! A set of *pending* keys marks fields currently undergoing asynchronous
//! recomputation. Prompt-facing reads substitute the Last-Stable value for
//! every pending key, so a half-applied background update never leaks into
//! user-facing generation while the computation is in flight.
//!
//! A manager is private to one execution context (constructed fresh per
//! request or job); durability comes from persisting a snapshot back into the
//! session record after a synchronous write settles.

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;

/// Key/value process state map.
pub type StateMap = FxHashMap<String, Value>;

/// Working/Last-Stable dual state with pending-key prompt fallback.
pub struct StateManager {
    working: Mutex<StateMap>,
    stable: Mutex<StateMap>,
    pending: Mutex<FxHashSet<String>>,
}

impl StateManager {
    /// Create a manager with both views initialized to `initial`.
    #[must_use]
    pub fn new(initial: StateMap) -> Self {
        Self {
            working: Mutex::new(initial.clone()),
            stable: Mutex::new(initial),
            pending: Mutex::new(FxHashSet::default()),
        }
    }

    /// Snapshot of the Working view.
    #[must_use]
    pub fn working_state(&self) -> StateMap {
        self.working.lock().clone()
    }

    /// Snapshot for prompt construction: the Working view with every pending
    /// key overwritten by its Last-Stable value (when one exists).
    #[must_use]
    pub fn read_for_prompt(&self) -> StateMap {
        let mut snapshot = self.working.lock().clone();
        let pending: Vec<String> = self.pending.lock().iter().cloned().collect();
        if pending.is_empty() {
            return snapshot;
        }
        tracing::debug!(keys = ?pending, "prompt read falling back to last-stable values");
        let stable = self.stable.lock();
        for key in pending {
            if let Some(value) = stable.get(&key) {
                snapshot.insert(key, value.clone());
            }
        }
        snapshot
    }

    /// Convenience read: all keys or a selection, from the Working view or
    /// the prompt-fallback view.
    #[must_use]
    pub fn read(&self, keys: Option<&[String]>, for_prompt: bool) -> StateMap {
        let full = if for_prompt {
            self.read_for_prompt()
        } else {
            self.working_state()
        };
        match keys {
            None => full,
            Some(keys) => keys
                .iter()
                .filter_map(|k| full.get(k).map(|v| (k.clone(), v.clone())))
                .collect(),
        }
    }

    /// Apply updates to both views. This is the default, consistency
    /// preserving write path.
    ///
    /// Keys currently marked pending are written to the Working view only:
    /// their Last-Stable value stays frozen until the in-flight asynchronous
    /// update commits, which keeps prompt-facing reads insulated from writes
    /// that raced in after `begin_async_update`.
    pub fn write_sync(&self, updates: StateMap) {
        let keys: Vec<&String> = updates.keys().collect();
        tracing::debug!(?keys, "sync state update");
        let pending = self.pending.lock();
        let mut working = self.working.lock();
        let mut stable = self.stable.lock();
        for (key, value) in updates {
            working.insert(key.clone(), value.clone());
            if !pending.contains(&key) {
                stable.insert(key, value);
            }
        }
    }

    /// Mark keys as undergoing asynchronous recomputation. Values are left
    /// untouched.
    pub fn begin_async_update<I, S>(&self, keys: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut pending = self.pending.lock();
        for key in keys {
            pending.insert(key.into());
        }
        tracing::debug!(pending = pending.len(), "async update started");
    }

    /// Commit an asynchronous update: apply to both views and clear the
    /// pending mark for exactly the updated keys.
    pub fn complete_async_update(&self, updates: StateMap) {
        let keys: Vec<String> = updates.keys().cloned().collect();
        // Lock order matches write_sync: pending, then the two views.
        let mut pending = self.pending.lock();
        {
            let mut working = self.working.lock();
            let mut stable = self.stable.lock();
            for (key, value) in updates {
                working.insert(key.clone(), value.clone());
                stable.insert(key, value);
            }
        }
        for key in &keys {
            pending.remove(key);
        }
        tracing::debug!(?keys, "async update committed");
    }

    /// Keys currently marked pending.
    #[must_use]
    pub fn pending_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.pending.lock().iter().cloned().collect();
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(pairs: &[(&str, Value)]) -> StateMap {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn write_sync_updates_both_views() {
        let state = StateManager::new(map(&[("x", json!(1))]));
        state.write_sync(map(&[("x", json!(2))]));
        assert_eq!(state.working_state()["x"], json!(2));
        assert_eq!(state.read_for_prompt()["x"], json!(2));
    }

    #[test]
    fn prompt_read_falls_back_for_pending_keys() {
        let state = StateManager::new(map(&[("x", json!(1))]));
        state.begin_async_update(["x"]);
        state.write_sync(map(&[("x", json!(2))]));

        // Working sees the newer value; prompt reads keep the pre-update one.
        assert_eq!(state.working_state()["x"], json!(2));
        assert_eq!(state.read_for_prompt()["x"], json!(1));
    }

    #[test]
    fn complete_async_update_clears_pending() {
        let state = StateManager::new(map(&[("x", json!(1))]));
        state.begin_async_update(["x"]);
        state.complete_async_update(map(&[("x", json!(3))]));
        assert_eq!(state.read_for_prompt()["x"], json!(3));
        assert!(state.pending_keys().is_empty());
    }

    #[test]
    fn pending_key_without_stable_value_passes_through() {
        let state = StateManager::new(StateMap::default());
        state.begin_async_update(["fresh"]);
        // No last-stable value exists, so the working value (none) stands.
        assert!(!state.read_for_prompt().contains_key("fresh"));
    }

    #[test]
    fn read_selects_keys() {
        let state = StateManager::new(map(&[("a", json!(1)), ("b", json!(2))]));
        let selected = state.read(Some(&["a".to_string(), "zzz".to_string()]), false);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected["a"], json!(1));
    }
}
