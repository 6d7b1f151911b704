//! Registry: an ordered, concurrent set of *Ready* plugin runtimes.
//!
//! Iteration is name-ordered and stable under concurrent registration and
//! removal: every live [`RegistryIter`] tracks its own cursor as a shared
//! index, registered with the [`Registry`] so that a removal before the
//! cursor shifts it back by one and an insertion at-or-after the cursor
//! shifts it forward by one. An iterator that is simply dropped vanishes
//! from the tracking list on its own — the list only ever holds `Weak`
//! handles to each cursor, pruned lazily whenever the registry is
//! mutated.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use secrets_runtime::PluginRuntime;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("plugin {0} already exists")]
    AlreadyExists(String),
}

struct State {
    keys: Vec<String>,
    entries: Vec<Arc<dyn PluginRuntime>>,
    iterators: Vec<Weak<AtomicUsize>>,
}

struct Shared {
    state: Mutex<State>,
}

/// Ordered, concurrent set of live plugin runtimes, keyed by lower-cased
/// name. Cheap to clone — every clone shares the same underlying set.
#[derive(Clone)]
pub struct Registry(Arc<Shared>);

impl Registry {
    pub fn new() -> Self {
        Registry(Arc::new(Shared {
            state: Mutex::new(State {
                keys: Vec::new(),
                entries: Vec::new(),
                iterators: Vec::new(),
            }),
        }))
    }

    /// Install `runtime` in sorted order. Fails if a plugin with the same
    /// (case-insensitive) name is already registered. The returned
    /// [`RemoveHandle`] is the only way to take the runtime back out;
    /// the registry itself never removes an entry on its own.
    pub fn register(&self, runtime: Arc<dyn PluginRuntime>) -> Result<RemoveHandle, RegistryError> {
        let mut state = self.0.state.lock().unwrap();
        let name = runtime.metadata().name().to_string();
        let key = name.to_lowercase();
        match state.keys.binary_search(&key) {
            Ok(_) => Err(RegistryError::AlreadyExists(name)),
            Err(insert_idx) => {
                state.keys.insert(insert_idx, key.clone());
                state.entries.insert(insert_idx, runtime);
                shift_iterators_on_insert(&mut state.iterators, insert_idx);
                Ok(RemoveHandle {
                    shared: self.0.clone(),
                    key,
                    removed: AtomicBool::new(false),
                })
            }
        }
    }

    /// A lazy, snapshot-stable iterator. Multiple iterators may run
    /// concurrently with registrations and removals on the same
    /// `Registry`; see the module docs for the invalidation contract.
    pub fn iter(&self) -> RegistryIter {
        let position = Arc::new(AtomicUsize::new(0));
        let mut state = self.0.state.lock().unwrap();
        prune_dead(&mut state.iterators);
        state.iterators.push(Arc::downgrade(&position));
        RegistryIter {
            shared: self.0.clone(),
            position,
        }
    }

    pub fn len(&self) -> usize {
        self.0.state.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the current names in ascending order, mainly useful
    /// for tests and diagnostics.
    pub fn names(&self) -> Vec<String> {
        self.0
            .state
            .lock()
            .unwrap()
            .entries
            .iter()
            .map(|r| r.metadata().name().to_string())
            .collect()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

fn prune_dead(iterators: &mut Vec<Weak<AtomicUsize>>) {
    iterators.retain(|w| w.strong_count() > 0);
}

fn shift_iterators_on_insert(iterators: &mut Vec<Weak<AtomicUsize>>, insert_idx: usize) {
    prune_dead(iterators);
    for w in iterators.iter() {
        if let Some(pos) = w.upgrade() {
            let cur = pos.load(Ordering::SeqCst);
            if cur >= insert_idx {
                pos.store(cur + 1, Ordering::SeqCst);
            }
        }
    }
}

fn shift_iterators_on_remove(iterators: &mut Vec<Weak<AtomicUsize>>, removed_idx: usize) {
    prune_dead(iterators);
    for w in iterators.iter() {
        if let Some(pos) = w.upgrade() {
            let cur = pos.load(Ordering::SeqCst);
            if cur > removed_idx {
                pos.store(cur - 1, Ordering::SeqCst);
            }
            // cur == removed_idx: the entry that shifted into this slot
            // is the correct next item, so the cursor is left untouched.
        }
    }
}

/// Idempotent handle returned by [`Registry::register`]. Removing twice
/// is a no-op the second time.
pub struct RemoveHandle {
    shared: Arc<Shared>,
    key: String,
    removed: AtomicBool,
}

impl RemoveHandle {
    pub fn remove(&self) {
        if self.removed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut state = self.shared.state.lock().unwrap();
        if let Ok(idx) = state.keys.binary_search(&self.key) {
            state.keys.remove(idx);
            state.entries.remove(idx);
            shift_iterators_on_remove(&mut state.iterators, idx);
        }
    }
}

/// A snapshot-stable, name-ordered iterator over the registry's live
/// entries at the time each `next()` call is made.
pub struct RegistryIter {
    shared: Arc<Shared>,
    position: Arc<AtomicUsize>,
}

impl Iterator for RegistryIter {
    type Item = Arc<dyn PluginRuntime>;

    fn next(&mut self) -> Option<Self::Item> {
        let state = self.shared.state.lock().unwrap();
        let idx = self.position.load(Ordering::SeqCst);
        let item = state.entries.get(idx).cloned()?;
        self.position.store(idx + 1, Ordering::SeqCst);
        Some(item)
    }
}
