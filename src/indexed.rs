/// Key -> value map whose entries are also addressable by a stable slot.
///
/// Slots are assigned in insertion order and never renumbered: removing an
/// entry leaves a hole, and holes are not reused. Iteration visits live
/// entries in slot order.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::hash::Hash;

#[derive(Debug, Clone)]
pub struct IndexedDictionary<K, V> {
    slots: Vec<Option<(K, V)>>,
    by_key: HashMap<K, usize>,
}

impl<K, V> Default for IndexedDictionary<K, V> {
    fn default() -> Self {
        IndexedDictionary {
            slots: Vec::new(),
            by_key: HashMap::new(),
        }
    }
}

impl<K: Eq + Hash + Clone, V> IndexedDictionary<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    /// Number of slots ever handed out, live or not.
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Insert a new entry and return its slot.
    ///
    /// `name` identifies the dictionary in the duplicate-key error.
    pub fn try_insert(&mut self, key: K, value: V, name: &str) -> Result<usize> {
        if self.by_key.contains_key(&key) {
            return Err(Error::DuplicateKey(name.to_string()));
        }
        let slot = self.slots.len();
        self.by_key.insert(key.clone(), slot);
        self.slots.push(Some((key, value)));
        Ok(slot)
    }

    pub fn slot_of(&self, key: &K) -> Option<usize> {
        self.by_key.get(key).copied()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.by_key.contains_key(key)
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.slot_of(key).and_then(|slot| self.get_at(slot))
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let slot = self.slot_of(key)?;
        self.get_at_mut(slot)
    }

    pub fn get_at(&self, slot: usize) -> Option<&V> {
        self.slots.get(slot)?.as_ref().map(|(_, v)| v)
    }

    pub fn get_at_mut(&mut self, slot: usize) -> Option<&mut V> {
        self.slots.get_mut(slot)?.as_mut().map(|(_, v)| v)
    }

    pub fn key_at(&self, slot: usize) -> Option<&K> {
        self.slots.get(slot)?.as_ref().map(|(k, _)| k)
    }

    /// Remove an entry, returning its slot and value.
    pub fn remove(&mut self, key: &K) -> Option<(usize, V)> {
        let slot = self.by_key.remove(key)?;
        self.slots[slot].take().map(|(_, v)| (slot, v))
    }

    /// Live entries as `(slot, key, value)` in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &K, &V)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(slot, entry)| entry.as_ref().map(|(k, v)| (slot, k, v)))
    }

    /// Live slots in ascending order.
    pub fn slots(&self) -> impl Iterator<Item = usize> + '_ {
        self.iter().map(|(slot, _, _)| slot)
    }
}
