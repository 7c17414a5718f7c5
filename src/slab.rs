//! A doubly linked list stored in a slot map.
//!
//! Rust-owned bookkeeping does not need intrusive links or container-of: each
//! entry lives in an arena slot and refers to its neighbours by key. Keys are
//! generational, so a key to a removed entry never aliases a newer one.

use slotmap::{Key, SlotMap};

struct Slot<K, V> {
    value: V,
    prev: Option<K>,
    next: Option<K>,
}

pub struct IndexList<K: Key, V> {
    slots: SlotMap<K, Slot<K, V>>,
    head: Option<K>,
    tail: Option<K>,
}

impl<K: Key, V> IndexList<K, V> {
    pub fn new() -> Self {
        Self {
            slots: SlotMap::with_key(),
            head: None,
            tail: None,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn contains(&self, key: K) -> bool {
        self.slots.contains_key(key)
    }

    pub fn get(&self, key: K) -> Option<&V> {
        self.slots.get(key).map(|slot| &slot.value)
    }

    pub fn get_mut(&mut self, key: K) -> Option<&mut V> {
        self.slots.get_mut(key).map(|slot| &mut slot.value)
    }

    pub fn first(&self) -> Option<K> {
        self.head
    }

    pub fn last(&self) -> Option<K> {
        self.tail
    }

    pub fn next_key(&self, key: K) -> Option<K> {
        self.slots.get(key).and_then(|slot| slot.next)
    }

    pub fn prev_key(&self, key: K) -> Option<K> {
        self.slots.get(key).and_then(|slot| slot.prev)
    }

    pub fn push_back(&mut self, value: V) -> K {
        let prev = self.tail;
        let key = self.slots.insert(Slot {
            value,
            prev,
            next: None,
        });
        match prev {
            Some(prev) => self.slots[prev].next = Some(key),
            None => self.head = Some(key),
        }
        self.tail = Some(key);
        key
    }

    /// Inserts `value` right after `after`, or hands it back if `after` is not
    /// in the list.
    pub fn insert_after(&mut self, after: K, value: V) -> Result<K, V> {
        let next = match self.slots.get(after) {
            Some(slot) => slot.next,
            None => return Err(value),
        };
        let key = self.slots.insert(Slot {
            value,
            prev: Some(after),
            next,
        });
        self.slots[after].next = Some(key);
        match next {
            Some(next) => self.slots[next].prev = Some(key),
            None => self.tail = Some(key),
        }
        Ok(key)
    }

    pub fn remove(&mut self, key: K) -> Option<V> {
        let slot = self.slots.remove(key)?;
        match slot.prev {
            Some(prev) => self.slots[prev].next = slot.next,
            None => self.head = slot.next,
        }
        match slot.next {
            Some(next) => self.slots[next].prev = slot.prev,
            None => self.tail = slot.prev,
        }
        Some(slot.value)
    }

    /// Entries in list order.
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            list: self,
            next: self.head,
        }
    }
}

impl<K: Key, V> Default for IndexList<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Iter<'a, K: Key, V> {
    list: &'a IndexList<K, V>,
    next: Option<K>,
}

impl<'a, K: Key, V> Iterator for Iter<'a, K, V> {
    type Item = (K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        let key = self.next?;
        let slot = &self.list.slots[key];
        self.next = slot.next;
        Some((key, &slot.value))
    }
}
