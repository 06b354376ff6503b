use crate::heap::ObjRef;
use crate::value::Value;

/// Open-addressing hash table keyed by interned strings.
///
/// Keys are `ObjRef` handles to heap strings; because every string is
/// interned, key equality is handle equality. The key's hash is cached in the
/// entry so probing and rehashing never need to touch the heap. Deletion
/// leaves a tombstone so longer probe sequences stay reachable.
pub struct Table {
    slots: Vec<Slot>,
    /// Occupied plus tombstoned slots, the figure the load factor is checked
    /// against, so tombstones count towards triggering a rehash.
    count: usize,
    live: usize,
}

#[derive(Clone, Copy)]
enum Slot {
    Vacant,
    Tombstone,
    Occupied(Entry),
}

#[derive(Clone, Copy)]
struct Entry {
    key: ObjRef,
    hash: u64,
    value: Value,
}

/// Grow once more than three quarters of the slots are used.
const MAX_LOAD_NUM: usize = 3;
const MAX_LOAD_DEN: usize = 4;

impl Table {
    pub fn new() -> Table {
        Table {
            slots: Vec::new(),
            count: 0,
            live: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn get(&self, key: ObjRef, hash: u64) -> Option<Value> {
        if self.slots.is_empty() {
            return None;
        }
        match self.probe(key, hash) {
            Probe::Found(i) => match self.slots[i] {
                Slot::Occupied(e) => Some(e.value),
                _ => unreachable!("probe returned a non-occupied slot"),
            },
            Probe::Insertable(_) => None,
        }
    }

    /// Insert or update. Returns true when the key was not present before.
    pub fn set(&mut self, key: ObjRef, hash: u64, value: Value) -> bool {
        if (self.count + 1) * MAX_LOAD_DEN > self.slots.len() * MAX_LOAD_NUM {
            self.grow();
        }
        match self.probe(key, hash) {
            Probe::Found(i) => {
                self.slots[i] = Slot::Occupied(Entry { key, hash, value });
                false
            }
            Probe::Insertable(i) => {
                // A reused tombstone was already counted towards the load.
                if matches!(self.slots[i], Slot::Vacant) {
                    self.count += 1;
                }
                self.live += 1;
                self.slots[i] = Slot::Occupied(Entry { key, hash, value });
                true
            }
        }
    }

    /// Returns true when the key was present.
    pub fn delete(&mut self, key: ObjRef, hash: u64) -> bool {
        if self.slots.is_empty() {
            return false;
        }
        match self.probe(key, hash) {
            Probe::Found(i) => {
                self.slots[i] = Slot::Tombstone;
                self.live -= 1;
                true
            }
            Probe::Insertable(_) => false,
        }
    }

    /// Interning lookup: find an existing key whose content matches, probing
    /// by hash and confirming with the caller-supplied comparison.
    pub fn find_key(&self, hash: u64, mut matches_content: impl FnMut(ObjRef) -> bool) -> Option<ObjRef> {
        if self.slots.is_empty() {
            return None;
        }
        let mask = self.slots.len() - 1;
        let mut i = hash as usize & mask;
        loop {
            match self.slots[i] {
                Slot::Vacant => return None,
                Slot::Tombstone => {}
                Slot::Occupied(e) => {
                    if e.hash == hash && matches_content(e.key) {
                        return Some(e.key);
                    }
                }
            }
            i = (i + 1) & mask;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjRef, Value)> + '_ {
        self.slots.iter().filter_map(|slot| match slot {
            Slot::Occupied(e) => Some((e.key, e.value)),
            _ => None,
        })
    }

    /// Drop every entry whose key fails the predicate. Used to sweep stale
    /// intern entries after marking.
    pub fn retain_keys(&mut self, mut keep: impl FnMut(ObjRef) -> bool) {
        for slot in &mut self.slots {
            if let Slot::Occupied(e) = slot {
                if !keep(e.key) {
                    *slot = Slot::Tombstone;
                    self.live -= 1;
                }
            }
        }
    }

    /// Walk to the key's slot. `Found` is its current slot; `Insertable` is
    /// where it would go (the first tombstone seen, else the vacant end of
    /// the probe sequence).
    fn probe(&self, key: ObjRef, hash: u64) -> Probe {
        let mask = self.slots.len() - 1;
        let mut i = hash as usize & mask;
        let mut tombstone: Option<usize> = None;
        loop {
            match self.slots[i] {
                Slot::Vacant => return Probe::Insertable(tombstone.unwrap_or(i)),
                Slot::Tombstone => {
                    tombstone.get_or_insert(i);
                }
                Slot::Occupied(e) => {
                    if e.key == key {
                        return Probe::Found(i);
                    }
                }
            }
            i = (i + 1) & mask;
        }
    }

    /// Double capacity and reinsert live entries, discarding tombstones.
    fn grow(&mut self) {
        let new_cap = if self.slots.is_empty() { 8 } else { self.slots.len() * 2 };
        let old = std::mem::replace(&mut self.slots, vec![Slot::Vacant; new_cap]);
        self.count = 0;
        let mask = new_cap - 1;
        for slot in old {
            if let Slot::Occupied(e) = slot {
                let mut i = e.hash as usize & mask;
                while matches!(self.slots[i], Slot::Occupied(_)) {
                    i = (i + 1) & mask;
                }
                self.slots[i] = slot;
                self.count += 1;
            }
        }
    }
}

enum Probe {
    Found(usize),
    Insertable(usize),
}

impl Default for Table {
    fn default() -> Self {
        Table::new()
    }
}
