//! The open-addressed hash map.
//!
//! Used both as the user-facing associative container and as the per-scope
//! variable frame. Three parallel structures back it:
//!
//! - `mapper`: the probe table, slot → entry index or -1 for empty;
//! - `keys` / `vals`: entries in insertion order.
//!
//! `capacity = mapper_size * 2 / 3` and `mapper_size` is always a power of
//! two. The probe walk is the perturbed linear sequence, seeded with the
//! full hash:
//!
//! ```text
//! i = hash & mask
//! loop: pert >>= 5; i = (i*5 + pert + 1) & mask
//! ```
//!
//! The sequence is fully determined by `(hash, mapper_size)`, which is what
//! makes rehashing after growth deterministic.

use crate::error::{Error, ErrorKind};
use crate::runtime::heap::Heap;
use crate::runtime::object::{ObjRef, ObjectKind};

const INITIAL_MAPPER_SIZE: usize = 8;
const PERTURB_SHIFT: u32 = 5;

#[derive(Debug)]
pub struct MapData {
    /// Probe table; `mapper[i] >= 0` is an index into `keys`/`vals`.
    mapper: Vec<i32>,
    /// Keys in insertion order.
    keys: Vec<ObjRef>,
    /// Values, parallel to `keys`.
    vals: Vec<ObjRef>,
}

impl MapData {
    /// Builds an empty map sized so that `num` entries fit without growth.
    pub fn with_room_for(num: usize) -> Self {
        let mut mapper_size = INITIAL_MAPPER_SIZE;
        while capacity_of(mapper_size) < num {
            mapper_size <<= 1;
        }
        MapData {
            mapper: vec![-1; mapper_size],
            keys: Vec::new(),
            vals: Vec::new(),
        }
    }

    pub fn count(&self) -> usize {
        self.keys.len()
    }

    pub fn capacity(&self) -> usize {
        capacity_of(self.mapper.len())
    }

    pub fn mapper_size(&self) -> usize {
        self.mapper.len()
    }

    /// The i-th entry in insertion order.
    pub fn entry(&self, index: usize) -> (ObjRef, ObjRef) {
        (self.keys[index], self.vals[index])
    }

    /// Auxiliary storage owned by the map, for heap accounting.
    pub fn aux_bytes(&self) -> usize {
        self.mapper.len() * std::mem::size_of::<i32>()
            + (self.keys.len() + self.vals.len()) * std::mem::size_of::<ObjRef>()
    }

    pub fn walk(&mut self, visit: &mut dyn FnMut(&mut ObjRef)) {
        for key in &mut self.keys {
            visit(key);
        }
        for val in &mut self.vals {
            visit(val);
        }
    }
}

fn capacity_of(mapper_size: usize) -> usize {
    mapper_size * 2 / 3
}

/// Iterator over the probe sequence for `(hash, mapper_size)`.
struct Probe {
    mask: u64,
    pert: u64,
    i: u64,
}

impl Probe {
    fn new(hash: u64, mapper_size: usize) -> Self {
        let mask = (mapper_size - 1) as u64;
        Probe {
            mask,
            pert: hash,
            i: hash & mask,
        }
    }

    fn slot(&self) -> usize {
        self.i as usize
    }

    fn step(&mut self) {
        self.pert >>= PERTURB_SHIFT;
        self.i = (self.i.wrapping_mul(5).wrapping_add(self.pert).wrapping_add(1)) & self.mask;
    }
}

enum Found {
    /// Empty slot where a new entry would land.
    Vacant(usize),
    /// Key already present at this entry index.
    Entry(usize),
}

impl Heap {
    pub fn new_map(&mut self, size_hint: usize) -> Result<ObjRef, Error> {
        self.alloc(ObjectKind::Map(MapData::with_room_for(size_hint)))
    }

    fn map_data(&self, map: ObjRef) -> Result<&MapData, Error> {
        match &self.get(map).kind {
            ObjectKind::Map(data) => Ok(data),
            _ => Err(Error::internal(
                ErrorKind::Internal,
                "map operation on a non-map",
            )),
        }
    }

    fn map_data_mut(&mut self, map: ObjRef) -> Result<&mut MapData, Error> {
        match &mut self.get_mut(map).kind {
            ObjectKind::Map(data) => Ok(data),
            _ => Err(Error::internal(
                ErrorKind::Internal,
                "map operation on a non-map",
            )),
        }
    }

    /// Walks the probe sequence until it hits an empty slot or an equal key.
    fn map_probe(&self, map: ObjRef, key: ObjRef, hash: u64) -> Result<Found, Error> {
        let data = self.map_data(map)?;
        let mut probe = Probe::new(hash, data.mapper.len());

        loop {
            let k = data.mapper[probe.slot()];
            if k == -1 {
                return Ok(Found::Vacant(probe.slot()));
            }
            if self.compare(key, data.keys[k as usize]) {
                return Ok(Found::Entry(k as usize));
            }
            probe.step();
        }
    }

    /// Lookup. A missing key is `None`, not an error; callers decide what a
    /// miss means.
    pub fn map_select(&self, map: ObjRef, key: ObjRef) -> Result<Option<ObjRef>, Error> {
        let data = self.map_data(map)?;
        if data.mapper.is_empty() {
            return Ok(None);
        }

        let hash = self.key_hash(key)?;
        match self.map_probe(map, key, hash)? {
            Found::Vacant(_) => Ok(None),
            Found::Entry(index) => Ok(Some(self.map_data(map)?.vals[index])),
        }
    }

    /// Inserts or overwrites. On first insertion the key is duplicated via
    /// its copy capability; overwrites reuse the stored key.
    pub fn map_insert(&mut self, map: ObjRef, key: ObjRef, value: ObjRef) -> Result<(), Error> {
        // Grow before probing so the probe's slot stays valid at the write.
        let (count, capacity) = {
            let data = self.map_data(map)?;
            (data.count(), data.capacity())
        };
        if count == capacity {
            self.map_grow(map)?;
        }

        let hash = self.key_hash(key)?;
        match self.map_probe(map, key, hash)? {
            Found::Entry(index) => {
                self.map_data_mut(map)?.vals[index] = value;
                Ok(())
            }
            Found::Vacant(slot) => {
                let key_copy = self.copy_value(key)?;
                self.charge(2 * std::mem::size_of::<ObjRef>())?;

                let data = self.map_data_mut(map)?;
                data.mapper[slot] = data.keys.len() as i32;
                data.keys.push(key_copy);
                data.vals.push(value);
                Ok(())
            }
        }
    }

    pub fn map_count(&self, map: ObjRef) -> Result<usize, Error> {
        Ok(self.map_data(map)?.count())
    }

    /// Doubles the probe table and re-probes every entry, preserving
    /// insertion order exactly. Nothing is touched until the new storage has
    /// been paid for, so a failed growth leaves the map unchanged.
    fn map_grow(&mut self, map: ObjRef) -> Result<(), Error> {
        let (old_mapper_size, keys) = {
            let data = self.map_data(map)?;
            (data.mapper.len(), data.keys.clone())
        };

        let new_mapper_size = old_mapper_size << 1;
        self.charge((new_mapper_size - old_mapper_size) * std::mem::size_of::<i32>())?;

        let mut mapper = vec![-1i32; new_mapper_size];
        for (entry, &key) in keys.iter().enumerate() {
            // The stored key was hashed at insertion, so this cannot fail.
            let hash = self.key_hash(key)?;
            let mut probe = Probe::new(hash, new_mapper_size);
            while mapper[probe.slot()] != -1 {
                probe.step();
            }
            mapper[probe.slot()] = entry as i32;
        }

        self.map_data_mut(map)?.mapper = mapper;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_key(heap: &mut Heap, v: i64) -> ObjRef {
        heap.new_int(v).unwrap()
    }

    fn str_key(heap: &mut Heap, s: &str) -> ObjRef {
        heap.new_str(s).unwrap()
    }

    fn insert_int(heap: &mut Heap, map: ObjRef, k: i64, v: i64) {
        let key = int_key(heap, k);
        let val = int_key(heap, v);
        heap.map_insert(map, key, val).unwrap();
    }

    fn select_int(heap: &mut Heap, map: ObjRef, k: i64) -> Option<i64> {
        let key = int_key(heap, k);
        heap.map_select(map, key).unwrap().map(|r| match heap.get(r).kind {
            ObjectKind::Int(v) => v,
            _ => panic!("expected int value"),
        })
    }

    fn invariants(heap: &Heap, map: ObjRef) {
        let data = match &heap.get(map).kind {
            ObjectKind::Map(data) => data,
            _ => panic!("expected map"),
        };
        assert!(data.mapper_size().is_power_of_two());
        assert_eq!(data.capacity(), data.mapper_size() * 2 / 3);
        assert!(data.count() <= data.capacity());
        for &slot in &data.mapper {
            assert!(slot >= -1 && slot < data.count() as i32);
        }
    }

    #[test]
    fn test_new_map_shape() {
        let mut heap = Heap::new();
        let map = heap.new_map(0).unwrap();
        invariants(&heap, map);
        assert_eq!(heap.map_count(map).unwrap(), 0);
    }

    #[test]
    fn test_size_hint_presizes() {
        let mut heap = Heap::new();
        let map = heap.new_map(20).unwrap();
        let data = match &heap.get(map).kind {
            ObjectKind::Map(data) => data,
            _ => unreachable!(),
        };
        assert!(data.capacity() >= 20);
        invariants(&heap, map);
    }

    #[test]
    fn test_select_missing_is_none() {
        let mut heap = Heap::new();
        let map = heap.new_map(0).unwrap();
        assert_eq!(select_int(&mut heap, map, 1), None);
    }

    #[test]
    fn test_insert_then_select() {
        let mut heap = Heap::new();
        let map = heap.new_map(0).unwrap();

        insert_int(&mut heap, map, 1, 10);
        insert_int(&mut heap, map, 2, 20);

        assert_eq!(select_int(&mut heap, map, 1), Some(10));
        assert_eq!(select_int(&mut heap, map, 2), Some(20));
        assert_eq!(select_int(&mut heap, map, 3), None);
        invariants(&heap, map);
    }

    #[test]
    fn test_overwrite_keeps_insertion_order() {
        let mut heap = Heap::new();
        let map = heap.new_map(0).unwrap();

        insert_int(&mut heap, map, 1, 10);
        insert_int(&mut heap, map, 2, 20);
        insert_int(&mut heap, map, 1, 11);

        assert_eq!(heap.map_count(map).unwrap(), 2);
        assert_eq!(select_int(&mut heap, map, 1), Some(11));

        // First entry is still key 1.
        let data = match &heap.get(map).kind {
            ObjectKind::Map(data) => data,
            _ => unreachable!(),
        };
        let (first_key, _) = data.entry(0);
        assert!(matches!(heap.get(first_key).kind, ObjectKind::Int(1)));
    }

    #[test]
    fn test_string_keys() {
        let mut heap = Heap::new();
        let map = heap.new_map(0).unwrap();

        let k1 = str_key(&mut heap, "alpha");
        let v1 = int_key(&mut heap, 1);
        heap.map_insert(map, k1, v1).unwrap();

        // A different object with equal contents finds the entry.
        let k2 = str_key(&mut heap, "alpha");
        assert_eq!(heap.map_select(map, k2).unwrap(), Some(v1));
    }

    #[test]
    fn test_key_is_copied_on_insert() {
        let mut heap = Heap::new();
        let map = heap.new_map(0).unwrap();

        let key = str_key(&mut heap, "k");
        let val = int_key(&mut heap, 1);
        heap.map_insert(map, key, val).unwrap();

        let data = match &heap.get(map).kind {
            ObjectKind::Map(data) => data,
            _ => unreachable!(),
        };
        let (stored, _) = data.entry(0);
        assert_ne!(stored, key);
    }

    #[test]
    fn test_sixth_key_triggers_growth() {
        let mut heap = Heap::new();
        let map = heap.new_map(0).unwrap();

        // mapper_size 8 → capacity 5.
        for k in 0..5 {
            insert_int(&mut heap, map, k, k * 10);
        }
        let before = match &heap.get(map).kind {
            ObjectKind::Map(data) => data.mapper_size(),
            _ => unreachable!(),
        };
        assert_eq!(before, 8);

        insert_int(&mut heap, map, 5, 50);

        let after = match &heap.get(map).kind {
            ObjectKind::Map(data) => data.mapper_size(),
            _ => unreachable!(),
        };
        assert_eq!(after, 16);
        assert_eq!(heap.map_count(map).unwrap(), 6);
        for k in 0..6 {
            assert_eq!(select_int(&mut heap, map, k), Some(k * 10));
        }
        invariants(&heap, map);
    }

    #[test]
    fn test_growth_preserves_insertion_order() {
        let mut heap = Heap::new();
        let map = heap.new_map(0).unwrap();

        for k in 0..20 {
            insert_int(&mut heap, map, 100 - k, k);
        }

        let data = match &heap.get(map).kind {
            ObjectKind::Map(data) => data,
            _ => unreachable!(),
        };
        for i in 0..20 {
            let (key, _) = data.entry(i);
            assert!(matches!(heap.get(key).kind, ObjectKind::Int(v) if v == 100 - i as i64));
        }
        invariants(&heap, map);
    }

    #[test]
    fn test_many_inserts_stay_retrievable() {
        let mut heap = Heap::new();
        let map = heap.new_map(0).unwrap();

        for k in 0..200 {
            insert_int(&mut heap, map, k * 7, k);
        }
        for k in 0..200 {
            assert_eq!(select_int(&mut heap, map, k * 7), Some(k));
        }
        invariants(&heap, map);
    }

    #[test]
    fn test_unhashable_key_fails() {
        let mut heap = Heap::new();
        let map = heap.new_map(0).unwrap();
        let list = heap.new_list(0).unwrap();
        let val = int_key(&mut heap, 1);

        let err = heap.map_insert(map, list, val).unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnhashableKey);

        let err = heap.map_select(map, list).unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnhashableKey);
    }

    #[test]
    fn test_failed_growth_leaves_map_unchanged() {
        // A tight budget: room for the setup inserts, but not for growth.
        let mut heap = Heap::with_limit(4096);
        let map = heap.new_map(0).unwrap();

        for k in 0..5 {
            insert_int(&mut heap, map, k, k);
        }

        // Reserve the probe key before starving the heap.
        let key = heap.new_int(99).unwrap();
        let val = heap.new_int(1).unwrap();

        // Exhaust the budget to the last byte so growth cannot be paid for.
        while heap.charge(1).is_ok() {}

        let before = match &heap.get(map).kind {
            ObjectKind::Map(data) => (data.mapper_size(), data.count()),
            _ => unreachable!(),
        };

        let err = heap.map_insert(map, key, val).unwrap_err();
        assert_eq!(err.kind, ErrorKind::OutOfMemory);

        let after = match &heap.get(map).kind {
            ObjectKind::Map(data) => (data.mapper_size(), data.count()),
            _ => unreachable!(),
        };
        assert_eq!(before, after);
        for k in 0..5 {
            assert_eq!(select_int(&mut heap, map, k), Some(k));
        }
    }

    #[test]
    fn test_probe_sequence_is_deterministic() {
        let mut a = Probe::new(0xdeadbeef, 64);
        let mut b = Probe::new(0xdeadbeef, 64);
        for _ in 0..32 {
            assert_eq!(a.slot(), b.slot());
            a.step();
            b.step();
        }
    }

    #[test]
    fn test_probe_first_slot_is_hash_masked() {
        let probe = Probe::new(0x1234, 8);
        assert_eq!(probe.slot(), 0x1234 & 7);
    }
}
