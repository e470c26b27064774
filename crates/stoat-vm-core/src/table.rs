//! Open-addressed hash table
//!
//! Used for the globals table, class method tables, instance fields, and
//! string interning. Keys are handles to interned strings, so key equality
//! is handle equality; probing starts from the key's precomputed hash.
//!
//! Linear probing with tombstones; capacity is always a power of two so
//! indexing is a bit-mask. Each entry carries its key's hash so growth and
//! probing never need to consult the heap.

use stoat_vm_bytecode::{ObjRef, Value};

/// Grow when `count + 1` exceeds three quarters of capacity.
const TABLE_MAX_LOAD_NUM: usize = 3;
const TABLE_MAX_LOAD_DEN: usize = 4;

/// One bucket.
///
/// Three states: live (`key` is `Some`), empty (`key` is `None`, value
/// `nil`), tombstone (`key` is `None`, value `true`).
#[derive(Debug, Clone, Copy)]
struct Entry {
    key: Option<ObjRef>,
    hash: u32,
    value: Value,
}

impl Entry {
    const EMPTY: Entry = Entry {
        key: None,
        hash: 0,
        value: Value::NIL,
    };

    fn is_tombstone(&self) -> bool {
        self.key.is_none() && !self.value.is_nil()
    }
}

/// Open-addressed hash table keyed by interned strings.
#[derive(Debug, Default, Clone)]
pub struct Table {
    /// Live entries plus tombstones.
    count: usize,
    entries: Vec<Entry>,
}

impl Table {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.key.is_some()).count()
    }

    /// Whether the table holds no live entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Index of the bucket for `key`: the first live entry with that key,
    /// or the first tombstone passed (for reuse on insert), or the first
    /// truly empty bucket.
    fn find_entry(entries: &[Entry], key: ObjRef, hash: u32) -> usize {
        let mask = entries.len() - 1;
        let mut index = hash as usize & mask;
        let mut tombstone: Option<usize> = None;

        loop {
            let entry = &entries[index];
            match entry.key {
                None => {
                    if entry.is_tombstone() {
                        if tombstone.is_none() {
                            tombstone = Some(index);
                        }
                    } else {
                        return tombstone.unwrap_or(index);
                    }
                }
                Some(k) if k == key => return index,
                Some(_) => {}
            }
            index = (index + 1) & mask;
        }
    }

    fn adjust_capacity(&mut self, capacity: usize) {
        let mut entries = vec![Entry::EMPTY; capacity];

        // Rehash live entries only; dropping tombstones shrinks the count.
        self.count = 0;
        for entry in &self.entries {
            let Some(key) = entry.key else { continue };
            let dest = Self::find_entry(&entries, key, entry.hash);
            entries[dest] = *entry;
            self.count += 1;
        }

        self.entries = entries;
    }

    /// Insert or update. Returns `true` when the key was not present.
    pub fn set(&mut self, key: ObjRef, hash: u32, value: Value) -> bool {
        if (self.count + 1) * TABLE_MAX_LOAD_DEN > self.entries.len() * TABLE_MAX_LOAD_NUM {
            let capacity = if self.entries.is_empty() {
                8
            } else {
                self.entries.len() * 2
            };
            self.adjust_capacity(capacity);
        }

        let index = Self::find_entry(&self.entries, key, hash);
        let entry = &mut self.entries[index];
        let is_new = entry.key.is_none();
        // A reused tombstone was already counted.
        if is_new && entry.value.is_nil() {
            self.count += 1;
        }

        *entry = Entry {
            key: Some(key),
            hash,
            value,
        };
        is_new
    }

    /// Look up a key.
    pub fn get(&self, key: ObjRef, hash: u32) -> Option<Value> {
        if self.entries.is_empty() {
            return None;
        }
        let index = Self::find_entry(&self.entries, key, hash);
        let entry = &self.entries[index];
        entry.key.map(|_| entry.value)
    }

    /// Delete a key, leaving a tombstone so probe chains stay intact.
    /// Returns `true` when the key was present.
    pub fn delete(&mut self, key: ObjRef, hash: u32) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let index = Self::find_entry(&self.entries, key, hash);
        let entry = &mut self.entries[index];
        if entry.key.is_none() {
            return false;
        }
        *entry = Entry {
            key: None,
            hash: 0,
            value: Value::TRUE,
        };
        true
    }

    /// Copy every live entry of `other` into `self` (method inheritance
    /// copy-down).
    pub fn add_all(&mut self, other: &Table) {
        for entry in &other.entries {
            if let Some(key) = entry.key {
                self.set(key, entry.hash, entry.value);
            }
        }
    }

    /// Iterate live `(key, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (ObjRef, Value)> + '_ {
        self.entries
            .iter()
            .filter_map(|e| e.key.map(|k| (k, e.value)))
    }

    /// Content-based lookup for the interning table: probe by `hash` and
    /// compare candidate keys' bytes via `resolve`. Tombstones are skipped.
    pub fn find_string<'a>(
        &self,
        chars: &str,
        hash: u32,
        resolve: impl Fn(ObjRef) -> &'a str,
    ) -> Option<ObjRef> {
        if self.entries.is_empty() {
            return None;
        }
        let mask = self.entries.len() - 1;
        let mut index = hash as usize & mask;
        loop {
            let entry = &self.entries[index];
            match entry.key {
                None => {
                    if !entry.is_tombstone() {
                        return None;
                    }
                }
                Some(key) => {
                    if entry.hash == hash && resolve(key) == chars {
                        return Some(key);
                    }
                }
            }
            index = (index + 1) & mask;
        }
    }

    /// Delete every entry whose key is unmarked. Run by the GC before the
    /// sweep so the interning table's weak references cannot resurrect
    /// dead strings.
    pub fn remove_white(&mut self, is_marked: impl Fn(ObjRef) -> bool) {
        for entry in &mut self.entries {
            if let Some(key) = entry.key {
                if !is_marked(key) {
                    *entry = Entry {
                        key: None,
                        hash: 0,
                        value: Value::TRUE,
                    };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(i: u32) -> ObjRef {
        ObjRef::new(i)
    }

    // A spread-out fake hash; tests never consult a heap.
    fn hash(i: u32) -> u32 {
        i.wrapping_mul(2654435761)
    }

    #[test]
    fn test_set_get() {
        let mut table = Table::new();
        assert!(table.set(key(1), hash(1), Value::number(10.0)));
        assert!(table.set(key(2), hash(2), Value::number(20.0)));
        assert_eq!(table.get(key(1), hash(1)), Some(Value::number(10.0)));
        assert_eq!(table.get(key(2), hash(2)), Some(Value::number(20.0)));
        assert_eq!(table.get(key(3), hash(3)), None);
    }

    #[test]
    fn test_set_overwrites() {
        let mut table = Table::new();
        assert!(table.set(key(1), hash(1), Value::number(1.0)));
        assert!(!table.set(key(1), hash(1), Value::number(2.0)));
        assert_eq!(table.get(key(1), hash(1)), Some(Value::number(2.0)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_delete_leaves_probe_chain_intact() {
        let mut table = Table::new();
        // Three keys with identical hashes form one probe chain.
        let h = 0x1234;
        table.set(key(1), h, Value::number(1.0));
        table.set(key(2), h, Value::number(2.0));
        table.set(key(3), h, Value::number(3.0));

        assert!(table.delete(key(2), h));
        assert!(!table.delete(key(2), h));

        // The chain still reaches the entry past the tombstone.
        assert_eq!(table.get(key(3), h), Some(Value::number(3.0)));
        assert_eq!(table.get(key(2), h), None);
    }

    #[test]
    fn test_tombstone_reused_on_insert() {
        let mut table = Table::new();
        let h = 0x77;
        table.set(key(1), h, Value::number(1.0));
        table.set(key(2), h, Value::number(2.0));
        table.delete(key(1), h);
        table.set(key(4), h, Value::number(4.0));
        assert_eq!(table.get(key(2), h), Some(Value::number(2.0)));
        assert_eq!(table.get(key(4), h), Some(Value::number(4.0)));
    }

    #[test]
    fn test_growth_rehashes() {
        let mut table = Table::new();
        for i in 0..100 {
            table.set(key(i), hash(i), Value::number(i as f64));
        }
        assert_eq!(table.len(), 100);
        for i in 0..100 {
            assert_eq!(table.get(key(i), hash(i)), Some(Value::number(i as f64)));
        }
    }

    #[test]
    fn test_add_all() {
        let mut from = Table::new();
        from.set(key(1), hash(1), Value::TRUE);
        from.set(key(2), hash(2), Value::FALSE);

        let mut to = Table::new();
        to.set(key(2), hash(2), Value::NIL);
        to.add_all(&from);

        assert_eq!(to.get(key(1), hash(1)), Some(Value::TRUE));
        // add_all overwrites, matching method copy-down semantics
        assert_eq!(to.get(key(2), hash(2)), Some(Value::FALSE));
    }

    #[test]
    fn test_find_string() {
        let mut table = Table::new();
        let names = ["alpha", "beta", "gamma"];
        for (i, _) in names.iter().enumerate() {
            table.set(key(i as u32), hash(i as u32), Value::NIL);
        }
        let resolve = |r: ObjRef| names[r.index()];
        assert_eq!(
            table.find_string("beta", hash(1), resolve),
            Some(key(1))
        );
        assert_eq!(table.find_string("delta", hash(1), resolve), None);
    }

    #[test]
    fn test_remove_white() {
        let mut table = Table::new();
        for i in 0..10 {
            table.set(key(i), hash(i), Value::NIL);
        }
        // Only even keys are "marked".
        table.remove_white(|k| k.0 % 2 == 0);
        assert_eq!(table.len(), 5);
        assert_eq!(table.get(key(2), hash(2)), Some(Value::NIL));
        assert_eq!(table.get(key(3), hash(3)), None);
    }
}
