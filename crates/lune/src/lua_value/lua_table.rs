// LuaTable - hybrid array + hash associative container.
//
// Dense integer keys from 1 live in the array part; everything else goes
// to an insertion-ordered hash part. `next` iterates array then hash and
// tolerates removal of the current key (nil tombstones are skipped and
// compacted outside iteration).

use ahash::RandomState;
use indexmap::IndexMap;

use crate::gc::TableId;
use crate::lua_value::{LuaValue, TableKey};

pub struct LuaTable {
    /// Array part: index 0 holds key 1.
    array: Vec<LuaValue>,
    /// Hash part for non-dense keys.
    hash: IndexMap<TableKey, LuaValue, RandomState>,
    metatable: Option<TableId>,
    /// Weak-mode flags, cached from the `__mode` metafield when the
    /// metatable is installed. Consulted by GC traversal only.
    pub(crate) weak_keys: bool,
    pub(crate) weak_values: bool,
}

impl LuaTable {
    pub fn new(array_hint: usize, hash_hint: usize) -> Self {
        LuaTable {
            array: Vec::with_capacity(array_hint),
            hash: IndexMap::with_capacity_and_hasher(hash_hint, RandomState::new()),
            metatable: None,
            weak_keys: false,
            weak_values: false,
        }
    }

    // ===== metatable =====

    #[inline(always)]
    pub fn metatable(&self) -> Option<TableId> {
        self.metatable
    }

    /// Install or clear the metatable. Weak-mode flags are set separately
    /// by the VM after reading `__mode`.
    pub fn set_metatable(&mut self, mt: Option<TableId>) {
        self.metatable = mt;
        if mt.is_none() {
            self.weak_keys = false;
            self.weak_values = false;
        }
    }

    #[inline(always)]
    pub fn is_weak(&self) -> bool {
        self.weak_keys || self.weak_values
    }

    // ===== raw access =====

    /// Raw get, no metamethods. Absent keys read as nil.
    pub fn raw_get(&self, key: &LuaValue) -> LuaValue {
        if let LuaValue::Integer(i) = key {
            return self.raw_geti(*i);
        }
        match TableKey::from_value(key) {
            Some(TableKey::Integer(i)) => self.raw_geti(i),
            Some(tk) => self.hash.get(&tk).copied().unwrap_or(LuaValue::Nil),
            None => LuaValue::Nil,
        }
    }

    /// Raw set, no metamethods. Setting nil removes the key. Errors on nil
    /// or NaN keys are the caller's job (the VM raises them); here they
    /// are ignored to keep the container total.
    pub fn raw_set(&mut self, key: &LuaValue, value: LuaValue) {
        match TableKey::from_value(key) {
            Some(TableKey::Integer(i)) => self.raw_seti(i, value),
            Some(tk) => {
                if value.is_nil() {
                    // Tombstone only if the key exists, so iteration can
                    // step over a key removed mid-walk.
                    if let Some(slot) = self.hash.get_mut(&tk) {
                        *slot = LuaValue::Nil;
                    }
                } else {
                    self.hash.insert(tk, value);
                }
            }
            None => {}
        }
    }

    /// Integer-key fast path.
    #[inline]
    pub fn raw_geti(&self, key: i64) -> LuaValue {
        if key >= 1 && (key as usize) <= self.array.len() {
            return self.array[(key - 1) as usize];
        }
        self.hash
            .get(&TableKey::Integer(key))
            .copied()
            .unwrap_or(LuaValue::Nil)
    }

    #[inline]
    pub fn raw_seti(&mut self, key: i64, value: LuaValue) {
        if key >= 1 {
            let idx = (key - 1) as usize;
            if idx < self.array.len() {
                // Nil stays in place as a hole; trimming here would shift
                // the border under a live `next` walk.
                self.array[idx] = value;
                return;
            }
            if idx == self.array.len() && !value.is_nil() {
                // Appending at the border: grow the array part, then pull
                // any now-dense keys out of the hash part.
                self.array.push(value);
                self.migrate_hash_to_array();
                return;
            }
        }
        let tk = TableKey::Integer(key);
        if value.is_nil() {
            if let Some(slot) = self.hash.get_mut(&tk) {
                *slot = LuaValue::Nil;
            }
        } else {
            self.hash.insert(tk, value);
        }
    }

    /// Pre-size the parts (the `resize` optimization hint).
    pub fn resize(&mut self, array_hint: usize, hash_hint: usize) {
        if array_hint > self.array.len() {
            self.array.reserve(array_hint - self.array.len());
        }
        self.hash.reserve(hash_hint);
    }

    // ===== length =====

    /// A border: some i with t[i] non-nil and t[i+1] nil (0 for an empty
    /// table). For tables with holes any border is a valid answer.
    pub fn length(&self) -> i64 {
        if self.array.is_empty() {
            // A pure-hash table may still have a dense prefix stored there.
            let mut n: i64 = 0;
            while !self.hash_geti(n + 1).is_nil() {
                n += 1;
            }
            return n;
        }
        if !self.array.last().unwrap().is_nil() {
            let n = self.array.len() as i64;
            // The sequence may continue into the hash part.
            if self.hash_geti(n + 1).is_nil() {
                return n;
            }
            let mut m = n + 1;
            while !self.hash_geti(m + 1).is_nil() {
                m += 1;
            }
            return m;
        }
        // Binary search for a border inside the array part.
        let mut lo = 0usize;
        let mut hi = self.array.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.array[mid].is_nil() {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        lo as i64
    }

    #[inline]
    fn hash_geti(&self, key: i64) -> LuaValue {
        self.hash
            .get(&TableKey::Integer(key))
            .copied()
            .unwrap_or(LuaValue::Nil)
    }

    // ===== iteration =====

    /// Next key-value pair after `key` (nil starts iteration).
    /// Returns Err(()) if the key was never in the table.
    pub fn next(&self, key: &LuaValue) -> Result<Option<(LuaValue, LuaValue)>, ()> {
        let start_hash_from = |from: usize| -> Option<(LuaValue, LuaValue)> {
            for (k, v) in self.hash.iter().skip(from) {
                if !v.is_nil() {
                    return Some((k.to_value(), *v));
                }
            }
            None
        };

        if key.is_nil() {
            for (i, v) in self.array.iter().enumerate() {
                if !v.is_nil() {
                    return Ok(Some((LuaValue::Integer((i + 1) as i64), *v)));
                }
            }
            return Ok(start_hash_from(0));
        }

        // Key inside the array range: scan forward there first.
        if let Some(TableKey::Integer(i)) = TableKey::from_value(key) {
            if i >= 1 && (i as usize) <= self.array.len() {
                for j in (i as usize)..self.array.len() {
                    if !self.array[j].is_nil() {
                        return Ok(Some((LuaValue::Integer((j + 1) as i64), self.array[j])));
                    }
                }
                return Ok(start_hash_from(0));
            }
        }

        let tk = match TableKey::from_value(key) {
            Some(tk) => tk,
            None => return Err(()),
        };
        match self.hash.get_index_of(&tk) {
            Some(pos) => Ok(start_hash_from(pos + 1)),
            None => Err(()),
        }
    }

    /// Number of key-value pairs currently stored (both parts, ignoring
    /// tombstones). Not the `#` operator - that is `length`.
    pub fn pair_count(&self) -> usize {
        self.array.iter().filter(|v| !v.is_nil()).count()
            + self.hash.values().filter(|v| !v.is_nil()).count()
    }

    // ===== maintenance =====

    fn trim_array(&mut self) {
        while self.array.last().is_some_and(|v| v.is_nil()) {
            self.array.pop();
        }
    }

    /// Move keys that became dense into the array part after an append.
    fn migrate_hash_to_array(&mut self) {
        loop {
            let next_key = self.array.len() as i64 + 1;
            match self.hash.swap_remove(&TableKey::Integer(next_key)) {
                Some(v) if !v.is_nil() => self.array.push(v),
                _ => break,
            }
        }
    }

    /// Drop tombstoned hash entries. Called by the GC outside iteration.
    pub fn compact(&mut self) {
        self.hash.retain(|_, v| !v.is_nil());
    }

    // ===== GC support =====

    pub(crate) fn array_values(&self) -> &[LuaValue] {
        &self.array
    }

    pub(crate) fn hash_entries(&self) -> impl Iterator<Item = (&TableKey, &LuaValue)> {
        self.hash.iter()
    }

    /// Remove entries whose weak keys/values died this cycle.
    pub(crate) fn clear_weak_entries<F>(&mut self, weak_keys: bool, weak_values: bool, is_dead: F)
    where
        F: Fn(&LuaValue) -> bool,
    {
        if weak_values {
            for v in self.array.iter_mut() {
                if !v.is_nil() && is_dead(v) {
                    *v = LuaValue::Nil;
                }
            }
            self.trim_array();
        }
        self.hash.retain(|k, v| {
            if weak_keys && is_dead(&k.to_value()) {
                return false;
            }
            if weak_values && !v.is_nil() && is_dead(v) {
                return false;
            }
            true
        });
    }
}
