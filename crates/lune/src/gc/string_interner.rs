// Short-string interner.
//
// Short strings (<= SHORT_STRING_LIMIT bytes) are hash-consed: equal bytes
// always resolve to the same StringId, which makes short-string equality a
// single id comparison. Long strings bypass the interner entirely and
// compare by content. Dead interned entries are dropped during sweep via
// `remove_dead`.

use ahash::RandomState;
use std::collections::HashMap;
use std::hash::{BuildHasher, Hash, Hasher};

use crate::gc::StringId;

pub const SHORT_STRING_LIMIT: usize = 40;

pub struct StringInterner {
    /// Content hash -> candidate ids. Collisions are rare; buckets are
    /// tiny vectors resolved by a content compare.
    map: HashMap<u64, Vec<StringId>, RandomState>,
    hash_builder: RandomState,
}

impl StringInterner {
    pub fn new() -> Self {
        Self {
            map: HashMap::with_capacity_and_hasher(256, RandomState::new()),
            hash_builder: RandomState::new(),
        }
    }

    #[inline(always)]
    pub fn hash_str(&self, s: &str) -> u64 {
        let mut hasher = self.hash_builder.build_hasher();
        s.hash(&mut hasher);
        hasher.finish()
    }

    /// Look up an already-interned short string.
    /// `content_of` resolves a candidate id back to its bytes.
    #[inline]
    pub fn find<'a, F>(&self, hash: u64, s: &str, content_of: F) -> Option<StringId>
    where
        F: Fn(StringId) -> Option<&'a str>,
    {
        let bucket = self.map.get(&hash)?;
        for &id in bucket {
            if let Some(existing) = content_of(id) {
                if existing.len() == s.len() && existing == s {
                    return Some(id);
                }
            }
        }
        None
    }

    /// Record a freshly created short string.
    #[inline]
    pub fn insert(&mut self, hash: u64, id: StringId) {
        self.map.entry(hash).or_default().push(id);
    }

    /// Remove a dead string, called by the GC when an interned string is
    /// swept.
    pub fn remove_dead(&mut self, hash: u64, id: StringId) {
        if let Some(bucket) = self.map.get_mut(&hash) {
            bucket.retain(|&i| i != id);
            if bucket.is_empty() {
                self.map.remove(&hash);
            }
        }
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }
}

impl Default for StringInterner {
    fn default() -> Self {
        Self::new()
    }
}
