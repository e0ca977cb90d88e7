//! Growable chained hash table keyed by hidden object addresses.
//!
//! Entries live in an index arena (`slots`); each bucket holds the index of
//! the first entry of its chain and each entry carries the index of the next
//! one in its embedded [`ChainLink`]. Vacant slots form a free list threaded
//! through the arena, so removing an entry never allocates.
//!
//! ## Layout
//!
//! ```text
//! buckets:  [ 3 | - | 0 | - ]          2^log_size heads
//!             |       |
//! slots:    [ E0 -> - | vacant -> - | free | E3 -> 0 ]
//! ```

use crate::error::{GcError, GcResult};
use crate::hidden::HiddenPointer;

/// Index of an entry in the table's arena.
pub type EntryIndex = u32;

/// Key and chain pointer shared by every entry kind.
#[derive(Debug, Clone, Copy)]
pub struct ChainLink {
    /// Hidden address the entry is keyed by
    pub hidden_key: HiddenPointer,
    /// Next entry in the same bucket
    next: Option<EntryIndex>,
}

impl ChainLink {
    /// Create a link for the given (not yet hidden) key address.
    pub fn new(key: usize) -> Self {
        Self {
            hidden_key: HiddenPointer::hide(key),
            next: None,
        }
    }

    /// The revealed key address.
    #[inline]
    pub fn key(&self) -> usize {
        self.hidden_key.reveal()
    }
}

/// An entry kind that embeds a [`ChainLink`].
pub trait ChainEntry {
    /// Shared chain header
    fn link(&self) -> &ChainLink;

    /// Shared chain header (mutable)
    fn link_mut(&mut self) -> &mut ChainLink;
}

enum Slot<E> {
    Occupied(E),
    Vacant { next_free: Option<EntryIndex> },
}

/// Bucket index for `addr` in a table of `2^log_size` buckets.
///
/// Mixes in the bits above the table size so that allocator alignment does
/// not decide bucket selection on its own.
#[inline]
pub fn hash(addr: usize, log_size: u32) -> usize {
    ((addr >> 3) ^ (addr >> (3 + log_size))) & ((1usize << log_size) - 1)
}

/// Chained hash table over an index arena.
pub struct HashTable<E> {
    /// Chain heads, `2^log_size` of them
    buckets: Vec<Option<EntryIndex>>,
    /// Binary log of the bucket count; `None` while the table has no buckets
    log_size: Option<u32>,
    /// Entry arena
    slots: Vec<Slot<E>>,
    /// Head of the vacant-slot list
    free_head: Option<EntryIndex>,
    /// Number of occupied slots
    entry_count: usize,
    /// Arena size past which reservations fail
    slot_limit: Option<usize>,
}

impl<E: ChainEntry> HashTable<E> {
    /// Create an empty table with no buckets.
    pub fn new() -> Self {
        Self {
            buckets: Vec::new(),
            log_size: None,
            slots: Vec::new(),
            free_head: None,
            entry_count: 0,
            slot_limit: None,
        }
    }

    /// Make reservations fail once the arena holds `limit` slots.
    #[cfg(test)]
    pub(crate) fn set_slot_limit(&mut self, limit: Option<usize>) {
        self.slot_limit = limit;
    }

    /// Number of entries.
    #[inline]
    pub fn len(&self) -> usize {
        self.entry_count
    }

    /// Returns true if the table holds no entries.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entry_count == 0
    }

    /// Number of buckets.
    #[inline]
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Binary log of the bucket count, `None` before the first growth.
    #[inline]
    pub fn log_size(&self) -> Option<u32> {
        self.log_size
    }

    /// Whether an insertion should be preceded by [`HashTable::grow`].
    #[inline]
    pub fn needs_growth(&self) -> bool {
        match self.log_size {
            None => true,
            Some(log) => self.entry_count > (1usize << log),
        }
    }

    /// Double the bucket count and rehash every entry in place.
    ///
    /// Returns false, leaving the table untouched, if the new bucket array
    /// cannot be allocated. The table keeps working with longer chains.
    ///
    /// # Panics
    /// Panics if the very first bucket array cannot be allocated.
    pub fn grow(&mut self) -> bool {
        let new_log = self.log_size.map_or(0, |log| log + 1);
        let new_size = 1usize << new_log;

        let mut new_buckets: Vec<Option<EntryIndex>> = Vec::new();
        if new_buckets.try_reserve_exact(new_size).is_err() {
            if self.buckets.is_empty() {
                panic!("Insufficient space for initial table allocation");
            }
            return false;
        }
        new_buckets.resize(new_size, None);

        let old_buckets = std::mem::take(&mut self.buckets);
        for head in old_buckets {
            let mut cursor = head;
            while let Some(idx) = cursor {
                let link = self.link_at_mut(idx);
                let next = link.next;
                let bucket = hash(link.key(), new_log);
                link.next = new_buckets[bucket];
                new_buckets[bucket] = Some(idx);
                cursor = next;
            }
        }

        self.buckets = new_buckets;
        self.log_size = Some(new_log);
        true
    }

    /// Bucket that `addr` hashes to.
    ///
    /// # Panics
    /// Panics if the table has no buckets yet.
    #[inline]
    pub fn bucket_of(&self, addr: usize) -> usize {
        let log = self.log_size.expect("hash table has no buckets");
        hash(addr, log)
    }

    /// Locate the entry keyed by `addr`.
    pub fn find(&self, addr: usize) -> Option<EntryIndex> {
        if self.buckets.is_empty() {
            return None;
        }
        let key = HiddenPointer::hide(addr);
        let mut cursor = self.buckets[self.bucket_of(addr)];
        while let Some(idx) = cursor {
            let link = self.link_at(idx);
            if link.hidden_key == key {
                return Some(idx);
            }
            cursor = link.next;
        }
        None
    }

    /// Entry at `idx`.
    ///
    /// # Panics
    /// Panics if the slot is vacant.
    pub fn get(&self, idx: EntryIndex) -> &E {
        match &self.slots[idx as usize] {
            Slot::Occupied(entry) => entry,
            Slot::Vacant { .. } => panic!("vacant hash table slot {idx}"),
        }
    }

    /// Entry at `idx` (mutable).
    ///
    /// # Panics
    /// Panics if the slot is vacant.
    pub fn get_mut(&mut self, idx: EntryIndex) -> &mut E {
        match &mut self.slots[idx as usize] {
            Slot::Occupied(entry) => entry,
            Slot::Vacant { .. } => panic!("vacant hash table slot {idx}"),
        }
    }

    /// Make sure the next [`HashTable::try_insert`] does not need to allocate.
    pub fn try_reserve_entry(&mut self) -> GcResult<()> {
        if self.free_head.is_some() {
            return Ok(());
        }
        if self.slot_limit.is_some_and(|limit| self.slots.len() >= limit) {
            return Err(GcError::OutOfMemory);
        }
        self.slots.try_reserve(1).map_err(|_| GcError::OutOfMemory)
    }

    /// Insert `entry` at the head of its bucket's chain.
    ///
    /// Does not check for an existing entry with the same key. Returns the
    /// entry back if its arena slot could not be allocated.
    ///
    /// # Panics
    /// Panics if the table has no buckets yet.
    pub fn try_insert(&mut self, mut entry: E) -> Result<EntryIndex, E> {
        let bucket = self.bucket_of(entry.link().key());
        if self.try_reserve_entry().is_err() {
            return Err(entry);
        }
        entry.link_mut().next = self.buckets[bucket];

        let idx = match self.free_head {
            Some(idx) => {
                let Slot::Vacant { next_free } = self.slots[idx as usize] else {
                    unreachable!("free list points at an occupied slot");
                };
                self.free_head = next_free;
                self.slots[idx as usize] = Slot::Occupied(entry);
                idx
            }
            None => {
                let idx = self.slots.len() as EntryIndex;
                self.slots.push(Slot::Occupied(entry));
                idx
            }
        };

        self.buckets[bucket] = Some(idx);
        self.entry_count += 1;
        Ok(idx)
    }

    /// Unlink and return the entry keyed by `addr`.
    pub fn remove(&mut self, addr: usize) -> Option<E> {
        if self.buckets.is_empty() {
            return None;
        }
        let key = HiddenPointer::hide(addr);
        let bucket = self.bucket_of(addr);
        let mut prev: Option<EntryIndex> = None;
        let mut cursor = self.buckets[bucket];
        while let Some(idx) = cursor {
            let link = *self.link_at(idx);
            if link.hidden_key == key {
                match prev {
                    None => self.buckets[bucket] = link.next,
                    Some(p) => self.link_at_mut(p).next = link.next,
                }
                return Some(self.release(idx));
            }
            prev = Some(idx);
            cursor = link.next;
        }
        None
    }

    /// Walk every entry in bucket-then-chain order, unlinking those for which
    /// `pred` returns true and handing them to `sink`.
    ///
    /// Returns the number of entries removed.
    pub fn extract_if(
        &mut self,
        mut pred: impl FnMut(&mut E) -> bool,
        mut sink: impl FnMut(E),
    ) -> usize {
        let mut removed = 0;
        for bucket in 0..self.buckets.len() {
            let mut prev: Option<EntryIndex> = None;
            let mut cursor = self.buckets[bucket];
            while let Some(idx) = cursor {
                let next = self.link_at(idx).next;
                if pred(self.get_mut(idx)) {
                    match prev {
                        None => self.buckets[bucket] = next,
                        Some(p) => self.link_at_mut(p).next = next,
                    }
                    sink(self.release(idx));
                    removed += 1;
                } else {
                    prev = Some(idx);
                }
                cursor = next;
            }
        }
        removed
    }

    /// Keep only entries for which `keep` returns true.
    pub fn retain(&mut self, mut keep: impl FnMut(&mut E) -> bool) -> usize {
        self.extract_if(|entry| !keep(entry), drop)
    }

    /// Iterate over entries in bucket-then-chain order.
    pub fn iter(&self) -> Iter<'_, E> {
        Iter {
            table: self,
            bucket: 0,
            cursor: None,
        }
    }

    fn link_at(&self, idx: EntryIndex) -> &ChainLink {
        self.get(idx).link()
    }

    fn link_at_mut(&mut self, idx: EntryIndex) -> &mut ChainLink {
        self.get_mut(idx).link_mut()
    }

    fn release(&mut self, idx: EntryIndex) -> E {
        let slot = std::mem::replace(
            &mut self.slots[idx as usize],
            Slot::Vacant {
                next_free: self.free_head,
            },
        );
        self.free_head = Some(idx);
        self.entry_count -= 1;
        match slot {
            Slot::Occupied(mut entry) => {
                entry.link_mut().next = None;
                entry
            }
            Slot::Vacant { .. } => unreachable!("released a vacant slot"),
        }
    }
}

impl<E: ChainEntry> Default for HashTable<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> std::fmt::Debug for HashTable<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashTable")
            .field("entries", &self.entry_count)
            .field("buckets", &self.buckets.len())
            .finish()
    }
}

/// Bucket-order iterator over a [`HashTable`].
pub struct Iter<'a, E> {
    table: &'a HashTable<E>,
    bucket: usize,
    cursor: Option<EntryIndex>,
}

impl<'a, E: ChainEntry> Iterator for Iter<'a, E> {
    type Item = &'a E;

    fn next(&mut self) -> Option<&'a E> {
        loop {
            if let Some(idx) = self.cursor {
                let entry = self.table.get(idx);
                self.cursor = entry.link().next;
                return Some(entry);
            }
            if self.bucket >= self.table.buckets.len() {
                return None;
            }
            self.cursor = self.table.buckets[self.bucket];
            self.bucket += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    struct TestEntry {
        link: ChainLink,
        value: u32,
    }

    impl TestEntry {
        fn new(key: usize, value: u32) -> Self {
            Self {
                link: ChainLink::new(key),
                value,
            }
        }
    }

    impl ChainEntry for TestEntry {
        fn link(&self) -> &ChainLink {
            &self.link
        }

        fn link_mut(&mut self) -> &mut ChainLink {
            &mut self.link
        }
    }

    fn insert(table: &mut HashTable<TestEntry>, key: usize, value: u32) {
        if table.needs_growth() {
            table.grow();
        }
        assert!(table.try_insert(TestEntry::new(key, value)).is_ok());
    }

    #[test]
    fn test_empty_table() {
        let table: HashTable<TestEntry> = HashTable::new();
        assert!(table.is_empty());
        assert!(table.needs_growth());
        assert_eq!(table.log_size(), None);
        assert_eq!(table.find(0x1000), None);
    }

    #[test]
    fn test_first_growth_allocates_one_bucket() {
        let mut table: HashTable<TestEntry> = HashTable::new();
        assert!(table.grow());
        assert_eq!(table.bucket_count(), 1);
        assert_eq!(table.log_size(), Some(0));
    }

    #[test]
    fn test_hash_stays_in_range() {
        for log in 0..8 {
            for addr in (0..4096usize).step_by(8) {
                assert!(hash(addr, log) < (1 << log));
            }
        }
    }

    #[test]
    fn test_insert_find_remove() {
        let mut table = HashTable::new();
        insert(&mut table, 0x1000, 1);
        insert(&mut table, 0x2000, 2);

        let idx = table.find(0x2000).unwrap();
        assert_eq!(table.get(idx).value, 2);

        let removed = table.remove(0x1000).unwrap();
        assert_eq!(removed.value, 1);
        assert_eq!(table.len(), 1);
        assert_eq!(table.find(0x1000), None);
        assert!(table.remove(0x1000).is_none());
    }

    #[test]
    fn test_vacant_slots_are_reused() {
        let mut table = HashTable::new();
        insert(&mut table, 0x1000, 1);
        let first = table.find(0x1000).unwrap();
        table.remove(0x1000);
        insert(&mut table, 0x3000, 3);
        assert_eq!(table.find(0x3000), Some(first));
    }

    #[test]
    fn test_slot_limit_fails_insert_until_slot_freed() {
        let mut table = HashTable::new();
        table.set_slot_limit(Some(2));
        insert(&mut table, 0x1000, 1);
        insert(&mut table, 0x2000, 2);

        assert_eq!(table.try_reserve_entry(), Err(GcError::OutOfMemory));
        let rejected = table.try_insert(TestEntry::new(0x3000, 3));
        assert_eq!(rejected.err().map(|e| e.value), Some(3));

        // A vacated slot is reused without growing the arena.
        assert!(table.remove(0x1000).is_some());
        assert!(table.try_insert(TestEntry::new(0x3000, 3)).is_ok());
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_extract_if_unlinks_matching_entries() {
        let mut table = HashTable::new();
        for i in 0..32u32 {
            insert(&mut table, 0x10_000 + (i as usize) * 16, i);
        }

        let mut extracted = Vec::new();
        let removed = table.extract_if(|e| e.value % 2 == 0, |e| extracted.push(e.value));

        assert_eq!(removed, 16);
        assert_eq!(table.len(), 16);
        assert!(extracted.iter().all(|v| v % 2 == 0));
        assert!(table.iter().all(|e| e.value % 2 == 1));
        for i in (1..32u32).step_by(2) {
            assert!(table.find(0x10_000 + (i as usize) * 16).is_some());
        }
    }

    #[test]
    fn test_growth_keeps_every_entry() {
        let mut table = HashTable::new();
        for i in 0..200u32 {
            insert(&mut table, 0x8000 + (i as usize) * 48, i);
        }
        // 200 entries force growth up to at least 128 buckets.
        assert!(table.bucket_count() >= 128);
        assert_eq!(table.iter().count(), 200);
        for i in 0..200u32 {
            let idx = table.find(0x8000 + (i as usize) * 48).unwrap();
            assert_eq!(table.get(idx).value, i);
        }
    }

    proptest! {
        #[test]
        fn prop_growth_preserves_membership(
            keys in proptest::collection::hash_set(1usize..(1 << 40), 1..300)
        ) {
            let mut table = HashTable::new();
            let keys: Vec<usize> = keys.into_iter().map(|k| k << 3).collect();
            for (i, &key) in keys.iter().enumerate() {
                insert(&mut table, key, i as u32);
            }
            prop_assert_eq!(table.len(), keys.len());
            for (i, &key) in keys.iter().enumerate() {
                let idx = table.find(key);
                prop_assert!(idx.is_some());
                prop_assert_eq!(table.get(idx.unwrap()).value, i as u32);
            }
        }
    }
}
