// SPDX-License-Identifier: Apache-2.0

//! The broker's descriptor directory (§3 "Descriptor directory (broker
//! side)", §4.1 "Directory").
//!
//! Open addressing keyed by the decimal rendering of "owner/id", growing by
//! 3/2 on insertion failure. Invalidated entries are kept as tombstones
//! rather than removed, so a key can be republished without forcing a
//! rehash — the directory only ever grows for the lifetime of the broker.

use std::os::fd::RawFd;
use xproc_core::DescriptorKey;

const INITIAL_CAPACITY: usize = 32;
const MAX_LOAD_NUM: usize = 2;
const MAX_LOAD_DEN: usize = 3;

#[derive(Clone)]
enum Slot {
    Empty,
    Present { key: DescriptorKey, fd: RawFd },
    Tombstone { key: DescriptorKey },
}

pub struct Directory {
    slots: Vec<Slot>,
    occupied: usize,
}

impl Directory {
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_CAPACITY)
    }

    fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: vec![Slot::Empty; capacity.max(1)],
            occupied: 0,
        }
    }

    fn hash(key: DescriptorKey) -> usize {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.to_string().hash(&mut hasher);
        hasher.finish() as usize
    }

    fn find_slot(&self, key: DescriptorKey) -> Option<usize> {
        let len = self.slots.len();
        let start = Self::hash(key) % len;
        for probe in 0..len {
            let idx = (start + probe) % len;
            match &self.slots[idx] {
                Slot::Empty => return None,
                Slot::Present { key: k, .. } if *k == key => return Some(idx),
                Slot::Tombstone { key: k } if *k == key => return Some(idx),
                _ => continue,
            }
        }
        None
    }

    fn first_free_or_matching(&self, key: DescriptorKey) -> Option<usize> {
        let len = self.slots.len();
        let start = Self::hash(key) % len;
        for probe in 0..len {
            let idx = (start + probe) % len;
            match &self.slots[idx] {
                Slot::Empty => return Some(idx),
                Slot::Present { key: k, .. } if *k == key => return Some(idx),
                Slot::Tombstone { key: k } if *k == key => return Some(idx),
                _ => continue,
            }
        }
        None
    }

    /// Inserts or republishes `key -> fd`, growing the table first if no
    /// open slot can be found.
    pub fn insert(&mut self, key: DescriptorKey, fd: RawFd) {
        if self.first_free_or_matching(key).is_none() {
            self.grow();
        }
        let idx = self
            .first_free_or_matching(key)
            .expect("grow() always makes room");
        if matches!(self.slots[idx], Slot::Empty) {
            self.occupied += 1;
        }
        self.slots[idx] = Slot::Present { key, fd };
    }

    pub fn lookup(&self, key: DescriptorKey) -> Option<RawFd> {
        match self.find_slot(key).map(|idx| &self.slots[idx]) {
            Some(Slot::Present { fd, .. }) => Some(*fd),
            _ => None,
        }
    }

    /// Marks `key` absent, returning the descriptor that was held (for the
    /// caller to close) if one was present.
    pub fn invalidate(&mut self, key: DescriptorKey) -> Option<RawFd> {
        let idx = self.find_slot(key)?;
        match std::mem::replace(&mut self.slots[idx], Slot::Tombstone { key }) {
            Slot::Present { fd, .. } => Some(fd),
            _ => None,
        }
    }

    fn grow(&mut self) {
        let new_capacity = (self.slots.len() * 3 / 2).max(self.slots.len() + 1);
        let mut grown = Self::with_capacity(new_capacity);
        for slot in &self.slots {
            if let Slot::Present { key, fd } = slot {
                grown.insert(*key, *fd);
            }
        }
        *self = grown;
    }

    pub fn load_factor_exceeded(&self) -> bool {
        self.occupied * MAX_LOAD_DEN >= self.slots.len() * MAX_LOAD_NUM
    }
}

impl Default for Directory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_then_lookup_round_trips() {
        let mut dir = Directory::new();
        let key = DescriptorKey::new(1, 5);
        dir.insert(key, 99);
        assert_eq!(dir.lookup(key), Some(99));
    }

    #[test]
    fn invalidate_then_lookup_is_absent() {
        let mut dir = Directory::new();
        let key = DescriptorKey::new(1, 5);
        dir.insert(key, 99);
        assert_eq!(dir.invalidate(key), Some(99));
        assert_eq!(dir.lookup(key), None);
    }

    #[test]
    fn republish_after_invalidate_does_not_require_rehash() {
        let mut dir = Directory::new();
        let key = DescriptorKey::new(1, 5);
        dir.insert(key, 99);
        dir.invalidate(key);
        dir.insert(key, 100);
        assert_eq!(dir.lookup(key), Some(100));
    }

    #[test]
    fn grows_past_initial_capacity() {
        let mut dir = Directory::with_capacity(4);
        for i in 0..16 {
            dir.insert(DescriptorKey::new(1, i), i);
        }
        for i in 0..16 {
            assert_eq!(dir.lookup(DescriptorKey::new(1, i)), Some(i));
        }
    }
}
