// SPDX-License-Identifier: Apache-2.0

//! Receiver-side cache of active rendezvous mappings (§3 "Region cache").
//!
//! Keyed by [`DescriptorKey`]; entries are installed lazily on the first RV
//! slot that names an unfamiliar key and dropped on a matching
//! RV-INVALIDATE control message.

use crate::error::Result;
use std::collections::HashMap;
use std::os::fd::RawFd;
use xproc_core::DescriptorKey;
use xproc_platform::Driller;

struct Mapping {
    addr: *mut u8,
    len: usize,
}

// SAFETY: `addr` points at a `MAP_SHARED` mapping this cache exclusively
// owns the handle to; access is always read-only memcpy out.
unsafe impl Send for Mapping {}

pub struct RegionCache {
    entries: HashMap<DescriptorKey, Mapping>,
}

impl RegionCache {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Returns a pointer to `buf_offset..buf_offset+len` within the region
    /// named by `key`, mapping it for the first time (or remapping, if the
    /// cached mapping does not cover the requested range) as needed.
    pub fn resolve(
        &mut self,
        driller: &Driller,
        key: DescriptorKey,
        fd: RawFd,
        region_offset: u64,
        region_len: u64,
        buf_offset: u64,
        len: u64,
    ) -> Result<*const u8> {
        let need = (buf_offset + len) as usize;
        let covers = self
            .entries
            .get(&key)
            .is_some_and(|m| need <= m.len);

        if !covers {
            if let Some(old) = self.entries.remove(&key) {
                let _ = driller.unmap_privileged(old.addr, old.len);
            }
            let addr = driller.map_privileged(fd, region_offset, region_len as usize)?;
            self.entries.insert(key, Mapping { addr, len: region_len as usize });
        }

        let mapping = self.entries.get(&key).expect("just inserted or already present");
        Ok(unsafe { mapping.addr.add(buf_offset as usize) })
    }

    /// Drops the cached mapping for `key`, if any (RV-INVALIDATE handling).
    pub fn invalidate(&mut self, driller: &Driller, key: DescriptorKey) {
        if let Some(mapping) = self.entries.remove(&key) {
            let _ = driller.unmap_privileged(mapping.addr, mapping.len);
        }
    }

    pub fn contains(&self, key: DescriptorKey) -> bool {
        self.entries.contains_key(&key)
    }
}

impl Default for RegionCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_empty() {
        let cache = RegionCache::new();
        assert!(!cache.contains(DescriptorKey::new(1, 2)));
    }
}
