// SPDX-License-Identifier: Apache-2.0

use core::fmt;
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

/// Owner value of a key that has not yet been assigned an owner: the
/// broker's `publish` fills this in with the caller's identity (§4.1
/// "Client surface" — "if key's owner field is zero, broker fills it").
pub const OWNER_UNSET: i32 = 0;

/// Sentinel owner identity used for caller-chosen "well-known" keys.
///
/// A descriptor published under a well-known id is found by every rank that
/// knows the id, rather than only by the rank that published it. Distinct
/// from [`OWNER_UNSET`] so a freshly default-constructed key is always
/// treated as needing autofill, never mistaken for a well-known one.
pub const OWNER_WELLKNOWN: i32 = -1;

/// Identifies a descriptor across participants: (owner-identity, local-id).
///
/// Owner-identity is the publishing process's pid except when the caller
/// picks [`OWNER_WELLKNOWN`], in which case `local_id` is a caller-chosen
/// integer instead of an fd number. Two keys are equal iff both fields
/// match — this type derives `PartialEq`/`Eq`/`Hash` structurally, which is
/// exactly that comparison.
///
/// `repr(C)` and the zerocopy traits let this type be embedded directly in
/// the broker's wire record (§4.1) and in a rendezvous message slot (§3)
/// without a serialization step.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct DescriptorKey {
    owner: i32,
    local_id: i32,
}

impl DescriptorKey {
    /// A key with the owner left unset; the broker's `publish` fills in the
    /// owner (pid) and id (fd number) for a key in this state.
    pub const UNSET: Self = Self {
        owner: OWNER_UNSET,
        local_id: 0,
    };

    pub fn new(owner: i32, local_id: i32) -> Self {
        Self { owner, local_id }
    }

    /// Assigns a caller-chosen well-known id, bypassing the publish-time
    /// owner/id autofill.
    pub fn well_known(id: i32) -> Self {
        Self {
            owner: OWNER_WELLKNOWN,
            local_id: id,
        }
    }

    pub fn owner(&self) -> i32 {
        self.owner
    }

    pub fn local_id(&self) -> i32 {
        self.local_id
    }

    pub fn is_well_known(&self) -> bool {
        self.owner == OWNER_WELLKNOWN
    }

    fn is_unset(&self) -> bool {
        self.owner == OWNER_UNSET
    }

    /// Fills in the owner/id fields from the publishing process, but only
    /// if the key is still unset; a caller-assigned well-known key (or any
    /// other already-owned key) passes through unchanged (§4.1 "Client
    /// surface").
    pub fn autofill(&mut self, owner: i32, local_id: i32) {
        if self.is_unset() {
            self.owner = owner;
            self.local_id = local_id;
        }
    }
}

impl fmt::Display for DescriptorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.local_id)
    }
}

impl fmt::Debug for DescriptorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DescriptorKey({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn autofill_preserves_well_known() {
        let mut key = DescriptorKey::well_known(0x123);
        key.autofill(42, 7);
        assert_eq!(key, DescriptorKey::well_known(0x123));
    }

    #[test]
    fn autofill_sets_unset_key() {
        let mut key = DescriptorKey::UNSET;
        key.autofill(42, 7);
        assert_eq!(key, DescriptorKey::new(42, 7));
    }

    #[test]
    fn display_matches_original_keystr_format() {
        let key = DescriptorKey::new(42, 7);
        assert_eq!(key.to_string(), "42/7");
    }

    #[test]
    fn equality_is_structural() {
        assert_eq!(DescriptorKey::new(1, 2), DescriptorKey::new(1, 2));
        assert_ne!(DescriptorKey::new(1, 2), DescriptorKey::new(1, 3));
        assert_ne!(DescriptorKey::new(1, 2), DescriptorKey::new(2, 2));
    }
}
