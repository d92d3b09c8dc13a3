// SPDX-License-Identifier: Apache-2.0

//! Message slot: the fixed-capacity element of a per-rank pool (§3 "Message
//! slot").

use crate::list::Link;
use xproc_core::DescriptorKey;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// Inline payload capacity; also the fragment size used by the fragmented
/// send path (MSG_PAYLOAD_SIZE_BYTES, default 4 KiB).
pub const PAYLOAD_SIZE_BYTES: usize = 4096;

/// Per-rank slot pool size (MSG_POOL_SIZE).
pub const POOL_SIZE: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgSlotType {
    Free = 0,
    /// Final (or only) fragment of a payload.
    Data = 1,
    /// Non-final fragment; more slots follow for the same logical message.
    Frag = 2,
    /// Carries an [`RvPayload`] instead of inline bytes.
    Rv = 3,
    /// Control message: a previously published region has been invalidated.
    RvInvalidate = 4,
}

impl MsgSlotType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Free),
            1 => Some(Self::Data),
            2 => Some(Self::Frag),
            3 => Some(Self::Rv),
            4 => Some(Self::RvInvalidate),
            _ => None,
        }
    }
}

/// Rendezvous descriptor carried by an [`MsgSlotType::Rv`] slot's payload.
///
/// `region_offset`/`region_len` describe the byte range of the backing file
/// the receiver must map (obtained by `mmap`ing the fd the broker hands back
/// for `key`); `buf_offset`/`len` locate the caller's actual buffer within
/// that mapping.
#[derive(Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct RvPayload {
    pub key: DescriptorKey,
    pub region_offset: u64,
    pub region_len: u64,
    pub buf_offset: u64,
    pub len: u64,
}

const _: () = assert!(std::mem::size_of::<RvPayload>() <= PAYLOAD_SIZE_BYTES);

/// A pool element: intrusive list linkage plus a fixed-size payload that is
/// either inline bytes or an [`RvPayload`] prefix, selected by `ty`.
#[repr(C)]
pub struct MsgSlot {
    pub link: Link,
    ty: u8,
    pub len: u32,
    pub source_rank: u32,
    payload: [u8; PAYLOAD_SIZE_BYTES],
}

impl MsgSlot {
    pub fn slot_type(&self) -> Option<MsgSlotType> {
        MsgSlotType::from_u8(self.ty)
    }

    pub fn set_slot_type(&mut self, ty: MsgSlotType) {
        self.ty = ty as u8;
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Copies `data` into the inline payload and sets `len`.
    ///
    /// # Panics
    /// If `data.len()` exceeds [`PAYLOAD_SIZE_BYTES`].
    pub fn fill_inline(&mut self, ty: MsgSlotType, source_rank: u32, data: &[u8]) {
        assert!(data.len() <= PAYLOAD_SIZE_BYTES, "fragment exceeds slot capacity");
        self.payload[..data.len()].copy_from_slice(data);
        self.len = data.len() as u32;
        self.source_rank = source_rank;
        self.set_slot_type(ty);
    }

    /// Copies the inline payload out to `dst`, returning the number of bytes
    /// written. `dst` must be at least `self.len` bytes.
    pub fn copy_inline_to(&self, dst: &mut [u8]) -> usize {
        let n = self.len as usize;
        dst[..n].copy_from_slice(&self.payload[..n]);
        n
    }

    pub fn fill_rv(&mut self, source_rank: u32, rv: RvPayload) {
        self.payload[..std::mem::size_of::<RvPayload>()].copy_from_slice(rv.as_bytes());
        self.len = std::mem::size_of::<RvPayload>() as u32;
        self.source_rank = source_rank;
        self.set_slot_type(MsgSlotType::Rv);
    }

    pub fn read_rv(&self) -> Option<RvPayload> {
        if self.slot_type() != Some(MsgSlotType::Rv) {
            return None;
        }
        RvPayload::read_from(&self.payload[..std::mem::size_of::<RvPayload>()])
    }

    pub fn fill_rv_invalidate(&mut self, source_rank: u32, key: DescriptorKey) {
        self.payload[..std::mem::size_of::<DescriptorKey>()].copy_from_slice(key.as_bytes());
        self.len = std::mem::size_of::<DescriptorKey>() as u32;
        self.source_rank = source_rank;
        self.set_slot_type(MsgSlotType::RvInvalidate);
    }

    pub fn read_invalidate_key(&self) -> Option<DescriptorKey> {
        if self.slot_type() != Some(MsgSlotType::RvInvalidate) {
            return None;
        }
        DescriptorKey::read_from(&self.payload[..std::mem::size_of::<DescriptorKey>()])
    }

    /// # Safety
    /// `slot` must point at a valid, owned `MsgSlot`.
    pub unsafe fn init(slot: *mut MsgSlot) {
        Link::init(&mut (*slot).link);
        (*slot).ty = MsgSlotType::Free as u8;
        (*slot).len = 0;
        (*slot).source_rank = 0;
        (*slot).payload = [0u8; PAYLOAD_SIZE_BYTES];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank_slot() -> MsgSlot {
        MsgSlot {
            link: Link::new(),
            ty: MsgSlotType::Free as u8,
            len: 0,
            source_rank: 0,
            payload: [0u8; PAYLOAD_SIZE_BYTES],
        }
    }

    #[test]
    fn inline_round_trips() {
        let mut slot = blank_slot();
        let data = b"hello rendezvous-free world";
        slot.fill_inline(MsgSlotType::Data, 3, data);
        assert_eq!(slot.slot_type(), Some(MsgSlotType::Data));
        assert_eq!(slot.source_rank, 3);
        let mut out = vec![0u8; data.len()];
        let n = slot.copy_inline_to(&mut out);
        assert_eq!(n, data.len());
        assert_eq!(&out, data);
    }

    #[test]
    fn rv_payload_round_trips() {
        let mut slot = blank_slot();
        let rv = RvPayload {
            key: DescriptorKey::new(42, 7),
            region_offset: 4096,
            region_len: 8192,
            buf_offset: 128,
            len: 64,
        };
        slot.fill_rv(1, rv);
        assert_eq!(slot.slot_type(), Some(MsgSlotType::Rv));
        let back = slot.read_rv().unwrap();
        assert_eq!(back.key, rv.key);
        assert_eq!(back.region_offset, rv.region_offset);
        assert_eq!(back.len, rv.len);
    }

    #[test]
    fn invalidate_key_round_trips() {
        let mut slot = blank_slot();
        let key = DescriptorKey::new(9, 1);
        slot.fill_rv_invalidate(2, key);
        assert_eq!(slot.slot_type(), Some(MsgSlotType::RvInvalidate));
        assert_eq!(slot.read_invalidate_key(), Some(key));
    }
}
