// SPDX-License-Identifier: Apache-2.0

//! The broker's fixed wire record (§4.1 "Wire protocol").
//!
//! Every message, in either direction, is this same 16-byte record;
//! descriptors travel as `SCM_RIGHTS` ancillary data on the carrier message
//! that needs one, never inline in the record itself.

use xproc_core::DescriptorKey;
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

pub const MAGIC: u32 = 0x5850_524F; // "XPRO"

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    NewKey = 1,
    AddKey = 2,
    AddKeyAck = 3,
    ReqKey = 4,
    RspKeyFound = 5,
    RspKey = 6,
    RspNoKey = 7,
    InvalKey = 8,
}

impl RecordType {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            1 => Self::NewKey,
            2 => Self::AddKey,
            3 => Self::AddKeyAck,
            4 => Self::ReqKey,
            5 => Self::RspKeyFound,
            6 => Self::RspKey,
            7 => Self::RspNoKey,
            8 => Self::InvalKey,
            _ => return None,
        })
    }

    /// Whether this record type carries a descriptor as ancillary data
    /// alongside it (§4.1's "Control data" column).
    pub fn carries_fd(self) -> bool {
        matches!(self, Self::AddKey | Self::RspKey)
    }
}

/// The fixed record itself, carried over the broker's stream socket.
#[derive(Clone, Copy, Debug, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct Record {
    pub magic: u32,
    pub ty: u8,
    _pad: [u8; 3],
    pub key: DescriptorKey,
}

impl Record {
    pub fn new(ty: RecordType, key: DescriptorKey) -> Self {
        Self {
            magic: MAGIC,
            ty: ty as u8,
            _pad: [0; 3],
            key,
        }
    }

    pub fn record_type(&self) -> Option<RecordType> {
        RecordType::from_u8(self.ty)
    }

    pub fn is_valid_magic(&self) -> bool {
        self.magic == MAGIC
    }
}

pub const RECORD_LEN: usize = std::mem::size_of::<Record>();

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_round_trips_through_bytes() {
        let key = DescriptorKey::new(7, 42);
        let record = Record::new(RecordType::ReqKey, key);
        let bytes = zerocopy::AsBytes::as_bytes(&record);
        let decoded = Record::read_from(bytes).unwrap();
        assert!(decoded.is_valid_magic());
        assert_eq!(decoded.record_type(), Some(RecordType::ReqKey));
        assert_eq!(decoded.key, key);
    }

    #[test]
    fn add_key_and_rsp_key_carry_descriptors() {
        assert!(RecordType::AddKey.carries_fd());
        assert!(RecordType::RspKey.carries_fd());
        assert!(!RecordType::NewKey.carries_fd());
    }
}
