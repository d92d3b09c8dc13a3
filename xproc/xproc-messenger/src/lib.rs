// SPDX-License-Identifier: Apache-2.0

//! Shared-memory messenger: message queues, the two-phase barrier, and the
//! rendezvous large-transfer protocol built on top of the descriptor broker
//! and the driller (§3 "Shared-memory messenger", §4.3).

mod barrier;
mod error;
mod list;
mod messenger;
mod queue;
mod region_cache;
mod segment;
mod slot;
mod spinlock;

pub use error::{MessengerError, Result};
pub use messenger::Messenger;
pub use segment::{PerRankRecord, SharedSegment};
pub use slot::{MsgSlotType, PAYLOAD_SIZE_BYTES, POOL_SIZE};
