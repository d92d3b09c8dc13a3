// SPDX-License-Identifier: Apache-2.0

//! Shared types for the `xproc` zero-copy shared-memory IPC substrate.
//!
//! This crate has no syscalls of its own: it defines the region record and
//! region directory (§3 "Region record" / "Region directory"), the
//! descriptor key shared between the broker and the messenger, the tunable
//! defaults, and the error types every other `xproc-*` crate composes into
//! its own `Error`.

#![forbid(unsafe_code)]

pub mod error;
pub mod key;
pub mod region;
pub mod tunables;

pub use error::{CoreError, Result};
pub use key::DescriptorKey;
pub use region::{Kind, Protection, Region, RegionDirectory, RegionId};
pub use tunables::Tunables;
