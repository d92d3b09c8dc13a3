// SPDX-License-Identifier: Apache-2.0

//! The address-space driller: rewrites a process's private heap, stack, and
//! ad-hoc anonymous mappings as shared, file-backed regions, and tracks the
//! result so the messenger can hand them to peer processes (§3, §4, §5).
//!
//! Everything here is platform-specific and `unsafe`-heavy by nature — this
//! crate is the only place in the workspace that touches raw mappings,
//! signal handling, or `dlsym`. [`xproc_core`] holds the data structures
//! this crate populates.

mod allocator;
mod classify;
mod driller;
mod error;
mod maps;
mod rebuild;
mod segv;
mod syscalls;

#[cfg(feature = "preload")]
mod shim;

pub use driller::Driller;
pub use error::{preserving_errno, DrillerError, Result};
pub use maps::RawMapping;
