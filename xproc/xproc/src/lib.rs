// SPDX-License-Identifier: Apache-2.0

//! Zero-copy, shared-memory message-passing substrate for cooperating
//! processes on a single host (see the top-level design notes shipped with
//! this repository).
//!
//! Large messages are transmitted without a copy at the sender: the
//! sender's own pages, including its stack and heap, are exposed as
//! file-backed shared memory by [`xproc_platform::Driller`], and the
//! receiver maps those pages directly. Short payloads and control traffic
//! ride a fixed-size shared-memory message ring ([`xproc_messenger`]); file
//! descriptors are redistributed among participants by a small auxiliary
//! broker process ([`xproc_broker`]).
//!
//! [`Job::init`] runs the full per-rank startup sequence and is the only
//! entry point application code needs.

mod error;
mod job;

pub use error::{JobError, Result};
pub use job::Job;
pub use xproc_core::{DescriptorKey, Tunables};
