// SPDX-License-Identifier: Apache-2.0

/// Errors raised by region-directory and descriptor-key bookkeeping.
///
/// These are the only conditions that are recoverable at this layer; the
/// invariant violations called out in the design (interior split of a
/// region, corrupt directory state) are asserted against directly since the
/// design gives them no recovery story.
#[derive(Clone, Copy, Debug, thiserror::Error)]
pub enum CoreError {
    #[error("address range [{start:#x}, {end:#x}) is not covered by any region")]
    NoSuchRegion { start: usize, end: usize },

    #[error("region [{start:#x}, {end:#x}) is not readable")]
    NotReadable { start: usize, end: usize },

    #[error("requested range [{start:#x}, {end:#x}) is only partially covered and would split region [{region_start:#x}, {region_end:#x})")]
    InteriorSplit {
        start: usize,
        end: usize,
        region_start: usize,
        region_end: usize,
    },
}

pub type Result<T> = core::result::Result<T, CoreError>;
