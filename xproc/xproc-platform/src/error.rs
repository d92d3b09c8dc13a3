// SPDX-License-Identifier: Apache-2.0

#[derive(Debug, thiserror::Error)]
pub enum DrillerError {
    #[error("driller is not initialized")]
    NotInitialized,

    #[error("driller is already initialized")]
    AlreadyInitialized,

    #[error("{call} failed: {source}")]
    Syscall {
        call: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("could not parse mapping record at line {line}: {text:?}")]
    MapParse { line: usize, text: String },

    #[error("mremap flags {flags:#x} are not supported (only MREMAP_MAYMOVE is)")]
    UnsupportedRemapFlags { flags: i32 },

    #[error(transparent)]
    Region(#[from] xproc_core::CoreError),

    #[error("stack growth rejected: {reason}")]
    StackGrowthRejected { reason: &'static str },

    #[error("heap growth rejected: {reason}")]
    HeapGrowthRejected { reason: &'static str },
}

pub type Result<T> = core::result::Result<T, DrillerError>;

/// Captures `errno`, runs `f`, then restores the original value.
///
/// Every interception entry point must preserve errno across its own
/// execution (§7) since it is invoked transparently from code (including
/// the system allocator) that expects errno to reflect only its own last
/// syscall.
pub fn preserving_errno<T>(f: impl FnOnce() -> T) -> T {
    let saved = errno::errno();
    let result = f();
    errno::set_errno(saved);
    result
}
