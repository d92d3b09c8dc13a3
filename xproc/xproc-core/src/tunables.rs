// SPDX-License-Identifier: Apache-2.0

/// Compile-time-documented, runtime-overridable knobs (§6 "Tunables").
///
/// Unlike the teacher's QUIC stack, this is a library embedded in a single
/// process tree, not a standalone daemon — these are a plain struct with
/// `Default` matching the documented defaults, set by the embedding
/// application before [`Tunables`] is handed to `Job::init`, not read from
/// environment variables or a config file.
#[derive(Clone, Debug)]
pub struct Tunables {
    /// Offset, in bytes, from the start of the stack's backing file to the
    /// live stack data; also the largest distance the stack can grow.
    /// 128 GiB on LP64 Linux, 1 GiB elsewhere.
    pub stack_map_offset: u64,
    /// Size of the scratch stack used to rebuild the live stack, and of the
    /// `SIGSEGV` handler's alternate signal stack. Must be at least the
    /// platform's minimum signal stack size.
    pub altstack_size: usize,
    /// Minimum amount the stack region is grown by on each fault.
    pub stack_min_grow: usize,
    /// Size of the guard region placed below the stack on hosts that do not
    /// report `SEGV_MAPERR` for unmapped stack growth. Linux does, so this
    /// is unused there.
    pub stack_guard_size: usize,
    /// Maximum inline payload carried by a single fragment slot.
    pub msg_payload_size_bytes: usize,
    /// Number of message slots in each rank's pool.
    pub msg_pool_size: usize,
    /// Alignment, in bytes, of the hot fields of the shared segment.
    pub cacheline_align: usize,
    /// Bound, in seconds, on broker-connect and shared-segment-fetch retry.
    pub connect_timeout_secs: u64,
    /// Maximum simultaneous broker client connections.
    pub fdproxy_max_clients: usize,
    /// Initial bucket count of the broker's descriptor hash table.
    pub fdtable_hsize_init: usize,
    /// Size, in bytes, above which a send prefers fragmentation over
    /// rendezvous even when the buffer lies inside a known region. The
    /// default of 0 means "always prefer rendezvous".
    pub msg_driller_size_threshold: usize,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            stack_map_offset: Self::default_stack_map_offset(),
            altstack_size: 64 * 1024,
            stack_min_grow: 1024 * 1024,
            stack_guard_size: 1024 * 1024,
            msg_payload_size_bytes: 4096,
            msg_pool_size: 1024,
            cacheline_align: 64,
            connect_timeout_secs: 5,
            fdproxy_max_clients: 32,
            fdtable_hsize_init: 32,
            msg_driller_size_threshold: 0,
        }
    }
}

impl Tunables {
    #[cfg(all(target_pointer_width = "64", target_os = "linux"))]
    const fn default_stack_map_offset() -> u64 {
        1 << 37 // 128 GiB
    }

    #[cfg(not(all(target_pointer_width = "64", target_os = "linux")))]
    const fn default_stack_map_offset() -> u64 {
        1 << 30 // 1 GiB
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let t = Tunables::default();
        assert_eq!(t.msg_payload_size_bytes, 4096);
        assert_eq!(t.msg_pool_size, 1024);
        assert_eq!(t.msg_driller_size_threshold, 0);
        assert_eq!(t.connect_timeout_secs, 5);
    }
}
