// SPDX-License-Identifier: Apache-2.0

//! Shared segment: `nprocs` per-rank records in one `MAP_SHARED` mapping
//! (§3 "Shared segment").
//!
//! This mapping is never drilled: it is already shared, file-backed, and
//! created with an explicit fd, so the interposed `mmap` (which only
//! rewrites private anonymous mappings) passes it straight through.

use crate::error::{MessengerError, Result};
use crate::queue::Queue;
use crate::slot::{MsgSlot, POOL_SIZE};
use std::fs::File;
use std::os::fd::{FromRawFd, IntoRawFd, RawFd};
use std::sync::atomic::{AtomicU8, Ordering};

/// Per-rank record: barrier cell, rendezvous-active flag, the rank's own
/// free-queue and receive-queue, and its slot pool.
#[repr(C, align(64))]
pub struct PerRankRecord {
    pub barrier: AtomicU8,
    pub rv_active: AtomicU8,
    pub free_queue: Queue,
    pub recv_queue: Queue,
    pub pool: [MsgSlot; POOL_SIZE],
}

impl PerRankRecord {
    /// # Safety
    /// `record` must point at a valid, zeroed `PerRankRecord` not yet in use
    /// by any other rank.
    pub unsafe fn init(record: *mut PerRankRecord) {
        (*record).barrier.store(0, Ordering::Relaxed);
        (*record).rv_active.store(0, Ordering::Relaxed);
        Queue::init(&mut (*record).free_queue);
        Queue::init(&mut (*record).recv_queue);
        let pool_ptr = (*record).pool.as_mut_ptr();
        for i in 0..POOL_SIZE {
            let slot = pool_ptr.add(i);
            MsgSlot::init(slot);
            Queue::enqueue(&mut (*record).free_queue, slot);
        }
    }
}

/// `nprocs` contiguous [`PerRankRecord`]s in one shared mapping.
pub struct SharedSegment {
    addr: *mut u8,
    len: usize,
    nprocs: usize,
    fd: RawFd,
}

// SAFETY: the mapping is shared memory; every access goes through atomics or
// the spinlock-guarded list/queue operations defined elsewhere in this crate.
unsafe impl Send for SharedSegment {}
unsafe impl Sync for SharedSegment {}

impl SharedSegment {
    fn record_len(nprocs: usize) -> usize {
        nprocs * std::mem::size_of::<PerRankRecord>()
    }

    /// Creates a fresh backing file sized for `nprocs` ranks, maps it
    /// `MAP_SHARED`, and zero-initializes every rank's record (rank 0 only).
    pub fn create(nprocs: usize) -> Result<Self> {
        let len = Self::record_len(nprocs);
        let file = tempfile::tempfile().map_err(|e| MessengerError::Syscall {
            call: "tempfile",
            source: e,
        })?;
        file.set_len(len as u64).map_err(|e| MessengerError::Syscall {
            call: "ftruncate",
            source: e,
        })?;
        let fd = file.into_raw_fd();
        let segment = Self::map_fd(fd, nprocs, len)?;
        for rank in 0..nprocs {
            unsafe { PerRankRecord::init(segment.rank_ptr(rank)) };
        }
        Ok(segment)
    }

    /// Maps a segment fd handed back by the broker (every rank but the
    /// creator).
    pub fn attach(fd: RawFd, nprocs: usize) -> Result<Self> {
        let len = Self::record_len(nprocs);
        Self::map_fd(fd, nprocs, len)
    }

    fn map_fd(fd: RawFd, nprocs: usize, len: usize) -> Result<Self> {
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(MessengerError::Syscall {
                call: "mmap",
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(Self {
            addr: addr as *mut u8,
            len,
            nprocs,
            fd,
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn nprocs(&self) -> usize {
        self.nprocs
    }

    /// # Panics
    /// If `rank >= self.nprocs()`.
    pub fn rank_ptr(&self, rank: usize) -> *mut PerRankRecord {
        assert!(rank < self.nprocs, "rank out of range");
        unsafe { (self.addr as *mut PerRankRecord).add(rank) }
    }

    /// # Safety
    /// The caller must not let the returned reference outlive `self`, and
    /// must not alias it with an `&mut` access to the same rank.
    pub unsafe fn rank(&self, rank: usize) -> &PerRankRecord {
        &*self.rank_ptr(rank)
    }
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.addr as *mut libc::c_void, self.len);
        }
        unsafe {
            let _ = File::from_raw_fd(self.fd);
        }
    }
}
