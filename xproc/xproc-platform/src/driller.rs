// SPDX-License-Identifier: Apache-2.0

//! The driller: turns a process's private mappings into shared, file-backed
//! ones and keeps a directory of the result (§3, §4).
//!
//! One [`Driller`] exists per process, reached through [`Driller::global`]
//! after [`Driller::init`] has run. Interception entry points (`shim.rs`)
//! and the messenger both go through this type rather than touching
//! [`xproc_core::RegionDirectory`] directly, since every mutation has to be
//! paired with the matching mmap/munmap and, on removal, the invalidation
//! callback that tells the messenger's region cache to drop its mapping.

use crate::allocator::{Arena, Guard};
use crate::error::{DrillerError, Result};
use crate::maps;
use crate::rebuild;
use crate::segv;
use crate::syscalls::real;
use std::ffi::c_void;
use std::fs::File;
use std::io::Read as _;
use std::os::fd::{AsRawFd, IntoRawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};
use tracing::{debug, info, warn};
use xproc_core::{Kind, Protection, Region, RegionDirectory, RegionId, Tunables};

static DRILLER: OnceLock<Driller> = OnceLock::new();

type InvalidateCallback = dyn Fn(&[Region]) + Send + Sync;

pub struct Driller {
    directory: Mutex<RegionDirectory>,
    tunables: Tunables,
    arena: Arena,
    invalidate_cb: Mutex<Option<Box<InvalidateCallback>>>,
    initialized: AtomicBool,
}

impl Driller {
    /// Discovers the current heap and stack, rebuilds both as shared,
    /// file-backed regions, installs the `SIGSEGV` stack-growth handler,
    /// and publishes the singleton returned by [`Driller::global`].
    ///
    /// Must run before any other rank has a chance to intercept a mapping
    /// call on this process (§4.1 "Startup discovery" — "runs once, early,
    /// before application code has made any mapping calls of its own that
    /// the directory needs to know about").
    pub fn init(tunables: Tunables) -> Result<&'static Driller> {
        if DRILLER.get().is_some() {
            return Err(DrillerError::AlreadyInitialized);
        }

        let mut contents = String::new();
        File::open("/proc/self/maps")
            .and_then(|mut f| f.read_to_string(&mut contents))
            .map_err(|e| DrillerError::Syscall {
                call: "open(/proc/self/maps)",
                source: e,
            })?;
        let mappings = maps::parse(&contents)?;

        let heap_idx = mappings
            .iter()
            .position(maps::RawMapping::is_heap)
            .or_else(|| crate::classify::probe_heap(&mappings));
        let stack_idx = mappings
            .iter()
            .position(maps::RawMapping::is_stack)
            .or_else(|| crate::classify::probe_stack(&mappings));

        let arena = Arena::new(1 << 20).map_err(|e| DrillerError::Syscall {
            call: "mmap(internal arena)",
            source: e,
        })?;

        let driller = Driller {
            directory: Mutex::new(RegionDirectory::new()),
            tunables,
            arena,
            invalidate_cb: Mutex::new(None),
            initialized: AtomicBool::new(false),
        };

        if let Some(idx) = heap_idx {
            driller.take_over_heap(&mappings[idx])?;
        } else {
            warn!("no heap mapping found during startup discovery; heap sharing disabled");
        }

        if let Some(idx) = stack_idx {
            driller.take_over_stack(&mappings[idx])?;
        } else {
            warn!("no stack mapping found during startup discovery; stack sharing disabled");
        }

        // SAFETY: runs once, before any other thread can be relying on the
        // stack bounds the handler reads.
        unsafe {
            segv::install(&driller.tunables).map_err(|e| DrillerError::Syscall {
                call: "sigaction(SIGSEGV)",
                source: e,
            })?;
        }

        driller.initialized.store(true, Ordering::Release);
        DRILLER
            .set(driller)
            .unwrap_or_else(|_| unreachable!("checked above that it was unset"));
        info!("driller initialized");
        Ok(DRILLER.get().unwrap())
    }

    pub fn global() -> Result<&'static Driller> {
        DRILLER.get().filter(|d| d.initialized.load(Ordering::Acquire)).ok_or(DrillerError::NotInitialized)
    }

    fn take_over_heap(&self, mapping: &maps::RawMapping) -> Result<()> {
        let file = backing_file(mapping.end - mapping.start)?;
        let len = mapping.end - mapping.start;
        // SAFETY: staging then MAP_FIXED remap, matching `rebuild_stack`'s
        // approach but without the scratch-context switch: unlike the
        // stack, the heap is not the memory the current call is running on.
        unsafe {
            let copy_dst = (real().mmap)(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            );
            if copy_dst == libc::MAP_FAILED {
                return Err(DrillerError::Syscall {
                    call: "mmap(heap staging)",
                    source: std::io::Error::last_os_error(),
                });
            }
            std::ptr::copy_nonoverlapping(mapping.start as *const u8, copy_dst.cast::<u8>(), len);
            let fixed = (real().mmap)(
                mapping.start as *mut c_void,
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_FIXED,
                file.as_raw_fd(),
                0,
            );
            if fixed == libc::MAP_FAILED || fixed as usize != mapping.start {
                return Err(DrillerError::Syscall {
                    call: "mmap(heap, MAP_FIXED)",
                    source: std::io::Error::last_os_error(),
                });
            }
            (real().munmap)(copy_dst, len);
        }

        let mut dir = self.directory.lock().unwrap();
        let id = dir.next_id();
        dir.insert(Region::new(
            id,
            mapping.start,
            mapping.end,
            Protection::READ | Protection::WRITE,
            0,
            Kind::Heap,
            #[cfg(unix)]
            Some(file.into_raw_fd()),
            Some("[heap]".to_string()),
        ));
        debug!(start = mapping.start, end = mapping.end, "heap region installed");
        Ok(())
    }

    fn take_over_stack(&self, mapping: &maps::RawMapping) -> Result<()> {
        let len = mapping.end - mapping.start;
        let file = backing_file(self.tunables.stack_map_offset as usize + len)?;
        let fd = file.as_raw_fd();

        // SAFETY: single rebuild in flight, required by `rebuild_stack`.
        unsafe {
            rebuild::rebuild_stack(mapping.start, mapping.end, fd, &self.tunables)?;
        }

        segv::update_bounds(mapping.start, mapping.end, fd, self.tunables.stack_map_offset);

        let mut dir = self.directory.lock().unwrap();
        let id = dir.next_id();
        dir.insert(Region::new(
            id,
            mapping.start,
            mapping.end,
            Protection::READ | Protection::WRITE,
            self.tunables.stack_map_offset,
            Kind::Stack,
            #[cfg(unix)]
            Some(file.into_raw_fd()),
            Some("[stack]".to_string()),
        ));
        debug!(start = mapping.start, end = mapping.end, "stack region installed");
        Ok(())
    }

    /// Registers the callback invoked with every region removed by
    /// [`Driller::remove_map`] (§4.2 "Invalidation propagation"). The
    /// messenger uses this to drop matching entries from its region cache.
    pub fn register_invalidate_cb(&self, cb: impl Fn(&[Region]) + Send + Sync + 'static) {
        *self.invalidate_cb.lock().unwrap() = Some(Box::new(cb));
    }

    pub fn lookup_map(&self, addr: usize, len: usize) -> Option<Region> {
        self.directory.lock().unwrap().lookup(addr, len).cloned()
    }

    /// Stamps a region's user cookie (§9 "Per-region user cookie") — the
    /// messenger's index into its own table of descriptor-publishing
    /// records, so a second send into the same region finds the existing
    /// publish instead of republishing. Returns `false` if `id` is gone
    /// (the region was invalidated between the caller's lookup and this
    /// call).
    pub fn set_region_cookie(&self, id: RegionId, cookie: u64) -> bool {
        let mut dir = self.directory.lock().unwrap();
        match dir.by_id_mut(id) {
            Some(region) => {
                region.set_cookie(cookie);
                true
            }
            None => false,
        }
    }

    /// Mints an id and records a new region without performing the
    /// underlying mapping (callers have already done that); used by the
    /// mmap/mremap shims once the real syscall has succeeded.
    #[allow(clippy::too_many_arguments)]
    pub fn install_new_region(
        &self,
        start: usize,
        end: usize,
        protection: Protection,
        offset: u64,
        kind: Kind,
        #[cfg(unix)] fd: Option<std::os::fd::RawFd>,
        path: Option<String>,
    ) -> RegionId {
        let mut dir = self.directory.lock().unwrap();
        let id = dir.next_id();
        dir.insert(Region::new(
            id,
            start,
            end,
            protection,
            offset,
            kind,
            #[cfg(unix)]
            fd,
            path,
        ));
        id
    }

    pub fn remove_map(&self, start: usize, end: usize) -> Result<()> {
        let removed = self.directory.lock().unwrap().invalidate_range(start, end)?;
        if removed.is_empty() {
            return Ok(());
        }
        for region in &removed {
            #[cfg(unix)]
            if let Some(fd) = region.fd() {
                unsafe {
                    libc::close(fd);
                }
            }
        }
        if let Some(cb) = self.invalidate_cb.lock().unwrap().as_ref() {
            cb(&removed);
        }
        Ok(())
    }

    /// Allocates from the internal arena for driller-owned bookkeeping made
    /// while [`Guard::enter`] reports reentrancy (§5).
    pub fn malloc_internal(&self, size: usize) -> *mut u8 {
        self.arena.malloc(size, std::mem::align_of::<usize>())
    }

    pub fn free_internal(&self, ptr: *mut u8) {
        self.arena.free(ptr);
    }

    pub fn tunables(&self) -> &Tunables {
        &self.tunables
    }

    /// True while the current thread is already inside driller bookkeeping;
    /// intercepted calls observing this should delegate straight to the
    /// real syscall (§5, §9).
    pub fn is_reentrant() -> bool {
        crate::allocator::is_entered()
    }

    pub(crate) fn enter_guard() -> Option<Guard> {
        Guard::enter()
    }

    /// Maps `len` bytes of `fd` at `offset`, `MAP_SHARED`, via the real
    /// `mmap` rather than whatever symbol currently owns that name.
    ///
    /// Used for rendezvous receives (§4.3 "Receive path" — "install a fresh
    /// mapping via a privileged path in the driller that bypasses the
    /// intercepted `mmap`"): a normal `mmap` call here would, under
    /// `LD_PRELOAD`, run back through this crate's own shim and get turned
    /// into yet another region the directory has to track, which is not
    /// what a one-off rendezvous mapping needs.
    pub fn map_privileged(&self, fd: std::os::fd::RawFd, offset: u64, len: usize) -> Result<*mut u8> {
        let addr = unsafe {
            (real().mmap)(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_SHARED,
                fd,
                offset as libc::off_t,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(DrillerError::Syscall {
                call: "mmap(rendezvous, privileged)",
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(addr.cast::<u8>())
    }

    /// Unmaps a region previously mapped by [`Driller::map_privileged`].
    pub fn unmap_privileged(&self, addr: *mut u8, len: usize) -> Result<()> {
        let rc = unsafe { (real().munmap)(addr.cast::<std::ffi::c_void>(), len) };
        if rc != 0 {
            return Err(DrillerError::Syscall {
                call: "munmap(rendezvous, privileged)",
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    /// Extends the heap region to cover `new_end`, called from the `brk`/
    /// `sbrk` shims after the real syscall has moved the break (§4.2 "Heap
    /// growth"). A request at or below the current heap end is a no-op.
    ///
    /// Truncates the heap's backing file out to the new length, then
    /// `MAP_FIXED`-remaps the newly grown range onto it, the same staging
    /// technique `take_over_heap` uses at startup, applied only to the
    /// freshly grown tail instead of the whole region.
    pub fn grow_heap(&self, new_end: usize) -> Result<()> {
        let mut dir = self.directory.lock().unwrap();
        let region = dir.heap_mut().ok_or(DrillerError::HeapGrowthRejected {
            reason: "no heap region installed",
        })?;

        if new_end <= region.end() {
            return Ok(());
        }

        #[cfg(unix)]
        let fd = region.fd().ok_or(DrillerError::HeapGrowthRejected {
            reason: "heap region has no backing descriptor",
        })?;
        let heap_start = region.start();
        let old_end = region.end();
        let base_offset = region.offset();

        let file_len = base_offset + (new_end - heap_start) as u64;
        let rc = unsafe { libc::ftruncate(fd, file_len as libc::off_t) };
        if rc != 0 {
            return Err(DrillerError::Syscall {
                call: "ftruncate(heap growth)",
                source: std::io::Error::last_os_error(),
            });
        }

        let grow_start = old_end;
        let grow_len = new_end - old_end;
        let grow_offset = base_offset + (old_end - heap_start) as u64;

        // SAFETY: `[grow_start, new_end)` is the range the real `brk`/`sbrk`
        // just mapped as anonymous pages; replacing it in place with a
        // file-backed mapping over the same addresses keeps it within the
        // already file-backed heap region.
        unsafe {
            let fixed = (real().mmap)(
                grow_start as *mut c_void,
                grow_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_FIXED,
                fd,
                grow_offset as libc::off_t,
            );
            if fixed == libc::MAP_FAILED || fixed as usize != grow_start {
                return Err(DrillerError::Syscall {
                    call: "mmap(heap growth, MAP_FIXED)",
                    source: std::io::Error::last_os_error(),
                });
            }
        }

        region.extend_end(new_end);
        Ok(())
    }
}

fn backing_file(min_size: usize) -> Result<File> {
    let file = tempfile::tempfile().map_err(|e| DrillerError::Syscall {
        call: "tempfile",
        source: e,
    })?;
    file.set_len(min_size as u64).map_err(|e| DrillerError::Syscall {
        call: "ftruncate",
        source: e,
    })?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_driller() -> Driller {
        Driller {
            directory: Mutex::new(RegionDirectory::new()),
            tunables: Tunables::default(),
            arena: Arena::new(4096).unwrap(),
            invalidate_cb: Mutex::new(None),
            initialized: AtomicBool::new(true),
        }
    }

    #[test]
    fn grow_heap_is_a_no_op_at_or_below_current_end() {
        let driller = bare_driller();
        let file = backing_file(4096).unwrap();
        let heap_start = 0x2000_0000_0000usize;
        {
            let mut dir = driller.directory.lock().unwrap();
            let id = dir.next_id();
            dir.insert(Region::new(
                id,
                heap_start,
                heap_start + 4096,
                Protection::READ | Protection::WRITE,
                0,
                Kind::Heap,
                #[cfg(unix)]
                Some(file.as_raw_fd()),
                Some("[heap]".to_string()),
            ));
        }

        driller.grow_heap(heap_start + 4096).unwrap();
        driller.grow_heap(heap_start).unwrap();

        let dir = driller.directory.lock().unwrap();
        assert_eq!(dir.heap().unwrap().end(), heap_start + 4096);
    }

    #[test]
    fn grow_heap_extends_region_and_backing_file() {
        let driller = bare_driller();
        let heap_len = 4096;
        let file = backing_file(heap_len).unwrap();
        let fd = file.as_raw_fd();

        // Reserve a real mapping so the grown tail lands on already-valid
        // address space, mirroring what the kernel's own brk/sbrk would
        // have done before this shim runs.
        let addr = unsafe {
            (real().mmap)(
                std::ptr::null_mut(),
                heap_len * 2,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        assert_ne!(addr, libc::MAP_FAILED);
        let heap_start = addr as usize;

        {
            let mut dir = driller.directory.lock().unwrap();
            let id = dir.next_id();
            dir.insert(Region::new(
                id,
                heap_start,
                heap_start + heap_len,
                Protection::READ | Protection::WRITE,
                0,
                Kind::Heap,
                #[cfg(unix)]
                Some(fd),
                Some("[heap]".to_string()),
            ));
        }

        let new_end = heap_start + heap_len * 2;
        driller.grow_heap(new_end).unwrap();

        {
            let dir = driller.directory.lock().unwrap();
            assert_eq!(dir.heap().unwrap().end(), new_end);
        }
        assert_eq!(file.metadata().unwrap().len(), (heap_len * 2) as u64);

        unsafe {
            (real().munmap)(addr, heap_len * 2);
        }
    }

    #[test]
    fn grow_heap_rejects_when_no_heap_region_installed() {
        let driller = bare_driller();
        let err = driller.grow_heap(0x1000).unwrap_err();
        assert!(matches!(err, DrillerError::HeapGrowthRejected { .. }));
    }
}
