// SPDX-License-Identifier: Apache-2.0

//! Reentrancy gate and internal arena (§5 "Allocator reentrancy", §9
//! "Cyclic region state").
//!
//! The system allocator can call the intercepted `mmap`, which would
//! otherwise re-enter the driller while it is in the middle of mutating its
//! own region directory. The original C implementation breaks this by
//! routing *all* process allocations through a dedicated `mspace` while a
//! global flag is set. Rust gives us no equivalent of overriding
//! `__malloc_hook` process-wide, so — per the design's own fallback for
//! "a target language without free-form global allocator replacement" — we
//! use a thread-local reentrancy counter instead: the intercepted mmap path
//! checks it and, if already inside the driller, delegates to the real
//! syscall without touching the region directory.

use std::cell::Cell;
use std::ptr;
use std::sync::Mutex;

thread_local! {
    static ENTERED: Cell<bool> = const { Cell::new(false) };
}

/// True while the current thread is executing driller-internal bookkeeping.
pub fn is_entered() -> bool {
    ENTERED.with(|c| c.get())
}

/// RAII gate: held only by the *outermost* driller entry on this thread.
/// A nested (reentrant) call observes [`Guard::enter`] returning `None` and
/// should delegate to the underlying syscall instead of recursing into the
/// region directory.
pub struct Guard(());

impl Guard {
    pub fn enter() -> Option<Self> {
        let was_entered = ENTERED.with(|c| c.replace(true));
        if was_entered {
            None
        } else {
            Some(Self(()))
        }
    }
}

impl Drop for Guard {
    fn drop(&mut self) {
        ENTERED.with(|c| c.set(false));
    }
}

/// A small bump arena backing [`crate::Driller::malloc_internal`], used only
/// for the driller's own short-lived bookkeeping allocations made while
/// [`is_entered`] — never by application code.
///
/// Individual blocks are never freed; the original's analogous `mspace` is
/// likewise never shrunk, only abandoned wholesale when the process exits.
/// `free_internal` is therefore a deliberate no-op, not an oversight.
pub struct Arena {
    base: *mut u8,
    size: usize,
    used: Mutex<usize>,
}

// SAFETY: access to `used` is serialized by the mutex; `base` points to a
// fixed-size mapping that outlives the `Arena` and is never reallocated.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    /// Maps `size` bytes directly via the real `mmap` (not through the
    /// driller's own interception, which does not exist yet at the point
    /// this is called during `Driller::init`).
    pub fn new(size: usize) -> std::io::Result<Self> {
        #[cfg(unix)]
        {
            // SAFETY: standard anonymous mapping, no fd, no fixed address.
            let base = unsafe {
                libc::mmap(
                    ptr::null_mut(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                    -1,
                    0,
                )
            };
            if base == libc::MAP_FAILED {
                return Err(std::io::Error::last_os_error());
            }
            Ok(Self {
                base: base.cast(),
                size,
                used: Mutex::new(0),
            })
        }
        #[cfg(not(unix))]
        {
            let _ = size;
            Err(std::io::Error::other("xproc-platform requires a unix target"))
        }
    }

    /// Bump-allocates `size` bytes aligned to `align`, or returns null if
    /// the arena is exhausted.
    pub fn malloc(&self, size: usize, align: usize) -> *mut u8 {
        let mut used = self.used.lock().unwrap();
        let base_addr = self.base as usize;
        let aligned = (base_addr + *used + align - 1) & !(align - 1);
        let offset = aligned - base_addr;
        if offset + size > self.size {
            return ptr::null_mut();
        }
        *used = offset + size;
        aligned as *mut u8
    }

    /// No-op: see the struct-level doc comment.
    pub fn free(&self, _ptr: *mut u8) {}
}

impl Drop for Arena {
    fn drop(&mut self) {
        #[cfg(unix)]
        unsafe {
            libc::munmap(self.base.cast(), self.size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_rejects_nested_entry() {
        assert!(!is_entered());
        let outer = Guard::enter();
        assert!(outer.is_some());
        assert!(is_entered());
        let inner = Guard::enter();
        assert!(inner.is_none(), "nested entry must be rejected");
        assert!(is_entered());
        drop(outer);
        assert!(!is_entered());
    }

    #[test]
    fn arena_bump_allocates_within_bounds() {
        let arena = Arena::new(4096).unwrap();
        let a = arena.malloc(64, 8);
        let b = arena.malloc(64, 8);
        assert!(!a.is_null());
        assert!(!b.is_null());
        assert_ne!(a, b);
    }

    #[test]
    fn arena_returns_null_when_exhausted() {
        let arena = Arena::new(4096).unwrap();
        assert!(!arena.malloc(4096, 1).is_null());
        assert!(arena.malloc(1, 1).is_null());
    }
}
