// SPDX-License-Identifier: Apache-2.0

//! `SIGSEGV` handler for on-demand stack growth (§4.3 "Stack growth").
//!
//! Growing the stack on fault must happen without allocating through the
//! normal Rust allocator and without touching the region directory's lock
//! from signal context, since the fault may land while the directory is
//! already held by the very thread taking the fault. The handler therefore
//! only touches a small set of atomics describing the current stack bounds
//! (kept in sync by [`crate::driller::Driller`] on every successful growth)
//! and the real `mmap`, both async-signal-safe in practice on Linux.
//!
//! The installed handler runs on an alternate signal stack (`sigaltstack` +
//! `SA_ONSTACK`) since a stack-overflow fault happens with no usable space
//! left on the faulting stack itself.

use crate::syscalls::real;
use std::os::raw::c_int;
use std::ptr;
use std::sync::atomic::{AtomicI32, AtomicU64, AtomicUsize, Ordering};
use xproc_core::Tunables;

static STACK_LOW: AtomicUsize = AtomicUsize::new(0);
static STACK_HIGH: AtomicUsize = AtomicUsize::new(0);
static BACKING_FD: AtomicI32 = AtomicI32::new(-1);
static MAP_OFFSET: AtomicU64 = AtomicU64::new(0);
static MIN_GROW: AtomicUsize = AtomicUsize::new(0);

static mut PREV_ACTION: libc::sigaction = unsafe { std::mem::zeroed() };
static mut ALTSTACK: Vec<u8> = Vec::new();

/// Records the current stack bounds so the handler can decide whether a
/// fault address is a legitimate growth request. Called by the driller
/// after every successful stack rebuild or growth.
pub fn update_bounds(low: usize, high: usize, backing_fd: i32, map_offset: u64) {
    STACK_LOW.store(low, Ordering::Release);
    STACK_HIGH.store(high, Ordering::Release);
    BACKING_FD.store(backing_fd, Ordering::Release);
    MAP_OFFSET.store(map_offset, Ordering::Release);
}

/// Installs the handler on an alternate signal stack, saving whatever
/// handler was previously registered so it can be chained when a fault is
/// not a stack-growth candidate.
///
/// # Safety
/// Must be called at most once per process; racing with a concurrent
/// `SIGSEGV` on another thread during installation is undefined, matching
/// libc's own `sigaction` contract.
pub unsafe fn install(tunables: &Tunables) -> std::io::Result<()> {
    MIN_GROW.store(tunables.stack_min_grow, Ordering::Release);

    ALTSTACK = vec![0u8; tunables.altstack_size];
    let stack = libc::stack_t {
        ss_sp: ALTSTACK.as_mut_ptr().cast(),
        ss_flags: 0,
        ss_size: ALTSTACK.len(),
    };
    if libc::sigaltstack(&stack, ptr::null_mut()) != 0 {
        return Err(std::io::Error::last_os_error());
    }

    let mut action: libc::sigaction = std::mem::zeroed();
    action.sa_sigaction = handler as usize;
    action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;
    libc::sigemptyset(&mut action.sa_mask);

    if libc::sigaction(libc::SIGSEGV, &action, &mut PREV_ACTION) != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

extern "C" fn handler(sig: c_int, info: *mut libc::siginfo_t, ctx: *mut libc::c_void) {
    let fault_addr = unsafe { (*info).si_addr() } as usize;
    let low = STACK_LOW.load(Ordering::Acquire);
    let high = STACK_HIGH.load(Ordering::Acquire);
    let min_grow = MIN_GROW.load(Ordering::Acquire);

    let is_growth_candidate = low != 0 && fault_addr < low && fault_addr + min_grow >= low;

    if !is_growth_candidate {
        chain_to_previous(sig, info, ctx);
        return;
    }

    let fd = BACKING_FD.load(Ordering::Acquire);
    let map_offset = MAP_OFFSET.load(Ordering::Acquire);
    let new_low = low.saturating_sub(min_grow);
    let grow_len = low - new_low;

    // The file offset for the newly grown region is `map_offset` minus the
    // same distance the address moved down by, mirroring how the stack's
    // live bytes sit at `map_offset` relative to its *current* low address.
    let backing_offset = map_offset.saturating_sub(grow_len as u64);

    let mapped = unsafe {
        (real().mmap)(
            new_low as *mut libc::c_void,
            grow_len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_FIXED,
            fd,
            backing_offset as libc::off_t,
        )
    };

    if mapped == libc::MAP_FAILED || mapped as usize != new_low {
        chain_to_previous(sig, info, ctx);
        return;
    }

    STACK_LOW.store(new_low, Ordering::Release);
    MAP_OFFSET.store(backing_offset, Ordering::Release);
    let _ = high;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;

    /// Drives a real fault through the installed handler: maps a small
    /// "current stack" window backed by a tempfile, registers it via
    /// [`update_bounds`], then touches an address just below the low bound
    /// within one `stack_min_grow` step. A successful write proves the
    /// handler grew the mapping in place instead of letting the fault turn
    /// into a real `SIGSEGV` termination.
    #[test]
    fn fault_just_below_low_bound_grows_the_mapping_in_place() {
        let tunables = Tunables {
            stack_min_grow: 64 * 1024,
            altstack_size: 64 * 1024,
            ..Tunables::default()
        };
        let grow = tunables.stack_min_grow;

        let mut file = tempfile::tempfile().unwrap();
        file.set_len((2 * grow) as u64).unwrap();
        file.write_all(&vec![0u8; 2 * grow]).unwrap();
        let fd = file.as_raw_fd();

        let current_len = grow;
        let current = unsafe {
            (real().mmap)(
                ptr::null_mut(),
                current_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                grow as libc::off_t,
            )
        };
        assert_ne!(current, libc::MAP_FAILED);
        let low = current as usize;
        let high = low + current_len;

        unsafe {
            install(&tunables).unwrap();
        }
        update_bounds(low, high, fd, grow as u64);

        let fault_addr = low - 4096;
        unsafe {
            std::ptr::write_volatile(fault_addr as *mut u8, 0x42);
            assert_eq!(std::ptr::read_volatile(fault_addr as *const u8), 0x42);
        }

        let final_low = STACK_LOW.load(Ordering::Acquire);
        assert!(final_low <= fault_addr);

        unsafe {
            (real().munmap)(final_low as *mut libc::c_void, high - final_low);
        }
    }
}

fn chain_to_previous(sig: c_int, info: *mut libc::siginfo_t, ctx: *mut libc::c_void) {
    unsafe {
        let prev = PREV_ACTION;
        if prev.sa_sigaction == libc::SIG_DFL {
            libc::sigaction(sig, &prev, ptr::null_mut());
            libc::raise(sig);
        } else if prev.sa_sigaction != libc::SIG_IGN {
            if prev.sa_flags & libc::SA_SIGINFO != 0 {
                let f: extern "C" fn(c_int, *mut libc::siginfo_t, *mut libc::c_void) =
                    std::mem::transmute(prev.sa_sigaction);
                f(sig, info, ctx);
            } else {
                let f: extern "C" fn(c_int) = std::mem::transmute(prev.sa_sigaction);
                f(sig);
            }
        }
    }
}
