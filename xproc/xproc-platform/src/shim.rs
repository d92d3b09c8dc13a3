// SPDX-License-Identifier: Apache-2.0

//! `extern "C"` interposition points for `LD_PRELOAD` deployment (§4.2
//! "Interception contracts"). Only compiled with the `preload` feature;
//! every other crate links [`crate::driller::Driller`] directly instead.

use crate::driller::Driller;
use crate::error::preserving_errno;
use crate::syscalls::real;
use libc::{c_int, c_void, off_t, size_t};
use xproc_core::{Kind, Protection};

fn protection_from_prot(prot: c_int) -> Protection {
    let mut p = Protection::empty();
    if prot & libc::PROT_READ != 0 {
        p |= Protection::READ;
    }
    if prot & libc::PROT_WRITE != 0 {
        p |= Protection::WRITE;
    }
    if prot & libc::PROT_EXEC != 0 {
        p |= Protection::EXEC;
    }
    p
}

/// Replaces a freshly created private anonymous mapping with a shared,
/// file-backed one at the same address, and records it (§3 "Region
/// record"). Called only while the reentrancy guard is held, so the mmap
/// this issues to back the region is itself safe from recursing here.
unsafe fn rewrite_private_anonymous(driller: &Driller, addr: usize, len: usize, prot: c_int) {
    let Ok(file) = tempfile::tempfile() else {
        return;
    };
    if file.set_len(len as u64).is_err() {
        return;
    }
    let fd = std::os::fd::AsRawFd::as_raw_fd(&file);

    let remapped = (real().mmap)(
        addr as *mut c_void,
        len,
        prot,
        libc::MAP_SHARED | libc::MAP_FIXED,
        fd,
        0,
    );
    if remapped == libc::MAP_FAILED || remapped as usize != addr {
        return;
    }

    let _ = driller.remove_map(addr, addr + len);
    driller.install_new_region(
        addr,
        addr + len,
        protection_from_prot(prot),
        0,
        Kind::Regular,
        #[cfg(unix)]
        Some(std::os::fd::IntoRawFd::into_raw_fd(file)),
        None,
    );
}

#[no_mangle]
pub unsafe extern "C" fn mmap(
    addr: *mut c_void,
    len: size_t,
    prot: c_int,
    flags: c_int,
    fd: c_int,
    offset: off_t,
) -> *mut c_void {
    preserving_errno(|| {
        if Driller::is_reentrant() {
            return (real().mmap)(addr, len, prot, flags, fd, offset);
        }
        let _guard = Driller::enter_guard();
        let ptr = (real().mmap)(addr, len, prot, flags, fd, offset);
        if ptr == libc::MAP_FAILED {
            return ptr;
        }
        if flags & libc::MAP_ANONYMOUS != 0 && flags & libc::MAP_PRIVATE != 0 && prot & libc::PROT_READ != 0 {
            if let Ok(driller) = Driller::global() {
                rewrite_private_anonymous(driller, ptr as usize, len, prot);
            }
        }
        ptr
    })
}

#[no_mangle]
pub unsafe extern "C" fn munmap(addr: *mut c_void, len: size_t) -> c_int {
    preserving_errno(|| {
        let result = (real().munmap)(addr, len);
        if result == 0 && !Driller::is_reentrant() {
            if let Ok(driller) = Driller::global() {
                let _ = driller.remove_map(addr as usize, addr as usize + len);
            }
        }
        result
    })
}

#[no_mangle]
pub unsafe extern "C" fn mremap(
    addr: *mut c_void,
    old_len: size_t,
    new_len: size_t,
    flags: c_int,
) -> *mut c_void {
    preserving_errno(|| {
        let new_addr = (real().mremap)(addr, old_len, new_len, flags);
        if new_addr == libc::MAP_FAILED || Driller::is_reentrant() {
            return new_addr;
        }
        let Ok(driller) = Driller::global() else {
            return new_addr;
        };
        let existing = driller.lookup_map(addr as usize, old_len);
        let _ = driller.remove_map(addr as usize, addr as usize + old_len);
        if let Some(old_region) = existing {
            driller.install_new_region(
                new_addr as usize,
                new_addr as usize + new_len,
                old_region.protection(),
                old_region.offset(),
                old_region.kind(),
                #[cfg(unix)]
                old_region.fd(),
                old_region.path().map(str::to_string),
            );
        }
        new_addr
    })
}

#[no_mangle]
pub unsafe extern "C" fn brk(addr: *mut c_void) -> c_int {
    preserving_errno(|| {
        let result = (real().brk)(addr);
        if result == 0 && !Driller::is_reentrant() {
            if let Ok(driller) = Driller::global() {
                let _ = driller.grow_heap(addr as usize);
            }
        }
        result
    })
}

#[no_mangle]
pub unsafe extern "C" fn sbrk(increment: libc::intptr_t) -> *mut c_void {
    preserving_errno(|| {
        let prev = (real().sbrk)(increment);
        if prev as isize != -1 && !Driller::is_reentrant() {
            if let Ok(driller) = Driller::global() {
                let new_end = (prev as usize).wrapping_add(increment as usize);
                let _ = driller.grow_heap(new_end);
            }
        }
        prev
    })
}
