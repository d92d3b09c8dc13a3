// SPDX-License-Identifier: Apache-2.0

//! Resolves the real `mmap`/`munmap`/`mremap`/`brk`/`sbrk` behind whatever
//! symbol currently owns those names in the process (§4.2 "Interception
//! contracts").
//!
//! When this crate is loaded with `LD_PRELOAD` (the `preload` feature), the
//! dynamic linker resolves calls to these names to *our* shims first. To
//! call through to what libc itself implements, every shim must go through
//! `dlsym(RTLD_NEXT, ...)` rather than calling `libc::mmap` directly, which
//! would just call the shim again. When this crate is linked as a plain
//! rlib (no `preload`), `RTLD_NEXT` still resolves correctly to libc's own
//! symbol since nothing has interposed it.

use std::ffi::{c_char, c_int, c_void, CStr};
use std::sync::OnceLock;

type MmapFn = unsafe extern "C" fn(*mut c_void, usize, c_int, c_int, c_int, libc::off_t) -> *mut c_void;
type MunmapFn = unsafe extern "C" fn(*mut c_void, usize) -> c_int;
type MremapFn = unsafe extern "C" fn(*mut c_void, usize, usize, c_int, ...) -> *mut c_void;
type BrkFn = unsafe extern "C" fn(*mut c_void) -> c_int;
type SbrkFn = unsafe extern "C" fn(libc::intptr_t) -> *mut c_void;

pub struct RealSyscalls {
    pub mmap: MmapFn,
    pub munmap: MunmapFn,
    pub mremap: MremapFn,
    pub brk: BrkFn,
    pub sbrk: SbrkFn,
}

static REAL: OnceLock<RealSyscalls> = OnceLock::new();

/// Resolves and caches pointers to the real syscalls. Panics if any symbol
/// cannot be resolved — without a real `mmap` nothing in this crate can
/// function, so there is no degraded mode to fall back to.
pub fn real() -> &'static RealSyscalls {
    REAL.get_or_init(|| unsafe {
        RealSyscalls {
            mmap: std::mem::transmute::<*mut c_void, MmapFn>(resolve(
                CStr::from_bytes_with_nul(b"mmap\0").unwrap(),
            )),
            munmap: std::mem::transmute::<*mut c_void, MunmapFn>(resolve(
                CStr::from_bytes_with_nul(b"munmap\0").unwrap(),
            )),
            mremap: std::mem::transmute::<*mut c_void, MremapFn>(resolve(
                CStr::from_bytes_with_nul(b"mremap\0").unwrap(),
            )),
            brk: std::mem::transmute::<*mut c_void, BrkFn>(resolve(
                CStr::from_bytes_with_nul(b"brk\0").unwrap(),
            )),
            sbrk: std::mem::transmute::<*mut c_void, SbrkFn>(resolve(
                CStr::from_bytes_with_nul(b"sbrk\0").unwrap(),
            )),
        }
    })
}

unsafe fn resolve(name: &CStr) -> *mut c_void {
    let ptr = libc::dlsym(libc::RTLD_NEXT, name.as_ptr() as *const c_char);
    assert!(
        !ptr.is_null(),
        "dlsym(RTLD_NEXT, {:?}) failed: the real symbol must exist",
        name
    );
    ptr
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_real_mmap_and_can_round_trip_a_page() {
        let real = real();
        unsafe {
            let page = (real.mmap)(
                std::ptr::null_mut(),
                4096,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                -1,
                0,
            );
            assert_ne!(page, libc::MAP_FAILED);
            assert_eq!((real.munmap)(page, 4096), 0);
        }
    }
}
