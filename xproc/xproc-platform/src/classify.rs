// SPDX-License-Identifier: Apache-2.0

//! Fallback heap/stack classification for hosts where `/proc/self/maps`
//! pathnames are absent or unreliable (§4.1, "Startup discovery" edge case:
//! "a mapping's purpose must still be inferable without trusting
//! `[heap]`/`[stack]` annotations").
//!
//! The probes are approximate by nature: a local variable's address falls
//! somewhere inside the live stack mapping, and `sbrk(0)` reports the
//! current program break, which sits at or before the end of the heap
//! mapping. Both are only used when the pathname-based classification in
//! [`crate::maps::RawMapping`] comes back empty.

use crate::maps::RawMapping;

/// Returns the mapping (if any) in `mappings` that contains the current
/// stack pointer, approximated by the address of a local variable.
pub fn probe_stack(mappings: &[RawMapping]) -> Option<usize> {
    let marker: u8 = 0;
    let addr = std::ptr::addr_of!(marker) as usize;
    mappings
        .iter()
        .position(|m| m.start <= addr && addr < m.end)
}

/// Returns the mapping (if any) whose end equals the current program break,
/// which is where the heap mapping ends on every platform this targets.
#[cfg(unix)]
pub fn probe_heap(mappings: &[RawMapping]) -> Option<usize> {
    // SAFETY: sbrk(0) only reads the current break, no memory is touched.
    let brk = unsafe { libc::sbrk(0) };
    if brk == (-1isize as *mut libc::c_void) {
        return None;
    }
    let brk = brk as usize;
    mappings.iter().position(|m| m.end == brk)
}

#[cfg(not(unix))]
pub fn probe_heap(_mappings: &[RawMapping]) -> Option<usize> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use xproc_core::Protection;

    fn mapping(start: usize, end: usize) -> RawMapping {
        RawMapping {
            start,
            end,
            protection: Protection::READ | Protection::WRITE,
            offset: 0,
            pathname: None,
        }
    }

    #[test]
    fn probe_stack_finds_enclosing_mapping() {
        let marker: u8 = 0;
        let addr = std::ptr::addr_of!(marker) as usize;
        let mappings = vec![mapping(addr - 0x1000, addr + 0x1000)];
        assert_eq!(probe_stack(&mappings), Some(0));
    }

    #[test]
    fn probe_stack_returns_none_when_no_mapping_contains_it() {
        let mappings = vec![mapping(1, 2)];
        assert_eq!(probe_stack(&mappings), None);
    }
}
