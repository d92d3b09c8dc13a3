// SPDX-License-Identifier: Apache-2.0

//! Stack rebuild: copies the live stack into a file-backed region without
//! ever running on memory that is itself being remapped (§4.3 "Stack
//! rebuild").
//!
//! The running thread cannot remap its own stack out from under itself, so
//! the rebuild runs on a scratch stack reached via `swapcontext`, following
//! the approach of the original `map_overload_stack`: switch onto scratch
//! memory, perform the mmap/copy/remap sequence there (where the scratch
//! stack, not the region being rewritten, is live), then switch back.

use crate::error::{DrillerError, Result};
use crate::syscalls::real;
use std::cell::Cell;
use std::ffi::c_void;
use std::mem::MaybeUninit;
use xproc_core::Tunables;

struct StackPlan {
    stack_start: usize,
    stack_end: usize,
    backing_fd: i32,
    map_offset: u64,
}

thread_local! {
    static SCRATCH_RESULT: Cell<Option<std::result::Result<(), &'static str>>> = const { Cell::new(None) };
    static PENDING_PLAN: Cell<*const StackPlan> = const { Cell::new(std::ptr::null()) };
}

/// Rebuilds `[stack_start, stack_end)` as a file-backed mapping at
/// `backing_fd`, with the live stack bytes placed at
/// `tunables.stack_map_offset` inside the file so the stack can grow
/// downward into the file without colliding with data placed at offset 0
/// (§3 "Stack backing layout").
///
/// # Safety
/// Must be called with no other thread depending on `[stack_start,
/// stack_end)` remaining valid for the duration of the call, and only once
/// per process (the scratch stack and saved context are not reentrant).
pub unsafe fn rebuild_stack(
    stack_start: usize,
    stack_end: usize,
    backing_fd: i32,
    tunables: &Tunables,
) -> Result<()> {
    let plan = StackPlan {
        stack_start,
        stack_end,
        backing_fd,
        map_offset: tunables.stack_map_offset,
    };

    let mut scratch = vec![0u8; tunables.altstack_size];
    let mut caller_ctx: MaybeUninit<libc::ucontext_t> = MaybeUninit::uninit();
    let mut scratch_ctx: MaybeUninit<libc::ucontext_t> = MaybeUninit::uninit();

    if libc::getcontext(scratch_ctx.as_mut_ptr()) != 0 {
        return Err(DrillerError::Syscall {
            call: "getcontext",
            source: std::io::Error::last_os_error(),
        });
    }
    let scratch_ctx_ref = &mut *scratch_ctx.as_mut_ptr();
    scratch_ctx_ref.uc_stack.ss_sp = scratch.as_mut_ptr().cast();
    scratch_ctx_ref.uc_stack.ss_size = scratch.len();
    scratch_ctx_ref.uc_link = caller_ctx.as_mut_ptr();

    PENDING_PLAN.with(|p| p.set(&plan as *const StackPlan));
    SCRATCH_RESULT.with(|r| r.set(None));

    libc::makecontext(scratch_ctx.as_mut_ptr(), trampoline_entry, 0);

    if libc::swapcontext(caller_ctx.as_mut_ptr(), scratch_ctx.as_mut_ptr()) != 0 {
        return Err(DrillerError::Syscall {
            call: "swapcontext",
            source: std::io::Error::last_os_error(),
        });
    }

    match SCRATCH_RESULT.with(|r| r.take()) {
        Some(Ok(())) => Ok(()),
        Some(Err(reason)) => Err(DrillerError::StackGrowthRejected { reason }),
        None => Err(DrillerError::StackGrowthRejected {
            reason: "scratch context returned without recording a result",
        }),
    }
}

extern "C" fn trampoline_entry() {
    // SAFETY: set immediately before the swapcontext that lands here, and
    // this context is never entered concurrently (single rebuild in flight
    // per process, enforced by the caller's safety contract).
    let plan = PENDING_PLAN.with(|p| p.get());
    let result = unsafe { run_on_scratch_stack(&*plan) };
    SCRATCH_RESULT.with(|r| r.set(Some(result)));
    // Returning here unwinds via uc_link back to the caller's context.
}

unsafe fn run_on_scratch_stack(plan: &StackPlan) -> std::result::Result<(), &'static str> {
    let len = plan.stack_end - plan.stack_start;

    // Stage the live bytes into the backing file at the configured offset
    // before remapping: once the remap lands, the old private pages are
    // gone, so the copy must happen first and land somewhere durable.
    let file_map = real().mmap;
    let staging = (file_map)(
        std::ptr::null_mut(),
        len,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_SHARED,
        plan.backing_fd,
        plan.map_offset as libc::off_t,
    );
    if staging == libc::MAP_FAILED {
        return Err("failed to stage backing file region for stack copy");
    }

    std::ptr::copy_nonoverlapping(plan.stack_start as *const u8, staging.cast::<u8>(), len);

    let fixed = (file_map)(
        plan.stack_start as *mut c_void,
        len,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_SHARED | libc::MAP_FIXED,
        plan.backing_fd,
        plan.map_offset as libc::off_t,
    );
    if fixed == libc::MAP_FAILED || fixed as usize != plan.stack_start {
        return Err("MAP_FIXED remap of stack range did not land at the expected address");
    }

    (real().munmap)(staging, len);
    Ok(())
}
