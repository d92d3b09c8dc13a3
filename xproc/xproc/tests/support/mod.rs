// SPDX-License-Identifier: Apache-2.0

//! Multi-process test harness shared by the end-to-end scenarios (§8).
//!
//! Each scenario forks one process per rank directly from the test binary;
//! rank 0's `Job::init` in turn forks the broker daemon, so the process
//! tree for an `nprocs`-rank test is the harness plus `nprocs` rank
//! processes plus one broker grandchild.

#![allow(dead_code)]

use std::time::{SystemTime, UNIX_EPOCH};
use xproc::{Job, JobError, Tunables};

/// A jobid unlikely to collide with another test running concurrently in
/// the same binary (abstract-namespace sockets are process-tree-wide).
pub fn fresh_jobid() -> u32 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .subsec_nanos();
    nanos ^ std::process::id()
}

/// Forks `nprocs` rank processes, each running `Job::init` then `body`.
/// Returns the child pids for [`wait_all_ok`].
pub fn run_job<F>(nprocs: u32, body: F) -> Vec<libc::pid_t>
where
    F: Fn(&Job) -> Result<(), JobError> + Copy,
{
    let jobid = fresh_jobid();
    let mut pids = Vec::with_capacity(nprocs as usize);
    for rank in 0..nprocs {
        // SAFETY: forked before any other thread exists in this test binary.
        let pid = unsafe { libc::fork() };
        assert!(pid >= 0, "fork failed");
        if pid == 0 {
            let exit_code = match unsafe { Job::init(jobid, nprocs, rank, Tunables::default()) } {
                Ok(job) => match body(&job) {
                    Ok(()) => 0,
                    Err(e) => {
                        eprintln!("rank {rank} failed: {e}");
                        1
                    }
                },
                Err(e) => {
                    eprintln!("rank {rank} init failed: {e}");
                    1
                }
            };
            std::process::exit(exit_code);
        }
        pids.push(pid);
    }
    pids
}

/// Waits for every rank process and asserts it exited successfully.
pub fn wait_all_ok(pids: Vec<libc::pid_t>) {
    for pid in pids {
        let mut status: libc::c_int = 0;
        let rc = unsafe { libc::waitpid(pid, &mut status, 0) };
        assert_eq!(rc, pid, "waitpid failed for {pid}");
        assert!(
            libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == 0,
            "rank process {pid} exited abnormally: status={status}"
        );
    }
}
