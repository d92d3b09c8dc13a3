// SPDX-License-Identifier: Apache-2.0

//! Seed scenario 2 (§8): rank 1 places a 64 KiB array on its stack, writes
//! sentinels at the first and last byte, and sends it; rank 0 asserts both
//! sentinels survived. Exercises the stack being file-backed — a plain
//! `memcpy`-based IPC would never see rank 1's stack contents at all.

mod support;

use support::{run_job, wait_all_ok};
use xproc::JobError;

const SIZE: usize = 64 * 1024;

#[test]
fn stack_buffer_survives_rendezvous_round_trip() {
    let pids = run_job(2, |job| -> Result<(), JobError> {
        if job.rank() == 1 {
            let mut buf = [0u8; SIZE];
            buf[0] = 0xAB;
            buf[SIZE - 1] = 0xCD;
            job.barrier();
            job.send(0, &buf)?;
        } else {
            job.barrier();
            let mut buf = vec![0u8; SIZE];
            let n = job.recv(1, &mut buf)?;
            assert_eq!(n, SIZE);
            assert_eq!(buf[0], 0xAB);
            assert_eq!(buf[SIZE - 1], 0xCD);
        }
        Ok(())
    });
    wait_all_ok(pids);
}
