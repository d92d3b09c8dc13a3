// SPDX-License-Identifier: Apache-2.0

//! Seed scenario 1 (§8): rank 1 allocates 8 MiB on the heap, fills it with a
//! linear pattern, and sends it to rank 0, which asserts every byte
//! survived. Exercises the rendezvous path, since the buffer lies inside
//! the heap region the driller took over at startup.

mod support;

use support::{run_job, wait_all_ok};
use xproc::JobError;

const SIZE: usize = 8 * 1024 * 1024;

#[test]
fn heap_buffer_survives_rendezvous_round_trip() {
    let pids = run_job(2, |job| -> Result<(), JobError> {
        if job.rank() == 1 {
            let mut buf = vec![0u8; SIZE];
            for (i, b) in buf.iter_mut().enumerate() {
                *b = (i % 251) as u8;
            }
            job.barrier();
            job.send(0, &buf)?;
        } else {
            job.barrier();
            let mut buf = vec![0u8; SIZE];
            let n = job.recv(1, &mut buf)?;
            assert_eq!(n, SIZE);
            for (i, b) in buf.iter().enumerate() {
                assert_eq!(*b, (i % 251) as u8, "mismatch at byte {i}");
            }
        }
        Ok(())
    });
    wait_all_ok(pids);
}
