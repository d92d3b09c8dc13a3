// SPDX-License-Identifier: Apache-2.0

//! Seed scenario 6 (§8): rank 1 sends a large rendezvous buffer to rank 2,
//! then unmaps it. Rank 1's next send must still be delivered cleanly,
//! which only happens if rank 2 transparently absorbed the RV-INVALIDATE
//! fanned out by the unmap instead of getting stuck or corrupting its
//! recv-queue bookkeeping.

mod support;

use support::{run_job, wait_all_ok};
use xproc::JobError;

const SIZE: usize = 1024 * 1024;

#[test]
fn unmapping_a_published_region_does_not_disrupt_the_next_send() {
    let pids = run_job(2, |job| -> Result<(), JobError> {
        if job.rank() == 1 {
            let mut buf = vec![0u8; SIZE];
            for (i, b) in buf.iter_mut().enumerate() {
                *b = (i % 37) as u8;
            }
            job.barrier();
            job.send(0, &buf)?;
            job.barrier();

            // Drops the allocation backing the region just published; a
            // large enough allocation is served by the system allocator's
            // own `mmap`, so freeing it runs back through the intercepted
            // `munmap` and fans RV-INVALIDATE out to every rank the region
            // was published to.
            drop(buf);
            job.barrier();

            job.send(0, b"still alive".as_slice())?;
        } else {
            job.barrier();
            let mut buf = vec![0u8; SIZE];
            let n = job.recv(1, &mut buf)?;
            assert_eq!(n, SIZE);
            for (i, b) in buf.iter().enumerate() {
                assert_eq!(*b, (i % 37) as u8, "mismatch at byte {i}");
            }
            job.barrier();
            job.barrier();

            let mut tail = vec![0u8; b"still alive".len()];
            let n = job.recv(1, &mut tail)?;
            assert_eq!(n, tail.len());
            assert_eq!(&tail, b"still alive");
        }
        Ok(())
    });
    wait_all_ok(pids);
}
