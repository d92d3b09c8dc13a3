// SPDX-License-Identifier: Apache-2.0

//! Per-rank initialization sequence (§4.3 "Initialization sequence"):
//! participate in broker setup, establish the shared segment, bring up the
//! driller, wire the invalidation callback, then join the startup barrier.

use crate::error::{JobError, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;
use xproc_broker::Client;
use xproc_core::{DescriptorKey, Tunables};
use xproc_messenger::{Messenger, SharedSegment};
use xproc_platform::Driller;

/// Well-known id the shared segment's descriptor is published under. Safe
/// to reuse across jobs because the broker itself is already scoped to one
/// job (one auxiliary process per `jobid`, per §4.1).
const SEGMENT_KEY_ID: i32 = 0;

/// A joined job: this rank's handle onto the broker, driller, and
/// shared-memory messenger for one cooperating group of processes.
pub struct Job {
    messenger: Arc<Messenger>,
}

impl Job {
    /// Joins (or, for rank 0, creates) the job identified by `jobid`.
    ///
    /// # Safety
    /// Rank 0 forks the broker daemon; see [`xproc_broker::Client::fork_broker`]
    /// for the same-constraint this inherits (must run before any other
    /// thread exists in this process).
    pub unsafe fn init(jobid: u32, nprocs: u32, rank: u32, tunables: Tunables) -> Result<Self> {
        let timeout = Duration::from_secs(tunables.connect_timeout_secs);

        if rank == 0 {
            Client::fork_broker(jobid)?;
        }
        let mut broker = Client::connect_with_retry(jobid, timeout)?;

        let segment = if rank == 0 {
            let segment = SharedSegment::create(nprocs as usize).map_err(JobError::Messenger)?;
            let mut key = DescriptorKey::well_known(SEGMENT_KEY_ID);
            broker.publish(&mut key, segment.fd(), std::process::id() as i32)?;
            segment
        } else {
            fetch_segment(&mut broker, nprocs, timeout)?
        };

        let driller = Driller::init(tunables)?;

        let messenger = Arc::new(Messenger::new(broker, driller, segment, rank, nprocs));
        let callback_messenger = Arc::clone(&messenger);
        driller.register_invalidate_cb(move |removed| {
            for region in removed {
                callback_messenger.on_region_invalidated(region);
            }
        });

        messenger.barrier();
        info!(jobid, rank, nprocs, "job initialized");
        Ok(Self { messenger })
    }

    pub fn rank(&self) -> u32 {
        self.messenger.rank()
    }

    pub fn nprocs(&self) -> u32 {
        self.messenger.nprocs()
    }

    pub fn barrier(&self) {
        self.messenger.barrier();
    }

    pub fn send(&self, dest: u32, buf: &[u8]) -> Result<()> {
        self.messenger.send(dest, buf).map_err(JobError::from)
    }

    pub fn recv(&self, src: u32, buf: &mut [u8]) -> Result<usize> {
        self.messenger.recv(src, buf).map_err(JobError::from)
    }
}

fn fetch_segment(broker: &mut Client, nprocs: u32, timeout: Duration) -> Result<SharedSegment> {
    let deadline = Instant::now() + timeout;
    let key = DescriptorKey::well_known(SEGMENT_KEY_ID);
    let mut backoff = Duration::from_millis(5);
    loop {
        if let Some(fd) = broker.lookup(key)? {
            return SharedSegment::attach(fd, nprocs as usize).map_err(JobError::Messenger);
        }
        if Instant::now() >= deadline {
            return Err(JobError::SegmentFetchTimeout(timeout));
        }
        std::thread::sleep(backoff);
        backoff = (backoff * 2).min(Duration::from_millis(250));
    }
}
