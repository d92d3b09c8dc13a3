// SPDX-License-Identifier: Apache-2.0

//! Seed scenario 4 (§8): rank 0 publishes a descriptor under a well-known
//! id; other ranks look it up, write through it, and close; rank 0
//! invalidates it afterward and a subsequent lookup must return absent.

use std::io::Write;
use std::os::fd::{FromRawFd, RawFd};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use xproc_broker::Client;
use xproc_core::DescriptorKey;

const WELL_KNOWN_ID: i32 = 0x123;

fn fresh_proxy_id() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .subsec_nanos()
        ^ std::process::id()
}

#[test]
fn published_descriptor_is_usable_by_other_ranks_and_absent_after_invalidate() {
    let proxy_id = fresh_proxy_id();
    let timeout = Duration::from_secs(5);

    // SAFETY: single-threaded test process.
    unsafe { Client::fork_broker(proxy_id) }.unwrap();

    let mut publisher = Client::connect_with_retry(proxy_id, timeout).unwrap();
    let (reader_fd, writer_fd) = pipe();
    let mut key = DescriptorKey::well_known(WELL_KNOWN_ID);
    publisher.publish(&mut key, writer_fd, std::process::id() as i32).unwrap();
    unsafe { libc::close(writer_fd) };

    let mut consumer = Client::connect_with_retry(proxy_id, timeout).unwrap();
    let fd = consumer
        .lookup(DescriptorKey::well_known(WELL_KNOWN_ID))
        .unwrap()
        .expect("descriptor should be published");
    let mut file = unsafe { std::fs::File::from_raw_fd(fd) };
    file.write_all(b"hello from another rank\n").unwrap();
    drop(file);

    // `read_exact` rather than `read_to_end`: the broker still holds its own
    // duplicate of the write end (closed only by `invalidate`, below), so
    // EOF never arrives on this pipe until then.
    let message = b"hello from another rank\n";
    let mut out = vec![0u8; message.len()];
    {
        use std::io::Read;
        let mut reader = unsafe { std::fs::File::from_raw_fd(reader_fd) };
        reader.read_exact(&mut out).unwrap();
    }
    assert_eq!(out, message);

    publisher.invalidate(DescriptorKey::well_known(WELL_KNOWN_ID)).unwrap();
    let after = consumer.lookup(DescriptorKey::well_known(WELL_KNOWN_ID)).unwrap();
    assert!(after.is_none(), "lookup after invalidate must return absent");
}

fn pipe() -> (RawFd, RawFd) {
    let mut fds = [0 as RawFd; 2];
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
    assert_eq!(rc, 0);
    (fds[0], fds[1])
}
