// SPDX-License-Identifier: Apache-2.0

//! Blocking client surface used by the messenger and by application code
//! (§4.1 "Client surface", §6 "Public client surface").

use crate::address;
use crate::daemon::Daemon;
use crate::error::{BrokerError, Result};
use crate::wire::{Record, RecordType, RECORD_LEN};
use crate::cmsg;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};
use xproc_core::DescriptorKey;
use zerocopy::FromBytes;

pub struct Client {
    stream: UnixStream,
}

impl Client {
    /// Forks the broker daemon (rank 0 only) and returns once it is
    /// accepting connections, or waits out an already-running instance's
    /// bind.
    ///
    /// # Safety
    /// Must be called before any other thread exists in this process;
    /// `fork` in a multi-threaded process is undefined beyond the child
    /// calling async-signal-safe functions, which `Daemon::run` does not
    /// restrict itself to.
    pub unsafe fn fork_broker(proxy_id: u32) -> Result<libc::pid_t> {
        let pid = libc::fork();
        if pid < 0 {
            return Err(BrokerError::Syscall {
                call: "fork",
                source: std::io::Error::last_os_error(),
            });
        }
        if pid == 0 {
            let exit_code = match Daemon::bind(proxy_id).and_then(Daemon::run) {
                Ok(()) => 0,
                Err(_) => 1,
            };
            std::process::exit(exit_code);
        }
        Ok(pid)
    }

    /// Connects to the broker at `proxy_id`, retrying with exponential
    /// backoff until `timeout` elapses (§5 "Cancellation and timeouts").
    pub fn connect_with_retry(proxy_id: u32, timeout: Duration) -> Result<Self> {
        let deadline = Instant::now() + timeout;
        let mut backoff = Duration::from_millis(5);
        loop {
            match address::connect(proxy_id) {
                Ok(stream) => return Ok(Self { stream }),
                Err(_) if Instant::now() < deadline => {
                    std::thread::sleep(backoff);
                    backoff = (backoff * 2).min(Duration::from_millis(250));
                }
                Err(_) => return Err(BrokerError::ConnectTimeout(timeout)),
            }
        }
    }

    /// Publishes `fd` under `key`. If `key`'s owner field is unset, it is
    /// filled in with `owner_id` and `fd` itself, matching `autofill`'s
    /// contract; a caller-assigned well-known key passes through unchanged.
    pub fn publish(&mut self, key: &mut DescriptorKey, fd: RawFd, owner_id: i32) -> Result<()> {
        key.autofill(owner_id, fd);
        self.send(Record::new(RecordType::NewKey, *key), None)?;
        self.send(Record::new(RecordType::AddKey, *key), Some(fd))?;
        let (ack, _) = self.recv()?;
        if ack.record_type() != Some(RecordType::AddKeyAck) || ack.key != *key {
            return Err(BrokerError::MalformedRecord {
                reason: "expected ADD_KEY_ACK echoing the published key",
            });
        }
        Ok(())
    }

    pub fn lookup(&mut self, key: DescriptorKey) -> Result<Option<RawFd>> {
        self.send(Record::new(RecordType::ReqKey, key), None)?;
        let (record, _) = self.recv()?;
        match record.record_type() {
            Some(RecordType::RspNoKey) => Ok(None),
            Some(RecordType::RspKeyFound) => {
                let (record, fd) = self.recv()?;
                if record.record_type() != Some(RecordType::RspKey) {
                    return Err(BrokerError::MalformedRecord {
                        reason: "RSP_KEYFOUND not followed by RSP_KEY",
                    });
                }
                Ok(fd)
            }
            _ => Err(BrokerError::MalformedRecord {
                reason: "unexpected response to REQ_KEY",
            }),
        }
    }

    pub fn invalidate(&mut self, key: DescriptorKey) -> Result<()> {
        self.send(Record::new(RecordType::InvalKey, key), None)
    }

    fn send(&mut self, record: Record, fd: Option<RawFd>) -> Result<()> {
        let bytes = zerocopy::AsBytes::as_bytes(&record);
        cmsg::send_with_fd(self.stream.as_raw_fd(), bytes, fd).map_err(|e| BrokerError::Syscall {
            call: "sendmsg",
            source: e,
        })?;
        Ok(())
    }

    fn recv(&mut self) -> Result<(Record, Option<RawFd>)> {
        let mut buf = [0u8; RECORD_LEN];
        let (n, fd) = cmsg::recv_with_fd(self.stream.as_raw_fd(), &mut buf).map_err(|e| BrokerError::Syscall {
            call: "recvmsg",
            source: e,
        })?;
        if n == 0 {
            return Err(BrokerError::PeerClosed);
        }
        if n != RECORD_LEN {
            return Err(BrokerError::MalformedRecord {
                reason: "short record",
            });
        }
        let record = Record::read_from(&buf[..]).ok_or(BrokerError::MalformedRecord {
            reason: "record did not decode",
        })?;
        if !record.is_valid_magic() {
            return Err(BrokerError::MalformedRecord { reason: "bad magic" });
        }
        Ok((record, fd))
    }
}
