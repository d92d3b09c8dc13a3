// SPDX-License-Identifier: Apache-2.0

//! Per-connection protocol state machine (§4.1 "Per-connection state
//! machine").

use crate::cmsg;
use crate::directory::Directory;
use crate::error::{BrokerError, Result};
use crate::wire::{Record, RecordType, RECORD_LEN};
use mio::net::UnixStream;
use mio::Interest;
use std::os::fd::AsRawFd;
use xproc_core::DescriptorKey;
use zerocopy::FromBytes;

#[derive(Clone, Copy, Debug)]
enum State {
    Idle,
    AwaitAdd { key: DescriptorKey },
    AwaitAckSend { key: DescriptorKey },
    AwaitResponseSend { key: DescriptorKey },
}

pub struct Connection {
    pub stream: UnixStream,
    state: State,
    alive: bool,
}

impl Connection {
    pub fn new(stream: UnixStream) -> Self {
        Self {
            stream,
            state: State::Idle,
            alive: true,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    pub fn interest(&self) -> Interest {
        match self.state {
            State::Idle | State::AwaitAdd { .. } => Interest::READABLE,
            State::AwaitAckSend { .. } | State::AwaitResponseSend { .. } => Interest::WRITABLE,
        }
    }

    pub fn on_readable(&mut self, directory: &mut Directory) -> Result<()> {
        let mut buf = [0u8; RECORD_LEN];
        let fd = self.stream.as_raw_fd();
        let (n, passed_fd) = cmsg::recv_with_fd(fd, &mut buf).map_err(|e| BrokerError::Syscall {
            call: "recvmsg",
            source: e,
        })?;

        if n == 0 {
            self.alive = false;
            return Ok(());
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
        let ty = record.record_type().ok_or(BrokerError::MalformedRecord {
            reason: "unknown record type",
        })?;

        match (self.state, ty) {
            (State::Idle, RecordType::NewKey) => {
                self.state = State::AwaitAdd { key: record.key };
            }
            (State::Idle, RecordType::ReqKey) => {
                self.state = State::AwaitResponseSend { key: record.key };
            }
            (State::Idle, RecordType::InvalKey) => {
                if let Some(fd) = directory.invalidate(record.key) {
                    unsafe {
                        libc::close(fd);
                    }
                }
            }
            (State::AwaitAdd { key }, RecordType::AddKey) => {
                let fd = passed_fd.ok_or(BrokerError::MalformedRecord {
                    reason: "ADD_KEY carried no descriptor",
                })?;
                directory.insert(key, fd);
                self.state = State::AwaitAckSend { key };
            }
            _ => {
                return Err(BrokerError::MalformedRecord {
                    reason: "record not valid for current connection state",
                });
            }
        }
        Ok(())
    }

    pub fn on_writable(&mut self, directory: &Directory) -> Result<()> {
        match self.state {
            State::AwaitAckSend { key } => {
                self.send(Record::new(RecordType::AddKeyAck, key), None)?;
                self.state = State::Idle;
            }
            State::AwaitResponseSend { key } => {
                match directory.lookup(key) {
                    Some(fd) => {
                        self.send(Record::new(RecordType::RspKeyFound, key), None)?;
                        self.send(Record::new(RecordType::RspKey, key), Some(fd))?;
                    }
                    None => {
                        self.send(Record::new(RecordType::RspNoKey, key), None)?;
                    }
                }
                self.state = State::Idle;
            }
            State::Idle | State::AwaitAdd { .. } => {}
        }
        Ok(())
    }

    fn send(&mut self, record: Record, fd: Option<i32>) -> Result<()> {
        let bytes = zerocopy::AsBytes::as_bytes(&record);
        cmsg::send_with_fd(self.stream.as_raw_fd(), bytes, fd).map_err(|e| BrokerError::Syscall {
            call: "sendmsg",
            source: e,
        })?;
        Ok(())
    }
}
