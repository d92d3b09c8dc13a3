// SPDX-License-Identifier: Apache-2.0

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("{call} failed: {source}")]
    Syscall {
        call: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed record: {reason}")]
    MalformedRecord { reason: &'static str },

    #[error("connection closed by peer")]
    PeerClosed,

    #[error("timed out connecting to broker after {0:?}")]
    ConnectTimeout(std::time::Duration),

    #[error("descriptor directory is full and could not be grown")]
    DirectoryFull,
}

pub type Result<T> = core::result::Result<T, BrokerError>;
