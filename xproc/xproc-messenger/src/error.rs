// SPDX-License-Identifier: Apache-2.0

#[derive(Debug, thiserror::Error)]
pub enum MessengerError {
    #[error("{call} failed: {source}")]
    Syscall {
        call: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Broker(#[from] xproc_broker::BrokerError),

    #[error(transparent)]
    Driller(#[from] xproc_platform::DrillerError),

    #[error("message slot pool exhausted on rank {rank}")]
    PoolExhausted { rank: u32 },

    #[error("a buffer spanning multiple regions cannot use rendezvous; fragment it instead")]
    BufferNotFullyCovered,

    #[error("malformed message slot: {reason}")]
    MalformedSlot { reason: &'static str },

    #[error("broker connect/shared-segment fetch exceeded {0:?}")]
    ConnectTimeout(std::time::Duration),
}

pub type Result<T> = core::result::Result<T, MessengerError>;
