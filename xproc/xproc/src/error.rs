// SPDX-License-Identifier: Apache-2.0

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error(transparent)]
    Broker(#[from] xproc_broker::BrokerError),

    #[error(transparent)]
    Driller(#[from] xproc_platform::DrillerError),

    #[error(transparent)]
    Messenger(#[from] xproc_messenger::MessengerError),

    #[error("{call} failed: {source}")]
    Syscall {
        call: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("well-known shared-segment descriptor was not published within {0:?}")]
    SegmentFetchTimeout(std::time::Duration),
}

pub type Result<T> = core::result::Result<T, JobError>;
